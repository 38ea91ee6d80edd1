//! Worker output storage: a bounded ring of recent lines shared between
//! the stream readers and the quiescence/crash logic, plus an optional
//! append-only session log file.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;

/// One raw line as received from the worker.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub message: String,
    /// Monotonic receive time, used for age checks.
    pub received_at: Instant,
    /// Wall-clock receive time, for display.
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe bounded buffer of the most recent worker lines.
///
/// Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct RecentLines {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    // A panic while holding the lock leaves the deque intact, so keep using it.
    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, line: &str) {
        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogEntry {
            message: line.to_string(),
            received_at: Instant::now(),
            timestamp: Utc::now(),
        });
    }

    /// Up to `n` newest entries, oldest first.
    pub fn last(&self, n: usize) -> Vec<LogEntry> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Age of the newest entry, `None` when empty.
    pub fn newest_age(&self) -> Option<Duration> {
        self.lock()
            .back()
            .map(|e| Instant::now().saturating_duration_since(e.received_at))
    }

    /// Last `n` messages joined with newlines, prefixed with `...`.
    pub fn tail_text(&self, n: usize) -> String {
        let tail: Vec<String> = self.last(n).into_iter().map(|e| e.message).collect();
        if tail.is_empty() {
            "...".to_string()
        } else {
            format!("...\n{}", tail.join("\n"))
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Append-only log of every raw worker line. A no-op without a path.
///
/// Lines are stamped on arrival and written by a dedicated thread, so
/// [`append`](Self::append) never waits on the disk. Dropping the last
/// clone flushes what is queued.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    writer: Option<Arc<LogWriter>>,
}

#[derive(Debug)]
struct LogWriter {
    tx: Option<mpsc::Sender<String>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit.
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl SessionLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::disabled());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("session-log".to_string())
            .spawn(move || write_lines(BufWriter::new(file), rx))?;

        Ok(Self {
            writer: Some(Arc::new(LogWriter {
                tx: Some(tx),
                thread: Some(thread),
            })),
        })
    }

    /// Queue one line for writing.
    pub fn append(&self, line: &str) {
        let Some(tx) = self.writer.as_ref().and_then(|w| w.tx.as_ref()) else {
            return;
        };
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if tx.send(format!("[{}] {}", stamp, line)).is_err() {
            tracing::debug!("Session log writer has stopped");
        }
    }
}

/// Write until every sender is gone, flushing once per burst of lines.
fn write_lines(mut writer: BufWriter<File>, rx: mpsc::Receiver<String>) {
    while let Ok(first) = rx.recv() {
        let mut result = writeln!(writer, "{}", first);
        while let Ok(next) = rx.try_recv() {
            result = result.and_then(|_| writeln!(writer, "{}", next));
        }
        if let Err(e) = result.and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "Failed to write session log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let lines = RecentLines::new(3);
        for i in 0..5 {
            lines.push(&format!("line {}", i));
        }
        let kept: Vec<String> = lines.last(10).into_iter().map(|e| e.message).collect();
        assert_eq!(kept, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_text() {
        let lines = RecentLines::new(10);
        assert_eq!(lines.tail_text(8), "...");
        lines.push("a");
        lines.push("b");
        lines.push("c");
        assert_eq!(lines.tail_text(2), "...\nb\nc");
    }

    #[test]
    fn test_clones_share_buffer() {
        let a = RecentLines::new(4);
        let b = a.clone();
        a.push("x");
        assert_eq!(b.len(), 1);
        b.clear();
        assert!(a.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_age() {
        let lines = RecentLines::new(4);
        assert_eq!(lines.newest_age(), None);
        lines.push("x");
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(lines.newest_age(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_session_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("worker.txt");
        let log = SessionLog::open(Some(&path)).unwrap();
        let reader_side = log.clone();
        log.append("Model loaded");
        reader_side.append("42%|####| 12/30");
        drop(log);
        drop(reader_side);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Model loaded"));

        SessionLog::disabled().append("ignored");
    }
}
