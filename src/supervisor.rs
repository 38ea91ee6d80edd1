//! Owns the worker process: start, reuse, restart, kill, and crash
//! detection.
//!
//! One [`WorkerSession`] drives at most one worker at a time. A worker is
//! reused while its [`WorkerFingerprint`] matches, since loading a model
//! takes far longer than generating an image.

use crate::config::SupervisorConfig;
use crate::error::{Result, WorkerError};
use crate::events::{EventSink, WorkerEvent};
use crate::launch::{LaunchSpec, WorkerFingerprint};
use crate::log_buffer::{RecentLines, SessionLog};
use crate::parser::{OutputParser, ProgressState};
use crate::protocol::WorkerCommand;
use crate::quiescence::await_quiescence;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Lifecycle of the current worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    NoProcess,
    Starting,
    Running,
    Exited,
    KilledIntentionally,
}

/// Snapshot of the worker a run is talking to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub worker_id: Uuid,
    pub pid: Option<u32>,
    pub fingerprint: WorkerFingerprint,
    pub started_at: DateTime<Utc>,
    /// `true` when an already-running worker was kept.
    pub reused: bool,
}

/// Cloneable cancel switch for a session, usable from other tasks.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Stop further writes and event emission. Does not talk to the worker;
    /// use [`WorkerSession::cancel`] for that.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct RunningWorker {
    handle: WorkerHandle,
    stdin: Option<ChildStdin>,
    /// Set before any supervisor-initiated kill. One flag per process, so a
    /// restart can't clear it before the old watchdog has looked.
    intentional: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    kill_tx: Option<oneshot::Sender<()>>,
    /// Flips to `true` once the watchdog has classified the exit.
    decided: watch::Receiver<bool>,
    watchdog: JoinHandle<()>,
    readers: Vec<AbortHandle>,
}

impl RunningWorker {
    fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn is_alive(&self) -> bool {
        matches!(self.state(), WorkerState::Starting | WorkerState::Running)
    }
}

/// A single supervised worker plus the state parsed from its output.
pub struct WorkerSession {
    config: SupervisorConfig,
    events: EventSink,
    parser: Arc<Mutex<OutputParser>>,
    recent: RecentLines,
    cancelled: Arc<AtomicBool>,
    crash: Arc<Mutex<Option<String>>>,
    worker: Option<RunningWorker>,
    retired: Vec<JoinHandle<()>>,
    retired_readers: Vec<AbortHandle>,
}

impl WorkerSession {
    /// Create a session and the receiver for its events.
    pub fn new(config: SupervisorConfig) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let session_log = SessionLog::open(config.session_log_path.as_deref())?;
        let (events, rx) = EventSink::channel();
        let recent = RecentLines::new(config.recent_lines_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let parser = OutputParser::new(recent.clone(), session_log, Arc::clone(&cancelled));

        Ok((
            Self {
                config,
                events,
                parser: Arc::new(Mutex::new(parser)),
                recent,
                cancelled,
                crash: Arc::new(Mutex::new(None)),
                worker: None,
                retired: Vec::new(),
                retired_readers: Vec::new(),
            },
            rx,
        ))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.worker
            .as_ref()
            .map(RunningWorker::state)
            .unwrap_or(WorkerState::NoProcess)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(RunningWorker::is_alive)
    }

    /// The current worker, if one was started.
    pub fn handle(&self) -> Option<WorkerHandle> {
        self.worker.as_ref().map(|w| w.handle.clone())
    }

    pub fn progress(&self) -> ProgressState {
        lock(&self.parser).state()
    }

    pub fn time_since_last_image(&self) -> Option<Duration> {
        lock(&self.parser).time_since_last_image()
    }

    pub fn recent_lines(&self) -> &RecentLines {
        &self.recent
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the cancel flag and any recorded crash before a new run.
    pub fn begin_run(&mut self) {
        self.cancelled.store(false, Ordering::SeqCst);
        lock(&self.crash).take();
    }

    /// Log tail of the last unexpected exit, if any. Clears it.
    pub fn take_crash(&self) -> Option<String> {
        lock(&self.crash).take()
    }

    /// Make sure a worker started with `fingerprint` is running.
    ///
    /// An alive worker with the same fingerprint is kept. Otherwise the
    /// current worker (if any) is killed as intentional and a new one is
    /// spawned from `launch`.
    pub async fn ensure_running(
        &mut self,
        launch: &LaunchSpec,
        fingerprint: &WorkerFingerprint,
    ) -> Result<WorkerHandle> {
        if let Some(worker) = &self.worker {
            if worker.is_alive() && worker.handle.fingerprint == *fingerprint {
                tracing::debug!(worker_id = %worker.handle.worker_id, "Reusing running worker");
                lock(&self.parser).begin_run();
                return Ok(WorkerHandle {
                    reused: true,
                    ..worker.handle.clone()
                });
            }
        }

        if self.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let previous = self.worker.as_ref().map(|w| w.handle.fingerprint.to_string());
        tracing::info!(
            running = self.is_running(),
            previous = previous.as_deref().unwrap_or(""),
            new = %fingerprint,
            "(Re)starting worker"
        );

        self.stop_current().await;
        lock(&self.parser).reset();
        self.spawn_worker(launch, fingerprint.clone())
    }

    fn spawn_worker(&mut self, launch: &LaunchSpec, fingerprint: WorkerFingerprint) -> Result<WorkerHandle> {
        let argv = launch.argv();
        let mut cmd = Command::new(&launch.program);
        cmd.args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        tracing::debug!(program = %launch.program.display(), args = ?argv, "Spawning worker");

        let state = Arc::new(Mutex::new(WorkerState::Starting));
        let mut child = cmd.spawn().map_err(WorkerError::Spawn)?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Other("worker stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Other("worker stderr was not captured".into()))?;

        let readers = vec![
            spawn_reader(stdout, Arc::clone(&self.parser), self.events.clone()),
            spawn_reader(stderr, Arc::clone(&self.parser), self.events.clone()),
        ];
        let reader_aborts = readers.iter().map(JoinHandle::abort_handle).collect();

        let handle = WorkerHandle {
            worker_id: Uuid::new_v4(),
            pid,
            fingerprint,
            started_at: Utc::now(),
            reused: false,
        };

        let intentional = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (decided_tx, decided) = watch::channel(false);
        let watchdog = tokio::spawn(watch_worker(
            child,
            kill_rx,
            readers,
            decided_tx,
            Watchdog {
                worker_id: handle.worker_id,
                intentional: Arc::clone(&intentional),
                state: Arc::clone(&state),
                cancelled: Arc::clone(&self.cancelled),
                crash: Arc::clone(&self.crash),
                recent: self.recent.clone(),
                events: self.events.clone(),
                tail_lines: self.config.crash_tail_lines,
                drain_timeout: self.config.reader_drain_timeout,
                exit_poll: self.config.exit_poll_interval,
            },
        ));

        {
            let mut s = lock(&state);
            if *s == WorkerState::Starting {
                *s = WorkerState::Running;
            }
        }

        tracing::info!(worker_id = %handle.worker_id, pid = ?pid, "Worker started");
        self.events.emit(WorkerEvent::WorkerStarted {
            worker_id: handle.worker_id.to_string(),
            pid,
        });

        self.worker = Some(RunningWorker {
            handle: handle.clone(),
            stdin,
            intentional,
            state,
            kill_tx: Some(kill_tx),
            decided,
            watchdog,
            readers: reader_aborts,
        });

        Ok(handle)
    }

    /// Write one command as a line. `false` when cancelled, when no worker
    /// is attached, or when the write fails; never an error.
    pub async fn submit(&mut self, command: &WorkerCommand) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.write_command(command, true).await
    }

    /// Like [`submit`](Self::submit) but without the line terminator.
    pub async fn submit_partial(&mut self, command: &WorkerCommand) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.write_command(command, false).await
    }

    async fn write_command(&mut self, command: &WorkerCommand, terminate: bool) -> bool {
        let Some(stdin) = self.worker.as_mut().and_then(|w| w.stdin.as_mut()) else {
            return false;
        };

        let line = match command.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, verb = command.verb(), "Failed to encode command");
                return false;
            }
        };
        tracing::debug!("=> {}", line);

        let mut bytes = line.into_bytes();
        if terminate {
            bytes.push(b'\n');
        }

        let result: std::io::Result<()> = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, verb = command.verb(), "Write to worker failed");
                false
            }
        }
    }

    /// Wait up to `limit` for the watchdog to classify the worker's exit.
    ///
    /// A failed write usually means the worker is going down; the crash is
    /// only recorded once its output has drained. Returns `false` if the
    /// worker is still alive when `limit` elapses.
    pub async fn await_exit_decision(&self, limit: Duration) -> bool {
        let Some(worker) = &self.worker else {
            return true;
        };
        let mut decided = worker.decided.clone();
        let finished = tokio::time::timeout(limit, decided.wait_for(|done| *done))
            .await
            .is_ok();
        finished
    }

    /// Ask the worker to stop and wait until its output goes quiet.
    ///
    /// Returns `false` if [`SupervisorConfig::cancel_timeout`] elapsed first.
    /// The worker process is left running.
    pub async fn cancel(&mut self) -> bool {
        tracing::info!("Cancelling run");
        if !self.write_command(&WorkerCommand::Stop, true).await {
            tracing::debug!("No worker accepted the stop command");
        }
        self.cancelled.store(true, Ordering::SeqCst);

        tokio::time::sleep(self.config.cancel_settle_delay).await;

        let quiet = await_quiescence(
            &self.recent,
            self.config.quiescence_poll,
            self.config.silence_threshold,
        );
        match self.config.cancel_timeout {
            Some(limit) => match tokio::time::timeout(limit, quiet).await {
                Ok(()) => true,
                Err(_) => {
                    tracing::warn!(timeout = ?limit, "Worker still producing output after stop");
                    false
                }
            },
            None => {
                quiet.await;
                true
            }
        }
    }

    /// Force-terminate the worker's process tree. The watchdog is told the
    /// exit is intentional first, so no crash is reported.
    pub fn kill(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };

        worker.intentional.store(true, Ordering::SeqCst);
        if worker.is_alive() {
            tracing::info!(worker_id = %worker.handle.worker_id, pid = ?worker.handle.pid, "Killing worker");
            if let Some(pid) = worker.handle.pid {
                kill_process_tree(pid);
            }
        }
        if let Some(tx) = worker.kill_tx.take() {
            let _ = tx.send(());
        }
        drop(worker.stdin.take());

        self.retired.retain(|h| !h.is_finished());
        self.retired.push(worker.watchdog);
        self.retired_readers.extend(worker.readers);
    }

    /// Kill the worker and wait for its background tasks to finish.
    pub async fn shutdown(&mut self) {
        self.stop_current().await;
    }

    async fn stop_current(&mut self) {
        self.kill();
        let tasks: Vec<JoinHandle<()>> = self.retired.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        if tokio::time::timeout(self.config.shutdown_timeout, join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Worker tasks did not finish in time");
        }
        self.retired_readers.clear();
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.kill();
        for task in &self.retired {
            task.abort();
        }
        for reader in &self.retired_readers {
            reader.abort();
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the worker was spawned as the
    // leader of its own process group, so pgid == pid.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        tracing::debug!(pid, error = %e, "taskkill failed");
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) {}

/// Forward every line of `stream` to the parser.
///
/// Lines end at `\n` or `\r`; progress bars redraw in place with bare
/// carriage returns.
fn spawn_reader<R>(mut stream: R, parser: Arc<Mutex<OutputParser>>, events: EventSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        let mut last_was_cr = false;

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Worker stream closed");
                    break;
                }
            };

            for &byte in &buf[..n] {
                match byte {
                    b'\n' if last_was_cr => last_was_cr = false,
                    b'\r' | b'\n' => {
                        forward_line(&pending, &parser, &events);
                        pending.clear();
                        last_was_cr = byte == b'\r';
                    }
                    _ => {
                        pending.push(byte);
                        last_was_cr = false;
                    }
                }
            }
        }

        if !pending.is_empty() {
            forward_line(&pending, &parser, &events);
        }
    })
}

fn forward_line(raw: &[u8], parser: &Mutex<OutputParser>, events: &EventSink) {
    let line = String::from_utf8_lossy(raw);
    let emitted = lock(parser).on_line(&line);
    for event in emitted {
        events.emit(event);
    }
}

struct Watchdog {
    worker_id: Uuid,
    intentional: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    cancelled: Arc<AtomicBool>,
    crash: Arc<Mutex<Option<String>>>,
    recent: RecentLines,
    events: EventSink,
    tail_lines: usize,
    drain_timeout: Duration,
    exit_poll: Duration,
}

/// Wait for the worker to exit, then decide whether that was a crash.
///
/// A dropped kill sender counts as a kill request, so the child never
/// outlives its session. `decided` is set after any crash is recorded.
async fn watch_worker(
    child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    decided: watch::Sender<bool>,
    ctx: Watchdog,
) {
    classify_exit(child, kill_rx, readers, ctx).await;
    decided.send_replace(true);
}

async fn classify_exit(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    ctx: Watchdog,
) {
    let waited = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "start_kill failed");
            }
            child.wait().await
        }
    };

    let status = match waited {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "Exit notification failed, polling instead");
            poll_exit(&mut child, ctx.exit_poll).await
        }
    };

    if tokio::time::timeout(ctx.drain_timeout, join_all(readers))
        .await
        .is_err()
    {
        tracing::debug!(worker_id = %ctx.worker_id, "Readers still open after exit");
    }

    let intentional = ctx.intentional.load(Ordering::SeqCst);
    *lock(&ctx.state) = if intentional {
        WorkerState::KilledIntentionally
    } else {
        WorkerState::Exited
    };

    if ctx.cancelled.load(Ordering::SeqCst) {
        tracing::info!(worker_id = %ctx.worker_id, status = ?status, "Worker exited after cancellation");
        return;
    }

    if intentional {
        tracing::debug!(worker_id = %ctx.worker_id, "Worker stopped by supervisor");
        return;
    }

    let log_tail = ctx.recent.tail_text(ctx.tail_lines);
    tracing::error!(worker_id = %ctx.worker_id, status = ?status, "Worker exited unexpectedly");
    *lock(&ctx.crash) = Some(log_tail.clone());
    ctx.cancelled.store(true, Ordering::SeqCst);
    ctx.events.emit(WorkerEvent::UnexpectedExit { log_tail });
}

async fn poll_exit(child: &mut Child, interval: Duration) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => tokio::time::sleep(interval).await,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot query worker exit status");
                return None;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::GenerationMode;

    fn fingerprint(mode: GenerationMode) -> WorkerFingerprint {
        WorkerFingerprint {
            mode,
            model: "/models/test.safetensors".into(),
            output_dir: "/out".into(),
            flags: Vec::new(),
        }
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").with_args(["-c", script])
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig::builder()
            .with_reader_drain_timeout(Duration::from_millis(200))
            .build()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Option<WorkerEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_submit_without_worker_is_false() {
        let (mut session, _rx) = WorkerSession::new(config()).unwrap();
        assert_eq!(session.state(), WorkerState::NoProcess);
        assert!(!session.submit(&WorkerCommand::Stop).await);
    }

    #[tokio::test]
    async fn test_reader_splits_carriage_returns() {
        let (mut session, mut rx) = WorkerSession::new(config()).unwrap();
        session
            .ensure_running(
                &sh("printf 'Running base model\\n10%%|#| 1/10\\r50%%|#####| 5/10\\r\\n'; sleep 5"),
                &fingerprint(GenerationMode::Txt2Img),
            )
            .await
            .unwrap();

        let mut percents = Vec::new();
        while percents.len() < 2 {
            match next_event(&mut rx).await {
                Some(WorkerEvent::Progress { percent }) => percents.push(percent),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(percents, vec![7, 35]);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_is_not_a_crash() {
        let (mut session, mut rx) = WorkerSession::new(config()).unwrap();
        session
            .ensure_running(&sh("echo up; sleep 30"), &fingerprint(GenerationMode::Txt2Img))
            .await
            .unwrap();
        session.shutdown().await;

        assert_eq!(session.state(), WorkerState::NoProcess);
        assert!(session.take_crash().is_none());
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, WorkerEvent::UnexpectedExit { .. }));
        }
    }

    #[tokio::test]
    async fn test_cancel_handle_blocks_submit() {
        let (mut session, _rx) = WorkerSession::new(config()).unwrap();
        session
            .ensure_running(&sh("cat > /dev/null"), &fingerprint(GenerationMode::Txt2Img))
            .await
            .unwrap();
        assert!(session.submit(&WorkerCommand::Reset).await);

        session.cancel_handle().cancel();
        assert!(!session.submit(&WorkerCommand::Reset).await);

        session.begin_run();
        assert!(session.submit(&WorkerCommand::Reset).await);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_decision_waits_for_crash_record() {
        let (mut session, _rx) = WorkerSession::new(config()).unwrap();
        session
            .ensure_running(&sh("echo 'RuntimeError: boom'; exit 3"), &fingerprint(GenerationMode::Txt2Img))
            .await
            .unwrap();

        assert!(session.await_exit_decision(Duration::from_secs(5)).await);
        let tail = session.take_crash().unwrap();
        assert!(tail.contains("RuntimeError: boom"));
    }

    #[tokio::test]
    async fn test_exit_decision_times_out_while_alive() {
        let (mut session, _rx) = WorkerSession::new(config()).unwrap();
        session
            .ensure_running(&sh("sleep 30"), &fingerprint(GenerationMode::Txt2Img))
            .await
            .unwrap();

        assert!(!session.await_exit_decision(Duration::from_millis(100)).await);
        assert!(session.take_crash().is_none());
        session.shutdown().await;
    }
}
