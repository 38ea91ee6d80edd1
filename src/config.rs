use crate::protocol::ProtocolVariant;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for environment overrides read by [`SupervisorConfig::from_env()`].
pub const ENV_PREFIX: &str = "DIFFUSION_WORKER_";

/// Timing and buffer settings for a [`WorkerSession`](crate::WorkerSession).
///
/// Use [`SupervisorConfig::builder()`] for ergonomic construction, or
/// [`SupervisorConfig::default()`] for the values the worker has always
/// been driven with (100 ms quiescence poll, 2 s silence window).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Cadence of the quiescence poll after a `stop`.
    pub quiescence_poll: Duration,

    /// How long the log must stay silent before the worker counts as idle.
    pub silence_threshold: Duration,

    /// Pause between writing `stop` and the first quiescence sample.
    pub cancel_settle_delay: Duration,

    /// Outer bound on the quiescence wait. `None` waits forever.
    pub cancel_timeout: Option<Duration>,

    /// Fallback poll cadence for process exit, used alongside `wait()`.
    pub exit_poll_interval: Duration,

    /// Number of raw lines kept in the recent-lines ring buffer.
    pub recent_lines_capacity: usize,

    /// Number of lines attached to an unexpected-exit report.
    pub crash_tail_lines: usize,

    /// Consecutive failed writes that abort the remaining batch.
    pub max_write_failures: u32,

    /// How long the watchdog waits for the readers to drain after exit.
    pub reader_drain_timeout: Duration,

    /// How long a failed write waits for the watchdog to report a crash.
    pub write_failure_grace: Duration,

    /// How long a restart or shutdown waits for the old worker's tasks.
    pub shutdown_timeout: Duration,

    /// Optional file every raw worker line is appended to.
    pub session_log_path: Option<PathBuf>,

    /// Batch framing written to the worker.
    pub protocol: ProtocolVariant,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            quiescence_poll: Duration::from_millis(100),
            silence_threshold: Duration::from_millis(2000),
            cancel_settle_delay: Duration::from_millis(100),
            cancel_timeout: Some(Duration::from_secs(30)),
            exit_poll_interval: Duration::from_millis(50),
            recent_lines_capacity: 64,
            crash_tail_lines: 8,
            max_write_failures: 3,
            reader_drain_timeout: Duration::from_millis(500),
            write_failure_grace: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(5),
            session_log_path: None,
            protocol: ProtocolVariant::Generate,
        }
    }
}

impl SupervisorConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Defaults overlaid with `DIFFUSION_WORKER_*` environment variables.
    ///
    /// Durations are read as integer milliseconds. Values that fail to parse
    /// keep their default and log a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(ms) = parse_var::<u64>(&get, "QUIESCENCE_POLL_MS") {
            config.quiescence_poll = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "SILENCE_THRESHOLD_MS") {
            config.silence_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "CANCEL_TIMEOUT_MS") {
            config.cancel_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&get, "EXIT_POLL_MS") {
            config.exit_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&get, "RECENT_LINES") {
            config.recent_lines_capacity = n;
        }
        if let Some(n) = parse_var::<usize>(&get, "CRASH_TAIL_LINES") {
            config.crash_tail_lines = n;
        }
        if let Some(n) = parse_var::<u32>(&get, "MAX_WRITE_FAILURES") {
            config.max_write_failures = n;
        }
        if let Some(ms) = parse_var::<u64>(&get, "WRITE_FAILURE_GRACE_MS") {
            config.write_failure_grace = Duration::from_millis(ms);
        }
        if let Some(path) = get("SESSION_LOG").filter(|p| !p.trim().is_empty()) {
            config.session_log_path = Some(PathBuf::from(path));
        }
        if let Some(variant) = get("PROTOCOL") {
            match variant.to_ascii_lowercase().as_str() {
                "generate" => config.protocol = ProtocolVariant::Generate,
                "legacy" => config.protocol = ProtocolVariant::Legacy,
                other => tracing::warn!(value = other, "Unknown protocol variant, keeping default"),
            }
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = %format!("{}{}", ENV_PREFIX, name), value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}

/// Builder for [`SupervisorConfig`].
#[derive(Default)]
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    /// Set the quiescence poll cadence.
    pub fn with_quiescence_poll(mut self, interval: Duration) -> Self {
        self.config.quiescence_poll = interval;
        self
    }

    /// Set the silence window that marks the worker as idle.
    pub fn with_silence_threshold(mut self, threshold: Duration) -> Self {
        self.config.silence_threshold = threshold;
        self
    }

    pub fn with_cancel_settle_delay(mut self, delay: Duration) -> Self {
        self.config.cancel_settle_delay = delay;
        self
    }

    /// Bound the quiescence wait after `stop`. `None` waits indefinitely.
    pub fn with_cancel_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.cancel_timeout = timeout;
        self
    }

    pub fn with_exit_poll_interval(mut self, interval: Duration) -> Self {
        self.config.exit_poll_interval = interval;
        self
    }

    /// Set the ring buffer size. Clamped to at least the crash tail length.
    pub fn with_recent_lines_capacity(mut self, capacity: usize) -> Self {
        self.config.recent_lines_capacity = capacity;
        self
    }

    pub fn with_crash_tail_lines(mut self, lines: usize) -> Self {
        self.config.crash_tail_lines = lines;
        self
    }

    /// Set how many consecutive failed writes abort a batch.
    pub fn with_max_write_failures(mut self, max: u32) -> Self {
        self.config.max_write_failures = max;
        self
    }

    pub fn with_reader_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.reader_drain_timeout = timeout;
        self
    }

    /// Bound the wait for a crash report after a failed write.
    pub fn with_write_failure_grace(mut self, grace: Duration) -> Self {
        self.config.write_failure_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Append every raw worker line to this file.
    pub fn with_session_log(mut self, path: PathBuf) -> Self {
        self.config.session_log_path = Some(path);
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVariant) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Build the final [`SupervisorConfig`].
    pub fn build(mut self) -> SupervisorConfig {
        self.config.recent_lines_capacity = self
            .config
            .recent_lines_capacity
            .max(self.config.crash_tail_lines)
            .max(1);
        self.config
    }
}
