use thiserror::Error;

/// Errors that can occur while preparing a run or driving the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Invalid or missing sweep axis, missing model, missing inpaint mask.
    /// Raised before the worker is touched.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Writing to the worker's stdin failed too many times in a row.
    #[error("Failed to write to worker: {0}")]
    ProtocolWrite(String),

    /// The worker exited without being asked to.
    #[error("Process has exited unexpectedly.\n\nOutput:\n{log_tail}")]
    WorkerCrash { log_tail: String },

    #[error("Failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        WorkerError::Configuration(msg.into())
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::Other(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_message_includes_tail() {
        let err = WorkerError::WorkerCrash {
            log_tail: "...\nTraceback".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Process has exited unexpectedly."));
        assert!(msg.ends_with("...\nTraceback"));
    }

    #[test]
    fn test_anyhow_keeps_context_chain() {
        let err: WorkerError = anyhow::anyhow!("disk full")
            .context("resizing init image")
            .into();
        assert_eq!(err.to_string(), "resizing init image: disk full");
    }
}
