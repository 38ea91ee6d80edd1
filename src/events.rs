use crate::types::Phase;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Everything a session reports back to its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// A new worker process was spawned.
    #[serde(rename_all = "camelCase")]
    WorkerStarted { worker_id: String, pid: Option<u32> },

    /// The worker finished loading its model and accepts commands.
    ModelLoaded,

    /// Overall progress of the current image, 0..=99.
    Progress { percent: u8 },

    PhaseChanged { phase: Phase },

    /// The worker reported a finished image.
    ImageGenerated,

    /// The worker logged an error. The process may still be alive.
    GenerationError { message: String },

    /// The worker exited without being asked to. Fatal for the run.
    #[serde(rename_all = "camelCase")]
    UnexpectedExit { log_tail: String },
}

/// Sending half handed to reader and watchdog tasks.
///
/// Unbounded so a slow consumer never stalls the stream readers. Send
/// errors mean nobody is listening and are ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}
