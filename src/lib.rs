//! # Diffusion Worker
//!
//! Driver for a long-lived image-synthesis worker process.
//!
//! ## Features
//!
//! - Sweep expansion: prompts × iterations × scales × refiner strengths ×
//!   steps × init images, with deterministic seed progression
//! - Worker reuse keyed on a launch fingerprint, restart on change
//! - Line protocol (`generate <json>`, `stop`, `!reset`)
//! - Progress, phase and error tracking from the worker's output
//! - Crash detection that tells supervisor kills apart from real exits
//! - Cancellation with a quiescence wait
//!
//! ## Quick Start
//!
//! 1. Build a [`SupervisorConfig`] (or use [`SupervisorConfig::from_env()`])
//! 2. Create a [`WorkerSession`] and keep the event receiver
//! 3. Call [`WorkerSession::run()`] with a [`GenerationSettings`] record
//! 4. Consume [`WorkerEvent`]s; call [`WorkerSession::cancel()`] to stop
//!
//! See the `demos/` directory for complete usage examples.

pub mod config;
pub mod error;
pub mod events;
pub mod expansion;
pub mod launch;
pub mod log_buffer;
pub mod logging;
pub mod parser;
pub mod protocol;
pub mod quiescence;
pub mod run;
pub mod settings;
pub mod supervisor;
pub mod types;
pub mod wildcard;

pub use config::{SupervisorConfig, SupervisorConfigBuilder};
pub use error::{Result, WorkerError};
pub use events::{EventSink, WorkerEvent};
pub use expansion::{expand, ExpandedJobs, ExpansionOptions};
pub use launch::{LaunchSpec, StartupFlags, StartupOptions, WorkerFingerprint};
pub use log_buffer::RecentLines;
pub use parser::{OutputParser, ProgressState};
pub use protocol::{GeneratePayload, ProtocolVariant, WorkerCommand};
pub use quiescence::await_quiescence;
pub use run::{RunOptions, RunSummary};
pub use supervisor::{CancelHandle, WorkerHandle, WorkerSession, WorkerState};
pub use types::{
    GenerationMode, GenerationRequest, GenerationSettings, ImageMode, ModelArchitecture, Phase,
    Resolution, Sampler, SeamlessMode,
};
pub use wildcard::{
    DirectoryWildcards, MapWildcards, NoWildcards, PromptExpansion, WildcardExpander,
    WildcardSource,
};

use std::path::PathBuf;

/// Turns user-picked init images into files the worker can read.
///
/// Cropping, resizing and format conversion live outside this crate. A
/// preparer may drop images it can't handle; an empty result aborts the run.
///
/// # Example
///
/// ```ignore
/// use diffusion_worker::*;
///
/// struct Resizer;
///
/// impl InitImagePreparer for Resizer {
///     async fn prepare(
///         &self,
///         images: &[std::path::PathBuf],
///         resolution: Resolution,
///     ) -> anyhow::Result<Vec<std::path::PathBuf>> {
///         // Resize each image to `resolution` into a temp dir...
///         Ok(images.to_vec())
///     }
/// }
/// ```
pub trait InitImagePreparer: Send + Sync {
    /// Return the paths to send, in the same order as `images`.
    fn prepare(
        &self,
        images: &[PathBuf],
        resolution: Resolution,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<PathBuf>>> + Send;
}

/// Sends init images as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughImages;

impl InitImagePreparer for PassthroughImages {
    async fn prepare(&self, images: &[PathBuf], _resolution: Resolution) -> anyhow::Result<Vec<PathBuf>> {
        Ok(images.to_vec())
    }
}
