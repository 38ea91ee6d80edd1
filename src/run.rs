//! One "generate" action end to end: pre-flight, worker, requests.

use crate::error::{Result, WorkerError};
use crate::expansion::{expand, generation_mode, uses_refiner, ExpansionOptions};
use crate::launch::{resolve_refiner, LaunchSpec, StartupFlags, StartupOptions, WorkerFingerprint};
use crate::protocol::WorkerCommand;
use crate::settings::{check_model_exists, warn_if_prompt_long};
use crate::supervisor::WorkerSession;
use crate::types::GenerationSettings;
use crate::wildcard::PromptExpansion;
use crate::InitImagePreparer;
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything about a run that isn't in the settings record.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Program, script, environment. Worker flags are appended per run.
    pub launch: LaunchSpec,
    pub output_dir: PathBuf,
    pub expansion: ExpansionOptions,
    pub flags: StartupFlags,
    /// Refiners to fall back on when the base model has no sibling.
    pub refiner_fallbacks: Vec<PathBuf>,
}

impl RunOptions {
    pub fn new(launch: LaunchSpec, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            launch,
            output_dir: output_dir.into(),
            expansion: ExpansionOptions::default(),
            flags: StartupFlags::default(),
            refiner_fallbacks: Vec::new(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub worker_id: Uuid,
    pub fingerprint: WorkerFingerprint,
    /// `true` when the previous worker was kept.
    pub reused_worker: bool,
    pub request_count: usize,
    pub written: usize,
    pub failed_writes: usize,
    pub start_seed: i64,
    pub final_seed: i64,
}

impl WorkerSession {
    /// Expand `settings` and stream every request to a suitable worker.
    ///
    /// Configuration problems are reported before any process is touched.
    /// Returns once every request is written; the worker keeps generating
    /// in the background and reports through the event channel.
    pub async fn run<P>(
        &mut self,
        settings: &GenerationSettings,
        options: &RunOptions,
        prompts: &mut dyn PromptExpansion,
        images: &P,
    ) -> Result<RunSummary>
    where
        P: InitImagePreparer,
    {
        self.begin_run();

        settings.validate()?;
        check_model_exists(&settings.model)?;
        warn_if_prompt_long(&settings.prompts);

        let init_images = if settings.init_images.is_empty() {
            Vec::new()
        } else {
            let prepared = images
                .prepare(&settings.init_images, settings.resolution)
                .await?;
            if prepared.is_empty() {
                return Err(WorkerError::config("None of the init images could be prepared"));
            }
            prepared
        };

        let jobs = expand(settings, &init_images, &options.expansion, prompts)?;
        for line in jobs.summary_lines() {
            tracing::info!("{}", line);
        }

        let refiner = if uses_refiner(&settings.refiner_strengths) {
            resolve_refiner(&settings.model, &options.refiner_fallbacks)
        } else {
            None
        };
        let startup = StartupOptions::new(
            generation_mode(settings, &options.expansion),
            &settings.model,
            &options.output_dir,
        )
        .with_refiner(refiner)
        .with_seamless(settings.seamless_mode)
        .with_flags(options.flags.clone());

        let fingerprint = startup.fingerprint();
        let launch = options.launch.clone().with_startup(&startup);
        let handle = self.ensure_running(&launch, &fingerprint).await?;

        if let Some(preamble) = self.config().protocol.batch_preamble() {
            self.submit(&preamble).await;
        }

        let max_failures = self.config().max_write_failures.max(1);
        let grace = self.config().write_failure_grace;
        let mut written = 0;
        let mut failed = 0;
        let mut consecutive = 0;

        for request in &jobs.requests {
            if self.submit(&WorkerCommand::generate(request)).await {
                written += 1;
                consecutive = 0;
                continue;
            }

            // A dying worker fails writes before its exit is classified.
            if !self.is_cancelled() {
                self.await_exit_decision(grace).await;
            }
            if let Some(log_tail) = self.take_crash() {
                return Err(WorkerError::WorkerCrash { log_tail });
            }
            if self.is_cancelled() {
                tracing::info!(written, total = jobs.len(), "Run cancelled while writing requests");
                return Err(WorkerError::Cancelled);
            }

            failed += 1;
            consecutive += 1;
            if consecutive >= max_failures {
                return Err(WorkerError::ProtocolWrite(format!(
                    "{} consecutive writes failed after {} of {} requests",
                    consecutive,
                    written,
                    jobs.len()
                )));
            }
        }

        tracing::info!(written, failed, worker_id = %handle.worker_id, "All requests sent");

        Ok(RunSummary {
            worker_id: handle.worker_id,
            fingerprint,
            reused_worker: handle.reused,
            request_count: jobs.len(),
            written,
            failed_writes: failed,
            start_seed: jobs.start_seed,
            final_seed: jobs.final_seed,
        })
    }

    /// `Err(WorkerCrash)` if the worker died since the last run started.
    pub fn check_crashed(&self) -> Result<()> {
        match self.take_crash() {
            Some(log_tail) => Err(WorkerError::WorkerCrash { log_tail }),
            None => Ok(()),
        }
    }
}
