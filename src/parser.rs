//! Classifies worker output lines and tracks generation progress.
//!
//! The worker's output is free text. Each line is run through every
//! [`LogPattern`]; several may match the same line. Lines that match
//! nothing are still recorded.

use crate::events::WorkerEvent;
use crate::log_buffer::{RecentLines, SessionLog};
use crate::types::Phase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Refine fraction assumed until the worker reports one.
pub const DEFAULT_REFINE_FRACTION: f32 = 0.7;

const MODEL_LOADED: &str = "Model loaded";
const REFINE_FRAC: &str = "refine_frac =";
const RUNNING_BASE: &str = "Running base model";
const RUNNING_REFINER: &str = "Running refine model";
const LOADING: &str = "Loading";
const OOM: &str = "CUDA out of memory";
const ERROR_MARKERS: [&str; 3] = ["Traceback (most recent call last)", "RuntimeError", "Error:"];

/// The set of things recognised in a worker line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPattern {
    ModelLoaded,
    RefineFraction,
    BaseModel,
    RefineModel,
    ProgressBar,
    ImageGenerated,
    Error,
}

impl LogPattern {
    pub const ALL: [LogPattern; 7] = [
        LogPattern::ModelLoaded,
        LogPattern::RefineFraction,
        LogPattern::BaseModel,
        LogPattern::RefineModel,
        LogPattern::ProgressBar,
        LogPattern::ImageGenerated,
        LogPattern::Error,
    ];

    /// Apply this matcher to `line`.
    pub fn apply(&self, line: &str) -> Option<LineEvent> {
        match self {
            LogPattern::ModelLoaded => line.starts_with(MODEL_LOADED).then_some(LineEvent::ModelLoaded),
            LogPattern::RefineFraction => {
                let (_, rest) = line.split_once(REFINE_FRAC)?;
                Some(LineEvent::RefineFraction(parse_leading_float(rest)))
            }
            LogPattern::BaseModel => line
                .contains(RUNNING_BASE)
                .then_some(LineEvent::Phase(Phase::Base)),
            LogPattern::RefineModel => line
                .contains(RUNNING_REFINER)
                .then_some(LineEvent::Phase(Phase::Refiner)),
            LogPattern::ProgressBar => {
                if line.contains(LOADING) {
                    return None;
                }
                progress_bar_value(line).map(LineEvent::StageProgress)
            }
            LogPattern::ImageGenerated => {
                (line.starts_with("Image generated") || contains_in_order(line, &["Generated", "image", "in"]))
                    .then_some(LineEvent::ImageGenerated)
            }
            LogPattern::Error => {
                if line.contains(OOM) {
                    Some(LineEvent::Error(
                        "The worker ran out of GPU memory. Try a lower resolution or fewer refiner steps."
                            .to_string(),
                    ))
                } else if ERROR_MARKERS.iter().any(|m| line.contains(m)) {
                    Some(LineEvent::Error(line.trim().to_string()))
                } else {
                    None
                }
            }
        }
    }
}

/// Typed result of a [`LogPattern`] match.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    ModelLoaded,
    /// `None` when the number after the marker did not parse.
    RefineFraction(Option<f32>),
    Phase(Phase),
    /// Raw 0..=100 value of the current sub-stage's progress bar.
    StageProgress(u8),
    ImageGenerated,
    Error(String),
}

/// Run every matcher over `line`, in [`LogPattern::ALL`] order.
pub fn classify(line: &str) -> Vec<LineEvent> {
    LogPattern::ALL.iter().filter_map(|p| p.apply(line)).collect()
}

fn parse_leading_float(text: &str) -> Option<f32> {
    let text = text.trim_start();
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse::<f32>().ok().filter(|f| f.is_finite())
}

/// `"  42%|#####     | 12/30 [00:04<00:06]"` yields 42. The digits must sit
/// directly in front of `%|`.
fn progress_bar_value(line: &str) -> Option<u8> {
    let idx = line.find("%|")?;
    let head = &line[..idx];
    let digits_start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    let value: u32 = head[digits_start..].parse().ok()?;
    (value <= 100).then_some(value as u8)
}

fn contains_in_order(line: &str, parts: &[&str]) -> bool {
    let mut rest = line;
    for part in parts {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    true
}

/// Map a sub-stage progress value onto the whole base+refiner run.
///
/// The refiner offset is rounded on its own, so the two halves can miss
/// each other by one point at the boundary. Values of 100 or more are
/// withheld so only an explicit completion marks an image done.
pub fn overall_percent(phase: Phase, stage_progress: u8, refine_fraction: f32) -> Option<u8> {
    let prog = stage_progress as f32;
    let percent = match phase {
        Phase::Base => (prog * refine_fraction).round(),
        Phase::Refiner => (prog * (1.0 - refine_fraction)).round() + (100.0 * refine_fraction).round(),
    };
    (0.0..100.0).contains(&percent).then_some(percent as u8)
}

/// Mutable progress state for one worker lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressState {
    pub phase: Phase,
    pub refine_fraction: f32,
    pub has_errored: bool,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: Phase::Base,
            refine_fraction: DEFAULT_REFINE_FRACTION,
            has_errored: false,
        }
    }
}

/// Consumes worker lines and turns them into [`WorkerEvent`]s.
///
/// Every line is recorded in the ring buffer and session log. Once the
/// shared cancel flag is set, lines are only recorded.
#[derive(Debug)]
pub struct OutputParser {
    state: ProgressState,
    recent: RecentLines,
    session_log: SessionLog,
    cancelled: Arc<AtomicBool>,
    last_image_at: Option<Instant>,
}

impl OutputParser {
    pub fn new(recent: RecentLines, session_log: SessionLog, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            state: ProgressState::default(),
            recent,
            session_log,
            cancelled,
            last_image_at: None,
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn recent_lines(&self) -> &RecentLines {
        &self.recent
    }

    /// Time since the model loaded or the last image finished.
    pub fn time_since_last_image(&self) -> Option<Duration> {
        self.last_image_at.map(|t| t.elapsed())
    }

    /// Back to a fresh worker: base phase, default fraction, empty buffer.
    pub fn reset(&mut self) {
        self.state = ProgressState::default();
        self.recent.clear();
        self.last_image_at = None;
    }

    /// A reused worker starts a new run with a clean error flag.
    pub fn begin_run(&mut self) {
        self.state.has_errored = false;
    }

    pub fn on_line(&mut self, line: &str) -> Vec<WorkerEvent> {
        tracing::debug!(target: "diffusion_worker::worker", "{}", line);
        self.session_log.append(line);
        self.recent.push(line);

        if self.cancelled.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let mut events = Vec::new();
        for matched in classify(line) {
            match matched {
                LineEvent::ModelLoaded => {
                    self.last_image_at = Some(Instant::now());
                    events.push(WorkerEvent::ModelLoaded);
                }
                LineEvent::RefineFraction(Some(f)) => {
                    self.state.refine_fraction = f.clamp(0.0, 1.0);
                }
                LineEvent::RefineFraction(None) => {
                    tracing::trace!(line, "Ignoring unparsable refine fraction");
                }
                LineEvent::Phase(phase) => {
                    if self.state.phase != phase {
                        self.state.phase = phase;
                        events.push(WorkerEvent::PhaseChanged { phase });
                    }
                }
                LineEvent::StageProgress(prog) => {
                    if let Some(percent) = overall_percent(self.state.phase, prog, self.state.refine_fraction) {
                        events.push(WorkerEvent::Progress { percent });
                    }
                }
                LineEvent::ImageGenerated => {
                    self.last_image_at = Some(Instant::now());
                    events.push(WorkerEvent::ImageGenerated);
                }
                LineEvent::Error(message) => {
                    if self.state.has_errored {
                        tracing::debug!(%message, "Further worker error");
                    } else {
                        self.state.has_errored = true;
                        tracing::error!(%message, "Worker reported an error");
                        events.push(WorkerEvent::GenerationError { message });
                    }
                }
            }
        }
        events
    }
}
