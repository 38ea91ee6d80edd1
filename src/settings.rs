//! Turning raw user input into a [`GenerationSettings`] record, and checking
//! the record before anything is expanded.

use crate::error::{Result, WorkerError};
use crate::types::GenerationSettings;
use rand::Rng;
use std::path::Path;

/// Init strength used when the strength control is not shown.
pub const DEFAULT_INIT_STRENGTH: f32 = 0.5;

/// Prompts longer than this many words get a warning; the text encoder
/// silently truncates them.
pub const LONG_PROMPT_WORDS: usize = 70;

/// Split prompt text into one prompt per line, dropping blank lines.
pub fn split_prompts(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Negative prompts are single-line on the wire.
pub fn collapse_negative_prompt(text: &str) -> String {
    text.trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a comma-separated sweep like `"5, 7.5,9"`.
///
/// An empty string means the axis is the single `fallback` value. Entries
/// that don't parse are skipped; if none parse the fallback is used.
pub fn parse_extra_values(text: &str, fallback: f32) -> Vec<f32> {
    let values: Vec<f32> = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<f32>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                tracing::warn!(value = s, "Ignoring unparsable sweep value");
                None
            }
        })
        .collect();

    if values.is_empty() {
        vec![fallback]
    } else {
        values
    }
}

/// Init strengths for a run: the user's values, or `[0.5]` when the strength
/// control is hidden.
pub fn init_strengths_or_default(control_visible: bool, values: Vec<f32>) -> Vec<f32> {
    if control_visible && !values.is_empty() {
        values
    } else {
        vec![DEFAULT_INIT_STRENGTH]
    }
}

/// Resolve a negative seed to a random non-negative one. Called once per run.
pub fn resolve_seed(seed: i64) -> i64 {
    if seed >= 0 {
        seed
    } else {
        rand::rng().random_range(0..i32::MAX as i64)
    }
}

/// Log a warning when any prompt is long enough to be truncated.
/// Returns whether a warning was issued.
pub fn warn_if_prompt_long(prompts: &[String]) -> bool {
    let longest = prompts
        .iter()
        .map(|p| p.split_whitespace().count())
        .max()
        .unwrap_or(0);

    if longest > LONG_PROMPT_WORDS {
        tracing::warn!(
            words = longest,
            limit = LONG_PROMPT_WORDS,
            "{} is very long; the model may ignore parts of it",
            if prompts.len() > 1 { "One of the prompts" } else { "The prompt" }
        );
        true
    } else {
        false
    }
}

/// Fail unless the model file exists.
pub fn check_model_exists(model: &Path) -> Result<()> {
    if model.as_os_str().is_empty() {
        return Err(WorkerError::config("No model selected"));
    }
    if !model.exists() {
        return Err(WorkerError::config(format!(
            "Model not found: {}",
            model.display()
        )));
    }
    Ok(())
}

impl GenerationSettings {
    /// Structural checks that must pass before expansion.
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(WorkerError::config("No prompts given"));
        }
        if let Some(i) = self.prompts.iter().position(|p| p.trim().is_empty()) {
            return Err(WorkerError::config(format!("Prompt {} is empty", i + 1)));
        }
        if self.iterations == 0 {
            return Err(WorkerError::config("Iterations must be at least 1"));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(WorkerError::config(format!(
                "Invalid resolution {}",
                self.resolution
            )));
        }

        let axes = [
            ("steps", self.steps.len()),
            ("scalesTxt", self.scales_txt.len()),
            ("scalesImg", self.scales_img.len()),
            ("refinerStrengths", self.refiner_strengths.len()),
            ("initStrengths", self.init_strengths.len()),
        ];
        if let Some((name, _)) = axes.iter().find(|(_, len)| *len == 0) {
            return Err(WorkerError::config(format!("Sweep axis '{}' is empty", name)));
        }

        if let Some(s) = self
            .refiner_strengths
            .iter()
            .chain(&self.init_strengths)
            .find(|s| !(0.0..=1.0).contains(*s))
        {
            return Err(WorkerError::config(format!(
                "Strength {} is outside 0..1",
                s
            )));
        }

        Ok(())
    }
}
