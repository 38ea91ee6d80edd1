//! Line protocol written to the worker's stdin.
//!
//! ```text
//! generate {"prompt":"a cat","default":"",...}
//! stop
//! !reset
//! ```
//!
//! Nothing is read back; the worker's replies are free text handled by
//! [`OutputParser`](crate::OutputParser).

use crate::error::Result;
use crate::types::GenerationRequest;
use serde::{Deserialize, Serialize};

/// How a batch is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolVariant {
    /// `generate <json>` per request.
    #[default]
    Generate,
    /// Same, preceded by `!reset` to clear worker-side session state.
    Legacy,
}

impl ProtocolVariant {
    /// Command written once before the first request of a batch.
    pub fn batch_preamble(&self) -> Option<WorkerCommand> {
        match self {
            Self::Generate => None,
            Self::Legacy => Some(WorkerCommand::Reset),
        }
    }
}

/// A single command understood by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Generate(GeneratePayload),
    Stop,
    Reset,
}

impl WorkerCommand {
    pub fn generate(request: &GenerationRequest) -> Self {
        WorkerCommand::Generate(GeneratePayload::from(request))
    }

    /// Command text without a line terminator.
    pub fn to_line(&self) -> Result<String> {
        Ok(match self {
            WorkerCommand::Generate(payload) => {
                format!("generate {}", serde_json::to_string(payload)?)
            }
            WorkerCommand::Stop => "stop".to_string(),
            WorkerCommand::Reset => "!reset".to_string(),
        })
    }

    /// Verb only, for logs that should not carry the whole prompt.
    pub fn verb(&self) -> &'static str {
        match self {
            WorkerCommand::Generate(_) => "generate",
            WorkerCommand::Stop => "stop",
            WorkerCommand::Reset => "!reset",
        }
    }
}

/// Flat string map sent with `generate`. Every number is pre-formatted with
/// `.` as the decimal separator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePayload {
    pub prompt: String,
    pub default: String,
    pub init_img: String,
    pub init_strength: String,
    pub inpaint_mask: String,
    pub prompt_neg: String,
    pub w: String,
    pub h: String,
    pub seed: String,
    pub sampler: String,
    pub scale_txt: String,
    pub scale_img: String,
    pub refine_frac: String,
    pub steps: String,
}

impl From<&GenerationRequest> for GeneratePayload {
    fn from(r: &GenerationRequest) -> Self {
        // The worker takes the fraction of steps spent in the base model and
        // the amount of the init image to keep, both inverses of the UI value.
        let init_strength = r
            .init_strength
            .filter(|_| r.init_image.is_some())
            .map(|s| format_trimmed(1.0 - s, 3))
            .unwrap_or_else(|| "0".to_string());

        Self {
            prompt: r.prompt.clone(),
            default: String::new(),
            init_img: path_or_empty(r.init_image.as_deref()),
            init_strength,
            inpaint_mask: path_or_empty(r.inpaint_mask.as_deref()),
            prompt_neg: r.negative_prompt.clone(),
            w: r.resolution.width.to_string(),
            h: r.resolution.height.to_string(),
            seed: r.seed.to_string(),
            sampler: r.sampler.as_str().to_string(),
            scale_txt: format_invariant(r.scale_txt),
            scale_img: format_invariant(r.scale_img),
            refine_frac: format_trimmed(1.0 - r.refiner_strength, 4),
            steps: r.steps.to_string(),
        }
    }
}

fn path_or_empty(path: Option<&std::path::Path>) -> String {
    path.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Shortest round-trip text for `value`, always with `.` as separator.
pub fn format_invariant(value: f32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    value.to_string()
}

/// At most `max_decimals` digits after the point, trailing zeros removed.
pub fn format_trimmed(value: f32, max_decimals: usize) -> String {
    let text = format!("{:.*}", max_decimals, value);
    let text = if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text.as_str()
    };
    match text {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationSettings, Resolution, Sampler};
    use std::path::PathBuf;

    fn request() -> GenerationRequest {
        let s = GenerationSettings::default();
        GenerationRequest {
            prompt: "a cat".into(),
            raw_prompt: "a cat".into(),
            negative_prompt: "blurry".into(),
            resolution: Resolution::new(1024, 768),
            seed: 42,
            sampler: Sampler::EulerA,
            steps: 30,
            scale_txt: 7.5,
            scale_img: s.scales_img[0],
            refiner_strength: 0.3,
            init_image: None,
            init_strength: None,
            inpaint_mask: None,
        }
    }

    #[test]
    fn test_control_verbs() {
        assert_eq!(WorkerCommand::Stop.to_line().unwrap(), "stop");
        assert_eq!(WorkerCommand::Reset.to_line().unwrap(), "!reset");
    }

    #[test]
    fn test_generate_line_is_flat_string_map() {
        let line = WorkerCommand::generate(&request()).to_line().unwrap();
        assert!(line.starts_with("generate {"));

        let json: serde_json::Value = serde_json::from_str(&line["generate ".len()..]).unwrap();
        let map = json.as_object().unwrap();
        assert!(map.values().all(|v| v.is_string()));
        assert_eq!(map["prompt"], "a cat");
        assert_eq!(map["promptNeg"], "blurry");
        assert_eq!(map["w"], "1024");
        assert_eq!(map["h"], "768");
        assert_eq!(map["seed"], "42");
        assert_eq!(map["sampler"], "euler_a");
        assert_eq!(map["scaleTxt"], "7.5");
        assert_eq!(map["refineFrac"], "0.7");
        assert_eq!(map["steps"], "30");
        assert_eq!(map["initImg"], "");
        assert_eq!(map["initStrength"], "0");
        assert_eq!(map["default"], "");
    }

    #[test]
    fn test_init_strength_is_inverted_and_trimmed() {
        let r = GenerationRequest {
            init_image: Some(PathBuf::from("/tmp/init.png")),
            init_strength: Some(0.35),
            ..request()
        };
        let payload = GeneratePayload::from(&r);
        assert_eq!(payload.init_strength, "0.65");
        assert_eq!(payload.init_img, "/tmp/init.png");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_invariant(7.0), "7");
        assert_eq!(format_invariant(-0.0), "0");
        assert_eq!(format_invariant(6.25), "6.25");
        assert_eq!(format_trimmed(0.33333, 3), "0.333");
        assert_eq!(format_trimmed(0.5, 3), "0.5");
        assert_eq!(format_trimmed(1.0, 3), "1");
        assert_eq!(format_trimmed(-0.0001, 3), "0");
    }

    #[test]
    fn test_legacy_preamble() {
        assert_eq!(ProtocolVariant::Generate.batch_preamble(), None);
        assert_eq!(ProtocolVariant::Legacy.batch_preamble(), Some(WorkerCommand::Reset));
    }
}
