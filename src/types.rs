use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Sampling algorithm requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sampler {
    Ddim,
    Plms,
    Lms,
    Heun,
    Euler,
    EulerA,
    Dpm2,
    Dpm2A,
    DpmPp2m,
    DpmPp2mSde,
    DpmPpSde,
    UniPc,
}

impl Sampler {
    /// Lower-case name the worker expects in the `sampler` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ddim => "ddim",
            Self::Plms => "plms",
            Self::Lms => "lms",
            Self::Heun => "heun",
            Self::Euler => "euler",
            Self::EulerA => "euler_a",
            Self::Dpm2 => "dpm_2",
            Self::Dpm2A => "dpm_2_a",
            Self::DpmPp2m => "dpmpp_2m",
            Self::DpmPp2mSde => "dpmpp_2m_sde",
            Self::DpmPpSde => "dpmpp_sde",
            Self::UniPc => "unipc",
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model family. Carried through for collaborators that need it; the
/// worker auto-detects when left at `Automatic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelArchitecture {
    #[default]
    Automatic,
    Sd1,
    Sd2,
    SdXl,
}

/// Seamless tiling axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeamlessMode {
    #[default]
    Disabled,
    Both,
    Horizontal,
    Vertical,
}

/// How init images are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageMode {
    /// Plain img2img source.
    #[default]
    InitializationImage,
    /// Painted mask prepared next to the init image.
    ImageMask,
    /// Mask derived from a text description.
    TextMask,
}

/// Generation mode the worker is started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationMode {
    Txt2Img,
    Img2Img,
    Inpaint,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Txt2Img => "txt2img",
            Self::Img2Img => "img2img",
            Self::Inpaint => "inpaint",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-stage the worker reports being in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Base,
    Refiner,
}

/// Output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Everything one run generates, produced once per run and read-only after.
///
/// Each `Vec<f32>`/`Vec<u32>` field is a sweep axis: a single value is a fixed
/// setting, several values multiply the request count. Axes must not be empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    /// Prompts in run order. Blank entries are rejected.
    pub prompts: Vec<String>,
    pub negative_prompt: String,
    /// Images per prompt before the seed advances.
    pub iterations: u32,
    pub steps: Vec<u32>,
    pub scales_txt: Vec<f32>,
    /// Image guidance. Only the first value reaches the worker.
    pub scales_img: Vec<f32>,
    pub refiner_strengths: Vec<f32>,
    pub init_strengths: Vec<f32>,
    /// Negative means "pick a random seed for this run".
    pub seed: i64,
    pub lock_seed: bool,
    pub init_images: Vec<PathBuf>,
    pub resolution: Resolution,
    pub sampler: Sampler,
    /// Model file the worker loads.
    pub model: PathBuf,
    pub model_architecture: ModelArchitecture,
    pub seamless_mode: SeamlessMode,
    pub image_mode: ImageMode,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            prompts: Vec::new(),
            negative_prompt: String::new(),
            iterations: 1,
            steps: vec![30],
            scales_txt: vec![7.0],
            scales_img: vec![1.5],
            refiner_strengths: vec![0.3],
            init_strengths: vec![0.5],
            seed: -1,
            lock_seed: false,
            init_images: Vec::new(),
            resolution: Resolution::new(1024, 1024),
            sampler: Sampler::DpmPp2mSde,
            model: PathBuf::new(),
            model_architecture: ModelArchitecture::Automatic,
            seamless_mode: SeamlessMode::Disabled,
            image_mode: ImageMode::InitializationImage,
        }
    }
}

/// One resolved point of the sweep. Written to the worker exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Prompt after wildcard expansion.
    pub prompt: String,
    /// The prompt as the user typed it.
    pub raw_prompt: String,
    pub negative_prompt: String,
    pub resolution: Resolution,
    pub seed: i64,
    pub sampler: Sampler,
    pub steps: u32,
    pub scale_txt: f32,
    pub scale_img: f32,
    pub refiner_strength: f32,
    pub init_image: Option<PathBuf>,
    /// Strength as the user set it (1.0 = keep the source untouched).
    pub init_strength: Option<f32>,
    pub inpaint_mask: Option<PathBuf>,
}
