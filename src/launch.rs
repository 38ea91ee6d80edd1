//! How the worker is started, and the fingerprint that decides whether a
//! running worker can be reused.

use crate::protocol::format_trimmed;
use crate::types::{GenerationMode, SeamlessMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a worker's startup configuration.
///
/// Two runs with equal fingerprints share a worker; anything else restarts
/// it. Never parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFingerprint {
    pub mode: GenerationMode,
    pub model: PathBuf,
    pub output_dir: PathBuf,
    /// Startup flags beyond mode/model/output.
    pub flags: Vec<String>,
}

impl fmt::Display for WorkerFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.mode,
            self.model.display(),
            self.output_dir.display()
        )?;
        for flag in &self.flags {
            write!(f, " {}", flag)?;
        }
        Ok(())
    }
}

/// Compute device. Index form: 0 = auto, 1 = cpu, n = `cuda:{n-2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => Device::Auto,
            1 => Device::Cpu,
            n => Device::Cuda(n - 2),
        }
    }

    fn name(&self) -> Option<String> {
        match self {
            Device::Auto => None,
            Device::Cpu => Some("cpu".to_string()),
            Device::Cuda(n) => Some(format!("cuda:{}", n)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precision {
    #[default]
    Half,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaceRestoreTool {
    Gfpgan,
    CodeFormer { fidelity: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceRestore {
    pub tool: FaceRestoreTool,
    pub strength: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upscale {
    /// 2, 3 or 4.
    pub factor: u8,
    pub strength: f32,
}

/// Optional worker flags chosen by configuration rather than per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupFlags {
    pub optimize: bool,
    pub precision: Precision,
    pub embedding: Option<PathBuf>,
    pub device: Device,
    pub face_restore: Option<FaceRestore>,
    pub upscale: Option<Upscale>,
}

/// Everything that goes on the worker's command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupOptions {
    pub mode: GenerationMode,
    pub model: PathBuf,
    pub output_dir: PathBuf,
    /// Second-stage model, see [`resolve_refiner`].
    pub refiner: Option<PathBuf>,
    pub seamless: SeamlessMode,
    pub flags: StartupFlags,
}

impl StartupOptions {
    pub fn new(mode: GenerationMode, model: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            model: model.into(),
            output_dir: output_dir.into(),
            refiner: None,
            seamless: SeamlessMode::Disabled,
            flags: StartupFlags::default(),
        }
    }

    pub fn with_refiner(mut self, refiner: Option<PathBuf>) -> Self {
        self.refiner = refiner;
        self
    }

    pub fn with_seamless(mut self, seamless: SeamlessMode) -> Self {
        self.seamless = seamless;
        self
    }

    pub fn with_flags(mut self, flags: StartupFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Flags after `-p/-g/-m/-o`, in a stable order.
    fn extra_flags(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(refiner) = &self.refiner {
            args.push("-m2".to_string());
            args.push(refiner.to_string_lossy().into_owned());
        }
        let flags = &self.flags;
        if flags.optimize {
            args.push("--sdxl_optimize".to_string());
        }
        if flags.precision == Precision::Full {
            args.extend(["--precision".to_string(), "float32".to_string()]);
        }
        // A missing embedding file is dropped rather than failing the launch.
        if let Some(embedding) = flags.embedding.as_ref().filter(|p| p.is_file()) {
            args.push("--embedding_path".to_string());
            args.push(embedding.to_string_lossy().into_owned());
        }
        if let Some(device) = flags.device.name() {
            args.extend(["--device".to_string(), device]);
        }
        match self.seamless {
            SeamlessMode::Disabled => {}
            SeamlessMode::Both => args.push("--seamless".to_string()),
            SeamlessMode::Horizontal => {
                args.extend(["--seamless", "--seamless_axes", "x"].map(String::from))
            }
            SeamlessMode::Vertical => {
                args.extend(["--seamless", "--seamless_axes", "y"].map(String::from))
            }
        }
        if let Some(fr) = &flags.face_restore {
            args.extend(["-G".to_string(), format_trimmed(fr.strength, 3), "-ft".to_string()]);
            match fr.tool {
                FaceRestoreTool::Gfpgan => args.push("gfpgan".to_string()),
                FaceRestoreTool::CodeFormer { fidelity } => args.extend([
                    "codeformer".to_string(),
                    "-cf".to_string(),
                    fidelity.to_string(),
                ]),
            }
        }
        if let Some(up) = &flags.upscale {
            args.extend([
                "-U".to_string(),
                up.factor.clamp(2, 4).to_string(),
                format_trimmed(up.strength, 3),
            ]);
        }

        args
    }

    /// Full worker argv (after the script path).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "SdXl".to_string(),
            "-g".to_string(),
            self.mode.as_str().to_string(),
            "-m".to_string(),
            self.model.to_string_lossy().into_owned(),
            "-o".to_string(),
            self.output_dir.to_string_lossy().into_owned(),
        ];
        args.extend(self.extra_flags());
        args
    }

    pub fn fingerprint(&self) -> WorkerFingerprint {
        WorkerFingerprint {
            mode: self.mode,
            model: self.model.clone(),
            output_dir: self.output_dir.clone(),
            flags: self.extra_flags(),
        }
    }
}

/// Pick the refiner for a base model.
///
/// First choice is the sibling file with `base` replaced by `refiner` in its
/// name. Otherwise the first fallback, directories (diffusers layout) before
/// single files.
pub fn resolve_refiner(model: &Path, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    let name = model.file_name()?.to_string_lossy();
    let sibling_name = name.replace("base", "refiner");
    let sibling = model.with_file_name(&sibling_name);

    if sibling_name != name && sibling.exists() {
        tracing::info!(refiner = %sibling_name, "Using refiner model");
        return Some(sibling);
    }

    let pick = fallbacks
        .iter()
        .find(|p| p.is_dir())
        .or_else(|| fallbacks.iter().find(|p| p.is_file()))
        .cloned();

    match &pick {
        Some(p) => tracing::info!(
            refiner = %p.display(),
            "No corresponding refiner model found, using fallback"
        ),
        None => tracing::warn!("No refiner model found"),
    }
    pick
}

/// How to spawn the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    /// Interpreter or executable.
    pub program: PathBuf,
    /// Script passed as the first argument, if the program is an interpreter.
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: None,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append the worker flags for `startup`.
    pub fn with_startup(self, startup: &StartupOptions) -> Self {
        self.with_args(startup.to_args())
    }

    /// Arguments as passed to the program, script first.
    pub fn argv(&self) -> Vec<String> {
        self.script
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup() -> StartupOptions {
        StartupOptions::new(GenerationMode::Txt2Img, "/models/sdxl_base.safetensors", "/out")
    }

    #[test]
    fn test_base_args() {
        assert_eq!(
            startup().to_args(),
            vec![
                "-p", "SdXl", "-g", "txt2img", "-m", "/models/sdxl_base.safetensors", "-o", "/out"
            ]
        );
    }

    #[test]
    fn test_optional_flags() {
        let mut s = startup();
        s.flags.optimize = true;
        s.flags.precision = Precision::Full;
        s.flags.device = Device::from_index(3);
        s.seamless = SeamlessMode::Horizontal;
        s.flags.face_restore = Some(FaceRestore {
            tool: FaceRestoreTool::CodeFormer { fidelity: 0.5 },
            strength: 0.8,
        });
        s.flags.upscale = Some(Upscale { factor: 4, strength: 0.75 });

        let flags = s.to_args()[8..].join(" ");
        assert_eq!(
            flags,
            "--sdxl_optimize --precision float32 --device cuda:1 --seamless --seamless_axes x \
             -G 0.8 -ft codeformer -cf 0.5 -U 4 0.75"
        );
    }

    #[test]
    fn test_device_from_index() {
        assert_eq!(Device::from_index(0), Device::Auto);
        assert_eq!(Device::from_index(1), Device::Cpu);
        assert_eq!(Device::from_index(2), Device::Cuda(0));
    }

    #[test]
    fn test_fingerprint_equality() {
        assert_eq!(startup().fingerprint(), startup().fingerprint());

        let mut other = startup();
        other.mode = GenerationMode::Img2Img;
        assert_ne!(startup().fingerprint(), other.fingerprint());

        let mut other = startup();
        other.output_dir = PathBuf::from("/elsewhere");
        assert_ne!(startup().fingerprint(), other.fingerprint());

        let mut other = startup();
        other.flags.precision = Precision::Full;
        assert_ne!(startup().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_display() {
        assert_eq!(
            startup().fingerprint().to_string(),
            "txt2img/models/sdxl_base.safetensors/out"
        );
    }

    #[test]
    fn test_resolve_refiner_prefers_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sdxl_base.safetensors");
        let sibling = dir.path().join("sdxl_refiner.safetensors");
        std::fs::write(&base, b"").unwrap();
        std::fs::write(&sibling, b"").unwrap();

        assert_eq!(resolve_refiner(&base, &[]), Some(sibling));
    }

    #[test]
    fn test_resolve_refiner_fallback_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("custom.safetensors");
        let single = dir.path().join("refiner.safetensors");
        let diffusers = dir.path().join("refiner-diffusers");
        std::fs::write(&single, b"").unwrap();
        std::fs::create_dir(&diffusers).unwrap();

        assert_eq!(
            resolve_refiner(&base, &[single.clone(), diffusers.clone()]),
            Some(diffusers)
        );
        assert_eq!(resolve_refiner(&base, &[single.clone()]), Some(single));
        assert_eq!(resolve_refiner(&base, &[]), None);
    }

    #[test]
    fn test_launch_argv_puts_script_first() {
        let launch = LaunchSpec::new("python")
            .with_script("worker.py")
            .with_env("PYTHONUNBUFFERED", "1")
            .with_startup(&startup());
        let argv = launch.argv();
        assert_eq!(argv[0], "worker.py");
        assert_eq!(argv[1], "-p");
        assert_eq!(launch.env, vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
    }
}
