//! Job expansion: settings record in, ordered single-image requests out.
//!
//! Loop order, outermost first: prompt, iteration, text scale, refiner
//! strength, step count, then init image × init strength. The seed moves
//! once per iteration, so seeds line up with output files across batches.

use crate::error::{Result, WorkerError};
use crate::settings::resolve_seed;
use crate::types::{GenerationMode, GenerationRequest, GenerationSettings, ImageMode, Resolution};
use crate::wildcard::PromptExpansion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Refiner strengths below this disable the refiner for the whole run.
pub const MIN_REFINER_STRENGTH: f32 = 0.05;

/// File-name suffix that marks an inpainting model.
pub const INPAINTING_SUFFIX: &str = "-inpainting";

/// Run-level switches that are not part of the settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionOptions {
    /// Start every prompt from the same seed.
    pub reuse_seed_across_prompts: bool,
    /// Model names ending in this are treated as inpainting models.
    pub inpainting_suffix: String,
    /// Prepared mask, required when `image_mode == ImageMask`.
    pub mask_path: Option<PathBuf>,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            reuse_seed_across_prompts: false,
            inpainting_suffix: INPAINTING_SUFFIX.to_string(),
            mask_path: None,
        }
    }
}

/// Result of [`expand`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedJobs {
    pub requests: Vec<GenerationRequest>,
    /// Seed the run started from, after random resolution.
    pub start_seed: i64,
    /// Seed value after the last iteration.
    pub final_seed: i64,
    prompt_count: usize,
    iterations: u32,
    step_values: usize,
    scales: Vec<f32>,
    resolution: Resolution,
    init_images: usize,
    init_strengths: usize,
}

impl ExpandedJobs {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The two summary lines logged before a run starts.
    pub fn summary_lines(&self) -> [String; 2] {
        let scales = if self.scales.len() < 4 {
            self.scales
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            format!(
                "{}->{}",
                self.scales.first().copied().unwrap_or_default(),
                self.scales.last().copied().unwrap_or_default()
            )
        };

        let first = format!(
            "Running Stable Diffusion - {} Iterations, {} Steps, Scales {}, {}, Starting Seed: {}",
            self.iterations,
            self.step_values,
            scales,
            self.resolution,
            self.start_seed
        );

        let inits = if self.init_images > 0 {
            format!(
                " and {} image{} using {} strength{}",
                self.init_images,
                plural(self.init_images),
                self.init_strengths,
                plural(self.init_strengths)
            )
        } else {
            String::new()
        };

        let second = format!(
            "{} prompt{} * {} image{} * {} step value{} * {} scale{}{} = {} images total.",
            self.prompt_count,
            plural(self.prompt_count),
            self.iterations,
            plural(self.iterations as usize),
            self.step_values,
            plural(self.step_values),
            self.scales.len(),
            plural(self.scales.len()),
            inits,
            self.requests.len()
        );

        [first, second]
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Whether the refiner runs at all. Every strength must clear the threshold.
pub fn uses_refiner(refiner_strengths: &[f32]) -> bool {
    refiner_strengths.iter().all(|s| *s >= MIN_REFINER_STRENGTH)
}

/// Mode the worker must be started in for these settings.
pub fn generation_mode(settings: &GenerationSettings, options: &ExpansionOptions) -> GenerationMode {
    if settings.init_images.is_empty() {
        return GenerationMode::Txt2Img;
    }

    if is_inpainting_model(&settings.model, &options.inpainting_suffix)
        && settings.image_mode != ImageMode::InitializationImage
    {
        GenerationMode::Inpaint
    } else {
        GenerationMode::Img2Img
    }
}

fn is_inpainting_model(model: &Path, suffix: &str) -> bool {
    !suffix.is_empty()
        && model
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|name| name.ends_with(suffix))
}

/// Expand a settings record into the ordered request list.
///
/// `init_images` are the images the worker will read, already prepared by
/// an [`InitImagePreparer`](crate::InitImagePreparer); pass an empty slice
/// for text-to-image. A negative seed is resolved to a random one here,
/// once, before any request is built.
pub fn expand(
    settings: &GenerationSettings,
    init_images: &[PathBuf],
    options: &ExpansionOptions,
    prompts: &mut dyn PromptExpansion,
) -> Result<ExpandedJobs> {
    settings.validate()?;

    let inpaint_mask = if settings.image_mode == ImageMode::ImageMask && !init_images.is_empty() {
        match &options.mask_path {
            Some(mask) if mask.exists() => Some(mask.clone()),
            Some(mask) => {
                return Err(WorkerError::config(format!(
                    "Inpaint mask not found: {}",
                    mask.display()
                )))
            }
            None => return Err(WorkerError::config("Image mask mode selected but no mask was prepared")),
        }
    } else {
        None
    };

    let iterations = settings.iterations as usize;
    let start_seed = resolve_seed(settings.seed);
    let mut seed = start_seed;
    let scale_img = settings.scales_img[0];

    let per_iteration = settings.scales_txt.len()
        * settings.refiner_strengths.len()
        * settings.steps.len()
        * (init_images.len() * settings.init_strengths.len()).max(1);
    let mut requests = Vec::with_capacity(settings.prompts.len() * iterations * per_iteration);

    for raw_prompt in &settings.prompts {
        let prompt_seed = seed;
        let processed = prompts.expand_all(raw_prompt, iterations)?;
        if processed.len() != iterations {
            return Err(WorkerError::config(format!(
                "Wildcard expansion produced {} prompts, expected {}",
                processed.len(),
                iterations
            )));
        }

        for prompt in &processed {
            let base = GenerationRequest {
                prompt: prompt.clone(),
                raw_prompt: raw_prompt.clone(),
                negative_prompt: settings.negative_prompt.clone(),
                resolution: settings.resolution,
                seed,
                sampler: settings.sampler,
                steps: 0,
                scale_txt: 0.0,
                scale_img,
                refiner_strength: 0.0,
                init_image: None,
                init_strength: None,
                inpaint_mask: None,
            };

            for &scale_txt in &settings.scales_txt {
                for &refiner_strength in &settings.refiner_strengths {
                    for &steps in &settings.steps {
                        let point = GenerationRequest {
                            steps,
                            scale_txt,
                            refiner_strength,
                            ..base.clone()
                        };

                        if init_images.is_empty() {
                            requests.push(point);
                            continue;
                        }

                        for image in init_images {
                            for &strength in &settings.init_strengths {
                                requests.push(GenerationRequest {
                                    init_image: Some(image.clone()),
                                    init_strength: Some(strength),
                                    inpaint_mask: inpaint_mask.clone(),
                                    ..point.clone()
                                });
                            }
                        }
                    }
                }
            }

            if !settings.lock_seed {
                seed = seed
                    .checked_add(1)
                    .ok_or_else(|| WorkerError::config("Seed range exceeds i64"))?;
            }
        }

        if options.reuse_seed_across_prompts {
            seed = prompt_seed;
        }
    }

    Ok(ExpandedJobs {
        requests,
        start_seed,
        final_seed: seed,
        prompt_count: settings.prompts.len(),
        iterations: settings.iterations,
        step_values: settings.steps.len(),
        scales: settings.scales_txt.clone(),
        resolution: settings.resolution,
        init_images: init_images.len(),
        init_strengths: settings.init_strengths.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wildcard::NoWildcards;

    fn settings() -> GenerationSettings {
        GenerationSettings {
            prompts: vec!["a cat".into(), "a dog".into()],
            iterations: 2,
            seed: 100,
            ..Default::default()
        }
    }

    fn run(s: &GenerationSettings, images: &[PathBuf], opts: &ExpansionOptions) -> ExpandedJobs {
        expand(s, images, opts, &mut NoWildcards).unwrap()
    }

    #[test]
    fn test_count_is_cross_product() {
        let s = GenerationSettings {
            steps: vec![20, 30],
            scales_txt: vec![5.0, 7.0, 9.0],
            refiner_strengths: vec![0.2, 0.3],
            init_strengths: vec![0.4, 0.6],
            ..settings()
        };
        assert_eq!(run(&s, &[], &ExpansionOptions::default()).len(), 2 * 2 * 3 * 2 * 2);

        let images = vec![PathBuf::from("a.png"), PathBuf::from("b.png"), PathBuf::from("c.png")];
        assert_eq!(
            run(&s, &images, &ExpansionOptions::default()).len(),
            2 * 2 * 3 * 2 * 2 * 3 * 2
        );
    }

    #[test]
    fn test_innermost_axis_is_image_then_strength() {
        let s = GenerationSettings {
            prompts: vec!["p".into()],
            iterations: 1,
            init_strengths: vec![0.4, 0.6],
            ..settings()
        };
        let images = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        let jobs = run(&s, &images, &ExpansionOptions::default());

        let order: Vec<(String, f32)> = jobs
            .requests
            .iter()
            .map(|r| {
                (
                    r.init_image.as_ref().unwrap().display().to_string(),
                    r.init_strength.unwrap(),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.png".to_string(), 0.4),
                ("a.png".to_string(), 0.6),
                ("b.png".to_string(), 0.4),
                ("b.png".to_string(), 0.6),
            ]
        );
    }

    #[test]
    fn test_scale_outside_refiner_outside_steps() {
        let s = GenerationSettings {
            prompts: vec!["p".into()],
            iterations: 1,
            steps: vec![10, 20],
            scales_txt: vec![5.0, 6.0],
            refiner_strengths: vec![0.2, 0.3],
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        let tuples: Vec<(f32, f32, u32)> = jobs
            .requests
            .iter()
            .map(|r| (r.scale_txt, r.refiner_strength, r.steps))
            .collect();
        assert_eq!(tuples[0], (5.0, 0.2, 10));
        assert_eq!(tuples[1], (5.0, 0.2, 20));
        assert_eq!(tuples[2], (5.0, 0.3, 10));
        assert_eq!(tuples[4], (6.0, 0.2, 10));
    }

    #[test]
    fn test_seed_advances_per_iteration_and_continues_across_prompts() {
        let s = GenerationSettings {
            scales_txt: vec![5.0, 7.0],
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        let seeds: Vec<i64> = jobs.requests.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![100, 100, 101, 101, 102, 102, 103, 103]);
        assert_eq!(jobs.start_seed, 100);
        assert_eq!(jobs.final_seed, 104);
    }

    #[test]
    fn test_seed_resets_per_prompt_when_reused() {
        let opts = ExpansionOptions {
            reuse_seed_across_prompts: true,
            ..Default::default()
        };
        let jobs = run(&settings(), &[], &opts);
        let seeds: Vec<i64> = jobs.requests.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![100, 101, 100, 101]);
    }

    #[test]
    fn test_lock_seed_keeps_one_seed() {
        let s = GenerationSettings {
            lock_seed: true,
            iterations: 3,
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        assert!(jobs.requests.iter().all(|r| r.seed == 100));
    }

    #[test]
    fn test_random_seed_resolved_once() {
        let s = GenerationSettings {
            seed: -1,
            lock_seed: true,
            iterations: 4,
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        assert!(jobs.start_seed >= 0);
        assert!(jobs.requests.iter().all(|r| r.seed == jobs.start_seed));
    }

    #[test]
    fn test_mask_required_for_image_mask_mode() {
        let s = GenerationSettings {
            image_mode: ImageMode::ImageMask,
            ..settings()
        };
        let images = vec![PathBuf::from("a.png")];
        let err = expand(&s, &images, &ExpansionOptions::default(), &mut NoWildcards).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));

        let dir = tempfile::tempdir().unwrap();
        let mask = dir.path().join("mask.png");
        std::fs::write(&mask, b"").unwrap();
        let opts = ExpansionOptions {
            mask_path: Some(mask.clone()),
            ..Default::default()
        };
        let jobs = run(&s, &images, &opts);
        assert!(jobs.requests.iter().all(|r| r.inpaint_mask.as_ref() == Some(&mask)));
    }

    #[test]
    fn test_mask_ignored_without_init_images() {
        let s = GenerationSettings {
            image_mode: ImageMode::ImageMask,
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        assert!(jobs.requests.iter().all(|r| r.inpaint_mask.is_none()));
    }

    #[test]
    fn test_short_wildcard_expansion_is_config_error() {
        struct Short;
        impl PromptExpansion for Short {
            fn expand_all(&mut self, prompt: &str, _count: usize) -> Result<Vec<String>> {
                Ok(vec![prompt.to_string()])
            }
        }
        let err = expand(&settings(), &[], &ExpansionOptions::default(), &mut Short).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn test_generation_mode() {
        let opts = ExpansionOptions::default();
        let mut s = settings();
        assert_eq!(generation_mode(&s, &opts), GenerationMode::Txt2Img);

        s.init_images = vec![PathBuf::from("a.png")];
        s.model = PathBuf::from("/models/sdxl-inpainting.safetensors");
        assert_eq!(generation_mode(&s, &opts), GenerationMode::Img2Img);

        s.image_mode = ImageMode::ImageMask;
        assert_eq!(generation_mode(&s, &opts), GenerationMode::Inpaint);

        s.model = PathBuf::from("/models/sdxl_base.safetensors");
        assert_eq!(generation_mode(&s, &opts), GenerationMode::Img2Img);
    }

    #[test]
    fn test_uses_refiner_requires_every_strength() {
        assert!(uses_refiner(&[0.3, 0.05]));
        assert!(!uses_refiner(&[0.3, 0.0]));
    }

    #[test]
    fn test_summary_lines() {
        let s = GenerationSettings {
            scales_txt: vec![5.0, 7.5],
            ..settings()
        };
        let jobs = run(&s, &[], &ExpansionOptions::default());
        let [first, second] = jobs.summary_lines();
        assert_eq!(
            first,
            "Running Stable Diffusion - 2 Iterations, 1 Steps, Scales 5, 7.5, 1024x1024, Starting Seed: 100"
        );
        assert_eq!(
            second,
            "2 prompts * 2 images * 1 step value * 2 scales = 8 images total."
        );
    }

    #[test]
    fn test_seed_overflow_is_a_configuration_error() {
        let s = GenerationSettings {
            prompts: vec!["a cat".into()],
            iterations: 1,
            seed: i64::MAX,
            ..Default::default()
        };
        let err = expand(&s, &[], &ExpansionOptions::default(), &mut NoWildcards).unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(ref m) if m.contains("Seed range")));

        let locked = GenerationSettings {
            lock_seed: true,
            iterations: 3,
            ..s
        };
        let jobs = run(&locked, &[], &ExpansionOptions::default());
        assert!(jobs.requests.iter().all(|r| r.seed == i64::MAX));
    }
}
