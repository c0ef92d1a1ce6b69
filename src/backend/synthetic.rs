//! Deterministic dry-run backend.
//!
//! Every output is a pure function of its inputs: embeddings come from
//! a hash-seeded generator and images are checkerboard PPMs, while the
//! full callback contract (step reporting, effective-step truncation,
//! inversion failures) behaves like a real backend would. This keeps
//! the daemon, its records, and its progress plumbing exercisable on
//! any machine.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    Backend, BackendError, Embedding, GenerateParams, Image, ModelSpec, RefineParams,
    SchedulerKind, StepSink,
};

/// Embedding width the synthetic backend emits.
const EMBEDDING_DIM: usize = 32;
/// Checkerboard cell size in pixels.
const CELL: u32 = 8;

/// Loaded-model stand-in.
#[derive(Debug)]
pub struct SyntheticModel {
    label: String,
    scheduler: SchedulerKind,
}

/// Dry-run backend.
#[derive(Debug, Default)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    fn hash_of(parts: &[&str]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for part in parts {
            part.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Backend for SyntheticBackend {
    type Model = SyntheticModel;

    fn load_model(&mut self, spec: &ModelSpec) -> Result<SyntheticModel, BackendError> {
        if spec.path.as_os_str().is_empty() {
            return Err(BackendError::ModelLoad("empty model path".to_string()));
        }
        // Every identity field lands in the label, so changing any of
        // them changes every downstream output.
        let mut label = spec.path.display().to_string();
        if let Some(revision) = &spec.revision {
            label.push_str(&format!("@{revision}"));
        }
        if let Some(variant) = &spec.variant {
            label.push_str(&format!("+{variant}"));
        }
        if let Some(clip_skip) = spec.clip_skip {
            label.push_str(&format!("#{clip_skip}"));
        }
        if let Some(lora_path) = &spec.lora_path {
            label.push_str(&format!("&{}", lora_path.display()));
            if let Some(alpha) = spec.lora_alpha {
                label.push_str(&format!(":{alpha}"));
            }
        }
        Ok(SyntheticModel {
            label,
            scheduler: SchedulerKind::DpmMultistep { order: 2, karras_sigmas: true },
        })
    }

    fn load_textual_inversion(
        &mut self,
        _model: &mut SyntheticModel,
        models_root: &Path,
        name: &str,
    ) -> Result<(), BackendError> {
        if models_root.join(name).exists() {
            Ok(())
        } else {
            Err(BackendError::TextualInversion {
                name: name.to_string(),
                reason: "weight file not found".to_string(),
            })
        }
    }

    fn embed(&mut self, model: &SyntheticModel, sentence: &str) -> Result<Embedding, BackendError> {
        let mut rng = StdRng::seed_from_u64(Self::hash_of(&[&model.label, sentence]));
        Ok(Embedding(
            (0..EMBEDDING_DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect(),
        ))
    }

    fn set_scheduler(
        &mut self,
        model: &mut SyntheticModel,
        kind: SchedulerKind,
    ) -> Result<(), BackendError> {
        model.scheduler = kind;
        Ok(())
    }

    fn generate(
        &mut self,
        model: &SyntheticModel,
        positive: &Embedding,
        _negative: &Embedding,
        params: &GenerateParams,
        steps: &mut dyn StepSink,
    ) -> Result<Image, BackendError> {
        if params.width == 0 || params.height == 0 {
            return Err(BackendError::Inference("image area is zero".to_string()));
        }
        for step in 0..params.steps {
            steps.on_step(step);
        }
        let seed = params
            .seed
            .unwrap_or_else(|| Self::hash_of(&[&model.label]))
            ^ tint(positive)
            ^ scheduler_salt(model.scheduler)
            ^ params.cfg_scale.to_bits();
        Ok(checkerboard(params.width, params.height, seed))
    }

    fn generate_from_image(
        &mut self,
        model: &SyntheticModel,
        image: &Image,
        positive: &Embedding,
        _negative: &Embedding,
        params: &RefineParams,
        steps: &mut dyn StepSink,
    ) -> Result<Image, BackendError> {
        if params.width == 0 || params.height == 0 {
            return Err(BackendError::Inference("image area is zero".to_string()));
        }
        let effective = (params.steps as f64 * params.strength) as u32;
        for step in 0..effective {
            steps.on_step(step);
        }
        let prior = image
            .data
            .iter()
            .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let seed = params
            .seed
            .unwrap_or_else(|| Self::hash_of(&[&model.label]))
            ^ tint(positive)
            ^ scheduler_salt(model.scheduler)
            ^ params.cfg_scale.to_bits()
            ^ prior;
        Ok(checkerboard(params.width, params.height, seed))
    }
}

fn tint(embedding: &Embedding) -> u64 {
    embedding
        .0
        .iter()
        .fold(0u64, |acc, v| acc.wrapping_add(v.to_bits() as u64))
}

fn scheduler_salt(kind: SchedulerKind) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    hasher.finish()
}

/// Renders a two-color checkerboard as a binary PPM.
fn checkerboard(width: u32, height: u32, seed: u64) -> Image {
    let mut rng = StdRng::seed_from_u64(seed);
    let light: [u8; 3] = [
        rng.gen_range(128u8..=255),
        rng.gen_range(128u8..=255),
        rng.gen_range(128u8..=255),
    ];
    let dark: [u8; 3] = [
        rng.gen_range(0u8..128),
        rng.gen_range(0u8..128),
        rng.gen_range(0u8..128),
    ];
    let mut data = format!("P6\n{width} {height}\n255\n").into_bytes();
    for y in 0..height {
        for x in 0..width {
            let cell = ((x / CELL) + (y / CELL)) % 2 == 0;
            data.extend_from_slice(if cell { &light } else { &dark });
        }
    }
    Image { width, height, data }
}
