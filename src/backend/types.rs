//! Value types crossing the backend boundary.

use std::path::PathBuf;

/// Everything that identifies a loaded model. Two requests with equal
/// specs can share one loaded pipeline; any difference forces a reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Weights location, already joined against the models root.
    pub path: PathBuf,
    pub revision: Option<String>,
    pub variant: Option<String>,
    pub clip_skip: Option<u32>,
    pub lora_path: Option<PathBuf>,
    pub lora_alpha: Option<f64>,
}

/// Denoising schedulers a request may select by sampler name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    Euler,
    EulerAncestral,
    Lms,
    Heun,
    Ddim,
    DdimInverse,
    Ddpm,
    /// DPM++ single-step at the given solver order.
    DpmSinglestep { order: u8 },
    /// DPM++ multi-step at the given solver order, optionally on
    /// Karras sigma spacing.
    DpmMultistep { order: u8, karras_sigmas: bool },
    Pndm,
    Ipndm,
}

impl SchedulerKind {
    /// Maps a request's sampler name onto a scheduler; `None` for
    /// names outside the recognized set.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "Euler" => Self::Euler,
            "Euler A" => Self::EulerAncestral,
            "LMS" => Self::Lms,
            "Heun" => Self::Heun,
            "DDIM" => Self::Ddim,
            "DDIM Inverse" => Self::DdimInverse,
            "DDPM" => Self::Ddpm,
            "DPM++ 2S" => Self::DpmSinglestep { order: 2 },
            "DPM++ 2M" => Self::DpmMultistep { order: 2, karras_sigmas: false },
            "DPM++ 2M Karras" => Self::DpmMultistep { order: 2, karras_sigmas: true },
            "DPM++ 3S" => Self::DpmSinglestep { order: 3 },
            "DPM++ 3M" => Self::DpmMultistep { order: 3, karras_sigmas: false },
            "DPM++ 3M Karras" => Self::DpmMultistep { order: 3, karras_sigmas: true },
            "PNDM" => Self::Pndm,
            "IPNDM" => Self::Ipndm,
            _ => return None,
        };
        Some(kind)
    }
}

/// A prompt embedding. The pipeline blends these; the backend only
/// produces them.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// One step of the blend recurrence: move this embedding toward
    /// `other` by `weight`.
    pub fn blend_toward(&mut self, other: &Embedding, weight: f64) {
        debug_assert_eq!(self.0.len(), other.0.len());
        for (acc, value) in self.0.iter_mut().zip(&other.0) {
            *acc += weight as f32 * (value - *acc);
        }
    }
}

/// A generated image: encoded bytes plus pixel dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Parameters for the initial text-to-image call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    /// Seeds the backend's generator; `None` leaves it to entropy.
    pub seed: Option<u64>,
}

/// Parameters for one image-conditioned refinement call.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineParams {
    /// Size the prior image is brought to before refinement.
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    /// Denoise strength in `0..=1`; the effective step count is
    /// `trunc(steps * strength)`.
    pub strength: f64,
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_recognized_sampler_name_maps() {
        let names = [
            "Euler", "Euler A", "LMS", "Heun", "DDIM", "DDIM Inverse", "DDPM", "DPM++ 2S",
            "DPM++ 2M", "DPM++ 2M Karras", "DPM++ 3S", "DPM++ 3M", "DPM++ 3M Karras", "PNDM",
            "IPNDM",
        ];
        for name in names {
            assert!(SchedulerKind::from_name(name).is_some(), "{name} did not map");
        }
    }

    #[test]
    fn unknown_and_miscased_names_do_not_map() {
        assert_eq!(SchedulerKind::from_name("Warp"), None);
        assert_eq!(SchedulerKind::from_name("euler"), None);
        assert_eq!(SchedulerKind::from_name(""), None);
    }

    #[test]
    fn karras_variants_carry_their_flag() {
        assert_eq!(
            SchedulerKind::from_name("DPM++ 2M Karras"),
            Some(SchedulerKind::DpmMultistep { order: 2, karras_sigmas: true })
        );
        assert_eq!(
            SchedulerKind::from_name("DPM++ 3M"),
            Some(SchedulerKind::DpmMultistep { order: 3, karras_sigmas: false })
        );
    }

    #[test]
    fn blend_moves_the_accumulator_toward_the_target() {
        let mut acc = Embedding(vec![0.0, 0.0]);
        acc.blend_toward(&Embedding(vec![1.0, 2.0]), 1.0);
        assert_eq!(acc, Embedding(vec![1.0, 2.0]));
        acc.blend_toward(&Embedding(vec![0.0, 0.0]), 0.5);
        assert_eq!(acc, Embedding(vec![0.5, 1.0]));
    }
}
