//! Numeric parameter preparation for the generation stages.

use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::backend::{GenerateParams, RefineParams};
use crate::store::values::{GenerationParams, HighresPass};

/// Fallback dimension when a requested size is absent, negative, or
/// not an integer.
const FALLBACK_DIM: i64 = 16;
/// Bounds for a highres pass's relative scale factor.
const SCALE_RANGE: (f64, f64) = (0.1, 10.0);

/// Normalizes one requested dimension: fall back to the minimal
/// canvas, then round up to the next multiple of 8.
pub(crate) fn filter_image_size(requested: Option<i64>) -> u32 {
    let value = match requested {
        Some(v) if v >= 0 => v,
        _ => FALLBACK_DIM,
    };
    ((value + 7) / 8 * 8) as u32
}

/// Rounds an already-positive fractional dimension up to the next
/// multiple of 8.
fn round_up_8(value: f64) -> u32 {
    ((value / 8.0).ceil() * 8.0).max(0.0) as u32
}

/// Applies the symmetric `size_range` width jitter while holding the
/// pixel area constant, then re-rounds both dimensions.
pub(crate) fn jitter_size<R: Rng + ?Sized>(
    width: u32,
    height: u32,
    range: f64,
    rng: &mut R,
) -> (u32, u32) {
    if range <= 0.0 || width == 0 || height == 0 {
        return (width, height);
    }
    let area = width as f64 * height as f64;
    let factor = (1.0 + rng.gen_range(-range..=range)).max(0.1);
    let jittered_width = (width as f64 * factor).max(8.0);
    (round_up_8(jittered_width), round_up_8(area / jittered_width))
}

/// Parses an explicit seed; anything unusable is logged and ignored.
pub(crate) fn parse_seed(raw: &Value) -> Option<u64> {
    let parsed = match raw {
        Value::Number(n) => n.as_i64().map(|v| v as u64).or_else(|| n.as_u64()),
        Value::String(s) => s.trim().parse::<i64>().ok().map(|v| v as u64),
        _ => None,
    };
    if parsed.is_none() {
        warn!("seed {raw} is not an integer, generation stays nondeterministic");
    }
    parsed
}

/// Numeric parameters resolved once per job at the setup stage.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub seed: Option<u64>,
}

impl ResolvedParams {
    pub fn resolve<R: Rng + ?Sized>(params: &GenerationParams, rng: &mut R) -> Self {
        let mut width = filter_image_size(params.width);
        let mut height = filter_image_size(params.height);
        if let Some(range) = params.size_range {
            (width, height) = jitter_size(width, height, range, rng);
        }
        let seed = params.seed.as_ref().and_then(parse_seed);
        Self {
            width,
            height,
            steps: params.sampling_steps,
            cfg_scale: params.cfg_scale,
            seed,
        }
    }

    pub fn generate_params(&self) -> GenerateParams {
        GenerateParams {
            width: self.width,
            height: self.height,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            seed: self.seed,
        }
    }

    /// Builds the refinement call for one highres pass over a prior
    /// image of the given size. Also returns the pass's effective step
    /// total so progress can be reported against it.
    pub fn refine_params(
        &self,
        pass: &HighresPass,
        prior_width: u32,
        prior_height: u32,
    ) -> (RefineParams, u32) {
        let (width, height) = match pass.scale {
            Some(scale) => {
                let scale = scale.clamp(SCALE_RANGE.0, SCALE_RANGE.1);
                (
                    round_up_8(prior_width as f64 * scale),
                    round_up_8(prior_height as f64 * scale),
                )
            }
            None => (filter_image_size(pass.width), filter_image_size(pass.height)),
        };
        let total_steps = (self.steps as f64 * pass.strength) as u32;
        let params = RefineParams {
            width,
            height,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            strength: pass.strength,
            seed: self.seed,
        };
        (params, total_steps)
    }
}
