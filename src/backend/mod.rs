//! The image-synthesis collaborator boundary.
//!
//! Everything numerical (model weights, schedulers, denoising) lives
//! behind [`Backend`]; the daemon drives the trait and never looks
//! inside. The bundled [`SyntheticBackend`] is a deterministic dry-run
//! stand-in so the binary runs end to end without an accelerator.

pub mod error;
pub mod synthetic;
pub mod types;

pub use error::BackendError;
pub use synthetic::SyntheticBackend;
pub use types::{Embedding, GenerateParams, Image, ModelSpec, RefineParams, SchedulerKind};

use std::path::Path;

/// Receives raw per-step callbacks during one generation call.
///
/// Implementations must stay cheap; they run synchronously inside the
/// backend's denoising loop.
pub trait StepSink {
    fn on_step(&mut self, step: u32);
}

/// An image-synthesis backend.
///
/// `Model` is whatever handle the implementation keeps between calls;
/// the pipeline stores it opaquely in its cache and hands it back on
/// every operation.
pub trait Backend {
    type Model;

    /// Loads (or reloads) the model described by `spec`.
    fn load_model(&mut self, spec: &ModelSpec) -> Result<Self::Model, BackendError>;

    /// Applies one textual-inversion weight file from the models root.
    fn load_textual_inversion(
        &mut self,
        model: &mut Self::Model,
        models_root: &Path,
        name: &str,
    ) -> Result<(), BackendError>;

    /// Embeds one sentence.
    fn embed(&mut self, model: &Self::Model, sentence: &str) -> Result<Embedding, BackendError>;

    /// Switches the denoising scheduler for subsequent generation.
    fn set_scheduler(
        &mut self,
        model: &mut Self::Model,
        kind: SchedulerKind,
    ) -> Result<(), BackendError>;

    /// Runs text-to-image generation, reporting every denoising step.
    fn generate(
        &mut self,
        model: &Self::Model,
        positive: &Embedding,
        negative: &Embedding,
        params: &GenerateParams,
        steps: &mut dyn StepSink,
    ) -> Result<Image, BackendError>;

    /// Refines `image` at the requested size and strength.
    fn generate_from_image(
        &mut self,
        model: &Self::Model,
        image: &Image,
        positive: &Embedding,
        negative: &Embedding,
        params: &RefineParams,
        steps: &mut dyn StepSink,
    ) -> Result<Image, BackendError>;
}
