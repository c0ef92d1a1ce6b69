//! Backend failure surface.

use thiserror::Error;

/// Failures crossing the backend boundary.
///
/// Only [`TextualInversion`](BackendError::TextualInversion) is
/// recoverable; the pipeline treats every other variant as fatal for
/// the running job.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The model at the requested path/revision could not be loaded.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// One textual-inversion weight file could not be applied.
    #[error("textual inversion {name:?} failed: {reason}")]
    TextualInversion { name: String, reason: String },

    /// Embedding or generation failed mid-run.
    #[error("inference failed: {0}")]
    Inference(String),
}
