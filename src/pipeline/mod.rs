//! Generation orchestration: re-entry selection, the stage walk, and
//! progress fan-out.

mod cache;
mod orchestrator;
mod params;
mod progress;

pub use orchestrator::{Pipeline, PipelineError};
pub use progress::{ProgressSink, StageId};

#[cfg(test)]
pub use progress::NullProgress;
