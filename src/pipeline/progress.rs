//! Step-progress plumbing between the backend and observers.
//!
//! The backend reports bare step indices through
//! [`StepSink`](crate::backend::StepSink). A [`StageProgress`] adapter
//! tags them with the stage identity and step total, and
//! [`ProgressSink`] implementations fan the tagged events out to the
//! state record, the terminal, or test recorders.

use serde_json::json;
use tracing::warn;

use crate::backend::StepSink;
use crate::store::{JobStore, StateName};

/// Identifies which generation stage a step event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageId {
    /// The initial text-to-image stage.
    Txt2Img,
    /// A highres refinement pass, by zero-based index.
    Highres(u32),
}

impl StageId {
    /// Observer-facing label.
    pub fn label(&self) -> String {
        match self {
            StageId::Txt2Img => "txt2img".to_string(),
            StageId::Highres(index) => format!("highres_fix #{index}"),
        }
    }
}

/// Receives stage-tagged step progress.
pub trait ProgressSink {
    fn on_step(&mut self, stage: StageId, step: u32, total_steps: u32);
}

/// Ignores all progress.
#[cfg(test)]
pub struct NullProgress;

#[cfg(test)]
impl ProgressSink for NullProgress {
    fn on_step(&mut self, _stage: StageId, _step: u32, _total_steps: u32) {}
}

/// Mirrors step progress into the store's state record, then forwards
/// to an outer observer.
///
/// Write failures are logged and swallowed: progress is best-effort
/// and must never abort a generation already in flight.
pub struct StateProgress<'a> {
    store: &'a JobStore,
    observer: &'a mut dyn ProgressSink,
}

impl<'a> StateProgress<'a> {
    pub fn new(store: &'a JobStore, observer: &'a mut dyn ProgressSink) -> Self {
        Self { store, observer }
    }
}

impl ProgressSink for StateProgress<'_> {
    fn on_step(&mut self, stage: StageId, step: u32, total_steps: u32) {
        let (name, values) = match stage {
            StageId::Txt2Img => (
                StateName::Txt2Img,
                json!({"step": step, "total_steps": total_steps}),
            ),
            StageId::Highres(index) => (
                StateName::HighresFix,
                json!({"count": index, "step": step, "total_steps": total_steps}),
            ),
        };
        if let Err(err) = self.store.write_state(name, values) {
            warn!("progress write failed: {err}");
        }
        self.observer.on_step(stage, step, total_steps);
    }
}

/// Binds one generation stage's raw callbacks to a sink, adding the
/// stage identity and the step total the backend does not know.
pub struct StageProgress<'a> {
    sink: &'a mut dyn ProgressSink,
    stage: StageId,
    total_steps: u32,
}

impl<'a> StageProgress<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink, stage: StageId, total_steps: u32) -> Self {
        Self { sink, stage, total_steps }
    }

    /// Emits the synthetic final event after the backend call returns,
    /// so the record always reaches its total even when the backend
    /// stops reporting early.
    pub fn finish(&mut self) {
        self.sink.on_step(self.stage, self.total_steps, self.total_steps);
    }
}

impl StepSink for StageProgress<'_> {
    fn on_step(&mut self, step: u32) {
        self.sink.on_step(self.stage, step, self.total_steps);
    }
}
