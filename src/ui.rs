//! Terminal presentation of generation progress.
//!
//! Uses `indicatif` for the per-stage step bar and `console` for
//! colored summary lines. One bar is live at a time; finishing a stage
//! (or switching to the next one) retires it with a short summary.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::{ProgressSink, StageId};

/// Renders stage-tagged step progress as terminal bars.
pub struct TerminalProgress {
    bar: Option<(StageId, ProgressBar)>,
    green: Style,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self { bar: None, green: Style::new().green().bold() }
    }

    fn open_bar(&mut self, stage: StageId, total_steps: u32) {
        let pb = ProgressBar::new(u64::from(total_steps.max(1)));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg:>14} [{bar:30}] {pos}/{len}")
                .expect("invalid template")
                .progress_chars("=> "),
        );
        pb.set_message(stage.label());
        self.bar = Some((stage, pb));
    }

    fn finish_active(&mut self) {
        if let Some((stage, pb)) = self.bar.take() {
            pb.finish_and_clear();
            println!("  {} {}", self.green.apply_to("✓"), stage.label());
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalProgress {
    fn on_step(&mut self, stage: StageId, step: u32, total_steps: u32) {
        let switched = !matches!(&self.bar, Some((active, _)) if *active == stage);
        if switched {
            self.finish_active();
            self.open_bar(stage, total_steps);
        }
        if let Some((_, pb)) = &self.bar {
            pb.set_position(u64::from(step));
        }
        if step >= total_steps {
            self.finish_active();
        }
    }
}
