//! The job loop: consume queued values, run one generation, persist
//! the outcome, repeat.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tracing::{error, info};

use crate::backend::Backend;
use crate::config::DaemonConfig;
use crate::pipeline::{Pipeline, ProgressSink};
use crate::store::{JobStore, StateName};

/// Loop pacing knobs, mainly so tests never sleep.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Pause after a failed cycle before the values are retried.
    pub retry_delay: Duration,
    /// Number of cycles to run; `None` runs until interrupted.
    pub max_cycles: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { retry_delay: Duration::from_secs(5), max_cycles: None }
    }
}

/// Runs the daemon loop over `backend`.
///
/// A failed cycle publishes an `error` state event, sleeps, and starts
/// over with the same accumulated values, so a stuck request keeps
/// retrying until a queued update or an operator fixes it. Only store
/// bring-up failures abort the loop itself.
pub fn run<B: Backend>(
    config: DaemonConfig,
    backend: B,
    observer: &mut dyn ProgressSink,
    loop_config: LoopConfig,
) -> Result<()> {
    let mut store = JobStore::open(&config)?;
    store.merge_current_job();
    let mut pipeline = Pipeline::new(backend, config.models_root.clone());

    let mut cycle: u64 = 0;
    loop {
        if let Some(max) = loop_config.max_cycles
            && cycle >= max
        {
            return Ok(());
        }
        cycle += 1;

        let started = Instant::now();
        match run_cycle(&mut store, &mut pipeline, observer) {
            Ok(prefix) => {
                info!(
                    "cycle {cycle}: job {prefix} finished in {:.1}s",
                    started.elapsed().as_secs_f64()
                );
            }
            Err(err) => {
                error!("cycle {cycle}: job failed: {err:#}");
                if let Err(state_err) =
                    store.write_state(StateName::Error, json!({"message": err.to_string()}))
                {
                    error!("could not record the failure: {state_err}");
                }
                thread::sleep(loop_config.retry_delay);
            }
        }
    }
}

/// One full cycle: merge queued values, snapshot the job, generate,
/// finalize. Returns the output filename prefix.
fn run_cycle<B: Backend>(
    store: &mut JobStore,
    pipeline: &mut Pipeline<B>,
    observer: &mut dyn ProgressSink,
) -> Result<String> {
    store.merge_values()?;
    store.start_job()?;
    let image = pipeline.text_to_image(store, observer)?;
    let prefix = store.end_job(Some(&image))?;
    Ok(prefix)
}
