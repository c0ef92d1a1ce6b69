//! Job lifecycle persistence: queued values, in-flight and completed
//! job records, and the single polled state event.
//!
//! Every record shared with concurrent readers is replaced through a
//! sibling temp file plus rename, so a reader polling the same path
//! never observes a partial write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::Image;
use crate::codec::{self, CodecError, Mask};
use crate::config::DaemonConfig;
use super::values::deep_merge;

/// Externally queued parameter updates, consumed at cycle start.
const VALUES_FILE: &str = "values.json";
/// Snapshot of the in-flight job, written before any backend work.
const CURRENT_JOB_FILE: &str = "current_job.json";
/// Record of the most recently completed job.
const LAST_JOB_FILE: &str = "last_job.json";
/// The single current state event, overwritten on every transition.
const STATE_FILE: &str = "state.json";

/// Timestamp format carried by job records.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Output filename prefix; microsecond precision keeps prefixes unique
/// within one second.
const PREFIX_FORMAT: &str = "%y%m%d-%H%M%S-%6f";

/// Store failures. Any of these aborts the current job cycle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact encoding failed: {0}")]
    Codec(#[from] CodecError),

    /// A job-scoped operation ran with no job accepted.
    #[error("no job is active")]
    NoActiveJob,
}

/// Stage names observers see in the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateName {
    LoadModel,
    UpdatePrompt,
    SetupParams,
    UpdateSampler,
    StartGenerate,
    #[serde(rename = "txt2img")]
    Txt2Img,
    SetupHighresParams,
    StartHighresFix,
    HighresFix,
    Done,
    Error,
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StateName::LoadModel => "load_model",
            StateName::UpdatePrompt => "update_prompt",
            StateName::SetupParams => "setup_params",
            StateName::UpdateSampler => "update_sampler",
            StateName::StartGenerate => "start_generate",
            StateName::Txt2Img => "txt2img",
            StateName::SetupHighresParams => "setup_highres_params",
            StateName::StartHighresFix => "start_highres_fix",
            StateName::HighresFix => "highres_fix",
            StateName::Done => "done",
            StateName::Error => "error",
        };
        f.write_str(name)
    }
}

/// The progress record observers poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub name: StateName,
    pub values: Value,
}

/// One job from acceptance to completion.
///
/// `image` is only populated while producing the encoded artifact; the
/// plain JSON records never carry it.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub values: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Owns the state and outputs directories for one daemon instance.
pub struct JobStore {
    state_root: PathBuf,
    outputs_root: PathBuf,
    save_raw: bool,
    image_format: String,
    mask: Mask,
    values: Value,
    job: Option<JobRecord>,
}

impl JobStore {
    /// Opens the store, creating both root directories.
    pub fn open(config: &DaemonConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.state_root)?;
        fs::create_dir_all(&config.outputs_root)?;
        Ok(Self {
            state_root: config.state_root.clone(),
            outputs_root: config.outputs_root.clone(),
            save_raw: config.save_raw,
            image_format: config.image_format.clone(),
            mask: codec::make_mask(&config.password),
            values: config.init_values.clone(),
            job: None,
        })
    }

    /// The accumulated request values.
    pub fn values(&self) -> &Value {
        &self.values
    }

    /// Consumes the queued-values file: merges its contents, then
    /// truncates it to an empty object so producers can tell the queue
    /// was taken. A missing file is a no-op; a malformed one is logged,
    /// skipped, and still truncated.
    pub fn merge_values(&mut self) -> Result<(), StoreError> {
        let path = self.state_root.join(VALUES_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(queued) => {
                debug!("merging queued values");
                deep_merge(&mut self.values, queued);
            }
            Err(err) => warn!("queued values are not valid JSON ({err}), skipping merge"),
        }
        write_atomic(&path, b"{}")?;
        Ok(())
    }

    /// Replays the values of a job record left behind by an unclean
    /// shutdown. Call once at startup, before the first cycle.
    pub fn merge_current_job(&mut self) {
        let path = self.state_root.join(CURRENT_JOB_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(mut record) => {
                if let Some(values) = record.get_mut("values") {
                    debug!("replaying values from an interrupted job");
                    deep_merge(&mut self.values, values.take());
                }
            }
            Err(err) => warn!("could not replay the interrupted job record: {err}"),
        }
    }

    /// Accepts the current values as a new job and persists the
    /// snapshot before any backend work begins.
    pub fn start_job(&mut self) -> Result<(), StoreError> {
        let job = JobRecord {
            start_time: Utc::now().format(TIME_FORMAT).to_string(),
            end_time: None,
            values: self.values.clone(),
            filename: None,
            image_format: None,
            image: None,
        };
        let rendered = serde_json::to_string(&job)?;
        write_atomic(&self.state_root.join(CURRENT_JOB_FILE), rendered.as_bytes())?;
        self.job = Some(job);
        Ok(())
    }

    /// Overwrites the in-flight job's prompt fields with their resolved
    /// texts and re-persists the snapshot, so jobs using random-choice
    /// groups keep a reproducible record of what actually ran.
    pub fn record_resolved_prompts(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
    ) -> Result<(), StoreError> {
        let job = self.job.as_mut().ok_or(StoreError::NoActiveJob)?;
        if let Some(params) = job.values.get_mut("params").and_then(Value::as_object_mut) {
            params.insert("prompt".to_string(), Value::String(prompt.to_string()));
            params.insert(
                "negative_prompt".to_string(),
                Value::String(negative_prompt.to_string()),
            );
        }
        let rendered = serde_json::to_string(&*job)?;
        write_atomic(&self.state_root.join(CURRENT_JOB_FILE), rendered.as_bytes())?;
        Ok(())
    }

    /// Completes the active job: stamps the end time, writes the
    /// last-job record, optionally saves raw outputs, and always writes
    /// the encoded artifact. Returns the output filename prefix.
    pub fn end_job(&mut self, image: Option<&Image>) -> Result<String, StoreError> {
        let mut job = self.job.take().ok_or(StoreError::NoActiveJob)?;
        let now = Utc::now();
        let prefix = now.format(PREFIX_FORMAT).to_string();
        job.end_time = Some(now.format(TIME_FORMAT).to_string());
        job.filename = Some(prefix.clone());
        job.image_format = Some(self.image_format.clone());

        let rendered = serde_json::to_string(&job)?;
        write_atomic(&self.state_root.join(LAST_JOB_FILE), rendered.as_bytes())?;

        if let Some(image) = image {
            if self.save_raw {
                let raw_path = self
                    .outputs_root
                    .join(format!("{prefix}.{}", self.image_format));
                fs::write(raw_path, &image.data)?;
                let values_path = self.outputs_root.join(format!("{prefix}.json"));
                fs::write(values_path, serde_json::to_string(&job.values)?)?;
            }
            job.image = Some(STANDARD.encode(&image.data));
        }

        let artifact = codec::encode(&self.mask, &serde_json::to_string(&job)?)?;
        fs::write(self.outputs_root.join(format!("{prefix}.a")), artifact)?;
        Ok(prefix)
    }

    /// Publishes the state event observers poll; last write wins.
    pub fn write_state(&self, name: StateName, values: Value) -> Result<(), StoreError> {
        let event = StateEvent { name, values };
        let rendered = serde_json::to_string(&event)?;
        write_atomic(&self.state_root.join(STATE_FILE), rendered.as_bytes())?;
        Ok(())
    }
}

/// Whole-file replacement through a sibling temp file and rename.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
