//! Layered JSON configuration.
//!
//! Configuration comes from one or more JSON documents deep-merged in
//! listed order, so a checked-in defaults file can ship next to a
//! local override (the conventional pair is `default_config.json`
//! followed by `config.json`). Every listed file must exist and parse.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::store::values::deep_merge;

/// Daemon configuration after merging all layers.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Passphrase the artifact codec derives its mask from.
    pub password: String,
    /// Directory model weights and textual inversions live under.
    pub models_root: PathBuf,
    /// Directory for the values, job, and state records.
    pub state_root: PathBuf,
    /// Directory finished artifacts are written to.
    pub outputs_root: PathBuf,
    /// Also write the raw image and plain values JSON next to the
    /// encoded artifact.
    #[serde(default)]
    pub save_raw: bool,
    #[serde(default = "default_image_format")]
    pub image_format: String,
    /// Request values the daemon starts from before any queued merge.
    #[serde(default = "empty_object")]
    pub init_values: Value,
}

fn default_image_format() -> String {
    "png".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl DaemonConfig {
    /// Loads and merges the given config files in order.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = empty_object();
        for path in paths {
            let path = path.as_ref();
            let raw = fs::read_to_string(path)
                .with_context(|| format!("could not read config file {}", path.display()))?;
            let layer: Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
            deep_merge(&mut merged, layer);
        }
        serde_json::from_value(merged).context("merged configuration is incomplete or mistyped")
    }
}
