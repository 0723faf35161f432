//! Active-activation blob persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One still-active activation at shutdown time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveActivationBlob {
    pub activation_index: usize,
    pub remaining_ttl_ns: i64,
    #[serde(default)]
    pub active_on_boot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMetricBlob {
    pub metric_id: i64,
    pub activations: Vec<ActiveActivationBlob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConfigBlob {
    pub config_id: i64,
    pub config_uid: i32,
    pub metrics: Vec<ActiveMetricBlob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveConfigsBlob {
    pub configs: Vec<ActiveConfigBlob>,
}

/// Write the blob; an empty blob still writes so a stale file never
/// resurrects old activations.
pub fn save_active_configs(path: &Path, blob: &ActiveConfigsBlob) -> Result<(), StorageError> {
    let json = serde_json::to_string(blob)?;
    std::fs::write(path, json)?;
    info!(
        path = %path.display(),
        configs = blob.configs.len(),
        "Active activations saved"
    );
    Ok(())
}

/// Load the blob; a missing file is an empty blob, not an error.
pub fn load_active_configs(path: &Path) -> Result<ActiveConfigsBlob, StorageError> {
    if !path.exists() {
        debug!(path = %path.display(), "No active-activation blob on disk");
        return Ok(ActiveConfigsBlob::default());
    }
    let json = std::fs::read_to_string(path)?;
    let blob = serde_json::from_str(&json)?;
    Ok(blob)
}
