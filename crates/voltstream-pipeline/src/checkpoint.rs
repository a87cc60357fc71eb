//! Transformer checkpoint (`transform_state.json`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use voltstream_storage::{EntityKey, Timestamp};

use crate::{Result, TransformError};

pub const TRANSFORM_STATE_VERSION_V1: &str = "voltstream_transform_state_v1";

/// Landing offset up to which every touched key has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformState {
    pub version: String,
    pub watermark: u64,
    #[serde(default)]
    pub last_run: Option<Uuid>,
    #[serde(default)]
    pub last_run_at: Option<Timestamp>,
    /// Set between the runs of a `max_keys`-bounded pass.
    #[serde(default)]
    pub staged: Option<StagedPass>,
}

/// Progress of a pass split over several bounded runs.
///
/// Keys are visited in order; the next run resumes strictly after `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedPass {
    /// Watermark the pass started from.
    pub from: u64,
    /// Watermark the pass advances to once its last key is applied.
    pub through: u64,
    pub after: EntityKey,
    /// A key failed in an earlier stage; the pass ends without advancing.
    #[serde(default)]
    pub failed: bool,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            version: TRANSFORM_STATE_VERSION_V1.to_string(),
            watermark: 0,
            last_run: None,
            last_run_at: None,
            staged: None,
        }
    }
}

impl TransformState {
    /// Load the checkpoint; a missing file means "never ran".
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(checkpoint_error(path, e)),
        };
        let state: Self = serde_json::from_slice(&bytes).map_err(|e| checkpoint_error(path, e))?;
        if state.version != TRANSFORM_STATE_VERSION_V1 {
            return Err(checkpoint_error(
                path,
                format!("unsupported checkpoint version `{}`", state.version),
            ));
        }
        Ok(state)
    }

    /// Write via temp file + rename so a crash leaves the old checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| checkpoint_error(path, e))?;
            }
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| checkpoint_error(path, e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| checkpoint_error(path, e))?;
        fs::rename(&tmp, path).map_err(|e| checkpoint_error(path, e))?;
        Ok(())
    }
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> TransformError {
    TransformError::Checkpoint {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
