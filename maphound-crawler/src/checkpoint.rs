// Durable resume state: which probes are fully done and which result ids
// have already been emitted. The whole document is rewritten after every
// probe completion, so a crash loses at most one probe's worth of work.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub completed_probes: HashSet<String>,
    #[serde(default)]
    pub seen_result_ids: HashSet<String>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            completed_probes: HashSet::new(),
            seen_result_ids: HashSet::new(),
        }
    }
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or start fresh. A store that was never written
    /// yields empty sets; an unreadable or corrupt file is logged and
    /// treated the same way rather than failing the run.
    pub fn load(&self) -> Checkpoint {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(checkpoint) => {
                    tracing::info!(
                        probes = checkpoint.completed_probes.len(),
                        results = checkpoint.seen_result_ids.len(),
                        path = %self.path.display(),
                        "checkpoint loaded"
                    );
                    checkpoint
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unparsable, starting fresh");
                    Checkpoint::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no checkpoint found, starting fresh");
                Checkpoint::new()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, starting fresh");
                Checkpoint::new()
            }
        }
    }

    /// Atomically overwrite the checkpoint file: write a sibling temp file,
    /// then rename it into place.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let serialized = serde_json::to_string(checkpoint)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove the checkpoint file, if any.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
