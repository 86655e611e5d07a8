use crate::config::SYNC_STATE_VERSION;
use anyhow::{Context, Result};
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// When the index was last rebuilt or updated, so `update` knows where to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    pub last_rebuild: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub pois_indexed: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: SYNC_STATE_VERSION,
            last_rebuild: None,
            last_update: None,
            pois_indexed: 0,
        }
    }
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("sync_state.bin")
}

impl SyncState {
    /// Latest point in time the index is known to reflect.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match (self.last_rebuild, self.last_update) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn record_rebuild(&mut self, at: DateTime<Utc>, pois_indexed: u64) {
        self.last_rebuild = Some(at);
        self.last_update = None;
        self.pois_indexed = pois_indexed;
    }

    pub fn record_update(&mut self, at: DateTime<Utc>, pois_written: u64) {
        self.last_update = Some(at);
        self.pois_indexed = self.pois_indexed.saturating_add(pois_written);
    }

    /// Returns `None` when the file is missing, unreadable or from another version.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let file = File::open(path)
            .with_context(|| format!("Failed to open sync state: {:?}", path))?;
        let reader = BufReader::new(file);
        let options = bincode::options().with_limit(file_size.saturating_add(1024));

        let state: SyncState = match options.deserialize_from(reader) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Sync state file is corrupt or unreadable");
                return Ok(None);
            }
        };

        if state.version != SYNC_STATE_VERSION {
            info!(
                cached = state.version,
                current = SYNC_STATE_VERSION,
                "Sync state version mismatch"
            );
            return Ok(None);
        }

        debug!(last_sync = ?state.last_sync(), "Loaded sync state");
        Ok(Some(state))
    }

    /// Writes to a temp file and renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let tmp_path = path.with_extension("bin.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp sync state: {:?}", tmp_path))?;
        let mut writer = BufWriter::new(file);
        bincode::options()
            .serialize_into(&mut writer, self)
            .context("Failed to serialize sync state")?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush temp sync state: {:?}", tmp_path))?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename temp sync state: {:?}", path))?;
        debug!(path = ?path, "Sync state saved");
        Ok(())
    }
}
