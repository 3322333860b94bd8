//! Registry persisted as a JSON file.
//!
//! The file is re-read on every call so edits made by another process (for
//! example `chanrec add` while `chanrec run` is active) are picked up on the
//! next tick. Writes go to a sibling temp file that is renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ChannelRegistry, normalize_channel_name};
use crate::utils::fs;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    pub added_at: DateTime<Utc>,
}

pub struct JsonFileRegistry {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records. A missing file is an empty registry.
    pub async fn records(&self) -> Result<Vec<ChannelRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::io_path("reading registry", &self.path, e)),
        }
    }

    async fn store(&self, records: &[ChannelRecord]) -> Result<()> {
        fs::ensure_parent_dir(&self.path).await?;

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::io_path("writing registry", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::io_path("replacing registry", &self.path, e))?;

        debug!(path = %self.path.display(), count = records.len(), "Registry saved");
        Ok(())
    }
}

#[async_trait]
impl ChannelRegistry for JsonFileRegistry {
    /// Entries that are not valid channel names (the file may be edited by
    /// hand) are skipped.
    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .records()
            .await?
            .into_iter()
            .filter_map(|r| match normalize_channel_name(&r.name) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!(path = %self.path.display(), entry = %r.name, error = %e, "Skipping invalid registry entry");
                    None
                }
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn add(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await?;
        if records.iter().any(|r| r.name == name) {
            return Ok(false);
        }
        records.push(ChannelRecord {
            name: name.to_string(),
            added_at: Utc::now(),
        });
        records.sort_by(|a, b| a.name.cmp(&b.name));
        self.store(&records).await?;
        Ok(true)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await?;
        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Ok(false);
        }
        self.store(&records).await?;
        Ok(true)
    }
}
