//! File-backed relay state: processed keys and per-channel high-water marks.
//!
//! Layout on disk (compatible with files that only carry `message_ids`):
//!
//! ```json
//! { "message_ids": ["@news_41", "@news_42"], "high_water_marks": { "@news": 42 } }
//! ```
//!
//! Loading never fails: a missing file starts empty, a corrupt one starts
//! empty with a warning. Flushing never fails either; write errors are logged.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StateError;

/// Default state file location.
pub const DEFAULT_STATE_FILE: &str = "/tmp/forwarded_messages.json";

/// Identity of a source item that has been relayed (or deliberately skipped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedKey {
    pub channel: String,
    pub item_id: i64,
}

impl ProcessedKey {
    pub fn new(channel: impl Into<String>, item_id: i64) -> Self {
        Self {
            channel: channel.into(),
            item_id,
        }
    }
}

impl fmt::Display for ProcessedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel, self.item_id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    message_ids: Vec<String>,
    #[serde(default)]
    high_water_marks: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct Inner {
    processed: HashSet<String>,
    high_water: BTreeMap<String, i64>,
    dirty: bool,
}

/// Durable processed-key set shared by every channel worker.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Load state from `path`, starting empty if it is missing or unreadable.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = match read_snapshot(&path).await {
            Ok(Some(snapshot)) => {
                info!(
                    path = %path.display(),
                    keys = snapshot.message_ids.len(),
                    channels = snapshot.high_water_marks.len(),
                    "Loaded relay state"
                );
                Inner {
                    processed: snapshot.message_ids.into_iter().collect(),
                    high_water: snapshot.high_water_marks,
                    dirty: false,
                }
            }
            Ok(None) => {
                debug!(path = %path.display(), "No state file yet, starting empty");
                Inner::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable state file");
                Inner::default()
            }
        };

        Self {
            path,
            inner: Mutex::new(inner),
        }
    }

    /// Empty store that flushes to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_processed(&self, key: &ProcessedKey) -> bool {
        self.inner.lock().await.processed.contains(&key.to_string())
    }

    /// Record `key`. Marking an already-recorded key changes nothing.
    pub async fn mark_processed(&self, key: &ProcessedKey) {
        let mut inner = self.inner.lock().await;
        if inner.processed.insert(key.to_string()) {
            inner.dirty = true;
        }
    }

    pub async fn high_water_mark(&self, channel: &str) -> Option<i64> {
        self.inner.lock().await.high_water.get(channel).copied()
    }

    /// Raise the channel's high-water mark to `item_id` if it is higher.
    pub async fn observe(&self, channel: &str, item_id: i64) {
        let mut inner = self.inner.lock().await;
        let current = inner.high_water.get(channel).copied();
        if current.is_none_or(|hw| item_id > hw) {
            inner.high_water.insert(channel.to_string(), item_id);
            inner.dirty = true;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.processed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.processed.is_empty()
    }

    /// Persist the snapshot if it changed. Errors are logged, never returned.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.dirty {
            return;
        }

        let mut message_ids: Vec<String> = inner.processed.iter().cloned().collect();
        message_ids.sort();
        let snapshot = Snapshot {
            message_ids,
            high_water_marks: inner.high_water.clone(),
        };

        match write_snapshot(&self.path, &snapshot).await {
            Ok(()) => {
                inner.dirty = false;
                debug!(path = %self.path.display(), keys = snapshot.message_ids.len(), "Flushed relay state");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to flush relay state");
            }
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, StateError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Write to a sibling temp file, then rename over the target.
async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
