//! Snapshot persistence for the memory event store
//!
//! A `SnapshotStore` saves and loads the full set of stored events so a
//! `MemoryEventStore` can survive a process restart.

use super::StoredEvent;
use crate::error::{EventError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Backend for event store snapshots
pub trait SnapshotStore: Send + Sync {
    /// Replace the snapshot with `events`
    fn save(&self, events: &[StoredEvent]) -> Result<()>;

    /// Load the last snapshot; empty when none exists
    fn load(&self) -> Result<Vec<StoredEvent>>;
}

/// Current on-disk snapshot layout
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOut<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    events: &'a [StoredEvent],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeIn {
    events: Vec<StoredEvent>,
}

#[derive(Deserialize)]
struct VersionTag {
    version: u32,
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> EventError {
    EventError::Storage(format!("snapshot {}: cannot {action}: {e}", path.display()))
}

/// JSON file snapshot
///
/// The file holds `{"version", "savedAt", "events"}`. Saves write a sibling
/// `.partial` file, sync it, and rename it into place, so readers only ever
/// see a complete envelope. Files written by an unknown version are refused.
pub struct FileSnapshotStore {
    path: PathBuf,
    pretty: bool,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pretty: false,
        }
    }

    /// Indent the JSON for humans; compact by default
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partial_path(&self) -> PathBuf {
        self.path.with_extension("partial")
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, events: &[StoredEvent]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| io_failure("create parent directory", dir, e))?;
        }

        let envelope = EnvelopeOut {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            events,
        };
        let partial = self.partial_path();
        let file = File::create(&partial).map_err(|e| io_failure("open for writing", &partial, e))?;
        let mut writer = BufWriter::new(file);
        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, &envelope)?;
        } else {
            serde_json::to_writer(&mut writer, &envelope)?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| io_failure("flush", &partial, e.into_error()))?;
        file.sync_all().map_err(|e| io_failure("sync", &partial, e))?;
        drop(file);

        std::fs::rename(&partial, &self.path).map_err(|e| io_failure("move into place", &self.path, e))?;

        tracing::debug!(path = %self.path.display(), count = events.len(), "Wrote event snapshot");
        Ok(())
    }

    fn load(&self) -> Result<Vec<StoredEvent>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_failure("read", &self.path, e)),
        };

        let malformed = |e: serde_json::Error| {
            EventError::Storage(format!("snapshot {}: malformed envelope: {e}", self.path.display()))
        };
        let tag: VersionTag = serde_json::from_slice(&raw).map_err(malformed)?;
        if tag.version != SNAPSHOT_VERSION {
            return Err(EventError::Storage(format!(
                "snapshot {}: version {} is not supported (expected {SNAPSHOT_VERSION})",
                self.path.display(),
                tag.version
            )));
        }
        let envelope: EnvelopeIn = serde_json::from_slice(&raw).map_err(malformed)?;

        tracing::debug!(path = %self.path.display(), count = envelope.events.len(), "Read event snapshot");
        Ok(envelope.events)
    }
}

/// Run `store.save` on the blocking pool
pub(crate) async fn save_off_thread(store: Arc<dyn SnapshotStore>, events: Vec<StoredEvent>) -> Result<()> {
    tokio::task::spawn_blocking(move || store.save(&events))
        .await
        .map_err(|e| EventError::Storage(format!("snapshot save task failed: {e}")))?
}

/// Run `store.load` on the blocking pool
pub(crate) async fn load_off_thread(store: Arc<dyn SnapshotStore>) -> Result<Vec<StoredEvent>> {
    tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| EventError::Storage(format!("snapshot load task failed: {e}")))?
}

/// In-memory snapshot for tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, events: &[StoredEvent]) -> Result<()> {
        *self.events.write().unwrap_or_else(PoisonError::into_inner) = events.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
