//! Configuration snapshots and the stores that keep them.
//!
//! Each snapshot gets its own key, built from the device identifier and a
//! microsecond timestamp, so concurrent devices never write the same file.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

/// Whether a snapshot was taken before or after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Captured before any change was applied.
    Backup,
    /// Captured after apply, for verification.
    Applied,
}

/// A captured configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub device_id: String,
    pub kind: SnapshotKind,
    pub captured_at: DateTime<Utc>,
    pub text: String,
}

impl ConfigSnapshot {
    /// Snapshot of the pre-change configuration, captured now.
    pub fn backup(device_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(device_id, SnapshotKind::Backup, text)
    }

    /// Snapshot of the post-change configuration, captured now.
    pub fn applied(device_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(device_id, SnapshotKind::Applied, text)
    }

    fn new(device_id: impl Into<String>, kind: SnapshotKind, text: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            captured_at: Utc::now(),
            text: text.into(),
        }
    }
}

/// Reference to a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SnapshotHandle {
    pub device_id: String,
    pub kind: SnapshotKind,
    pub captured_at: DateTime<Utc>,
    /// Store-specific location (a file path for [`FileBackupStore`]).
    pub location: String,
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// Persists configuration snapshots.
///
/// Implementations must accept concurrent writes from many devices.
pub trait BackupStore: Send + Sync + 'static {
    /// Persist a snapshot and return its handle.
    fn put(
        &self,
        snapshot: ConfigSnapshot,
    ) -> impl Future<Output = Result<SnapshotHandle, StorageError>> + Send;

    /// Read back the text of a stored snapshot.
    fn load(
        &self,
        handle: &SnapshotHandle,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// Persist a pre-change backup of `device_id`.
    fn save(
        &self,
        device_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<SnapshotHandle, StorageError>> + Send {
        self.put(ConfigSnapshot::backup(device_id, text))
    }

    /// Persist a post-change capture of `device_id`.
    fn save_applied(
        &self,
        device_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<SnapshotHandle, StorageError>> + Send {
        self.put(ConfigSnapshot::applied(device_id, text))
    }
}

// =============================================================================
// FileBackupStore
// =============================================================================

/// Stores each snapshot as `{device_id}-{timestamp}.cfg` in a directory.
///
/// Post-change captures are named `{device_id}-{timestamp}-applied.cfg`.
/// Files are created exclusively; if a name is taken a `.N` suffix is added.
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    dir: PathBuf,
}

impl FileBackupStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory snapshots are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(snapshot: &ConfigSnapshot) -> String {
        let timestamp = snapshot.captured_at.format("%Y%m%dT%H%M%S%.6fZ");
        let device = sanitize(&snapshot.device_id);
        match snapshot.kind {
            SnapshotKind::Backup => format!("{device}-{timestamp}"),
            SnapshotKind::Applied => format!("{device}-{timestamp}-applied"),
        }
    }
}

impl BackupStore for FileBackupStore {
    async fn put(&self, snapshot: ConfigSnapshot) -> Result<SnapshotHandle, StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let stem = Self::file_stem(&snapshot);
        let mut attempt = 0u32;
        let (path, mut file) = loop {
            let name = if attempt == 0 {
                format!("{stem}.cfg")
            } else {
                format!("{stem}.{attempt}.cfg")
            };
            let path = self.dir.join(name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => return Err(StorageError::Write { path, source }),
            }
        };

        let written = async {
            file.write_all(snapshot.text.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(source) = written {
            return Err(StorageError::Write { path, source });
        }

        debug!(
            "{}: stored {:?} snapshot at {}",
            snapshot.device_id,
            snapshot.kind,
            path.display()
        );

        Ok(SnapshotHandle {
            device_id: snapshot.device_id,
            kind: snapshot.kind,
            captured_at: snapshot.captured_at,
            location: path.to_string_lossy().into_owned(),
        })
    }

    async fn load(&self, handle: &SnapshotHandle) -> Result<String, StorageError> {
        tokio::fs::read_to_string(&handle.location)
            .await
            .map_err(|source| {
                if source.kind() == ErrorKind::NotFound {
                    StorageError::NotFound {
                        location: handle.location.clone(),
                    }
                } else {
                    StorageError::Read {
                        location: handle.location.clone(),
                        source,
                    }
                }
            })
    }
}

/// Make a device identifier safe to use as a file name.
fn sanitize(device_id: &str) -> String {
    let cleaned: String = device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "device".to_string()
    } else {
        cleaned
    }
}

// =============================================================================
// MemoryBackupStore
// =============================================================================

/// In-process store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    snapshots: Mutex<HashMap<String, ConfigSnapshot>>,
    sequence: AtomicU64,
}

impl MemoryBackupStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored snapshots for `device_id`, oldest first.
    pub fn snapshots_for(&self, device_id: &str) -> Vec<ConfigSnapshot> {
        let snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut found: Vec<_> = snapshots
            .iter()
            .filter(|(_, s)| s.device_id == device_id)
            .map(|(location, s)| (location.clone(), s.clone()))
            .collect();
        found.sort_by(|a, b| a.1.captured_at.cmp(&b.1.captured_at).then(a.0.cmp(&b.0)));
        found.into_iter().map(|(_, s)| s).collect()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackupStore for MemoryBackupStore {
    async fn put(&self, snapshot: ConfigSnapshot) -> Result<SnapshotHandle, StorageError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let location = format!("memory://{}/{:08}", snapshot.device_id, sequence);
        let handle = SnapshotHandle {
            device_id: snapshot.device_id.clone(),
            kind: snapshot.kind,
            captured_at: snapshot.captured_at,
            location: location.clone(),
        };
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(location, snapshot);
        Ok(handle)
    }

    async fn load(&self, handle: &SnapshotHandle) -> Result<String, StorageError> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&handle.location)
            .map(|s| s.text.clone())
            .ok_or_else(|| StorageError::NotFound {
                location: handle.location.clone(),
            })
    }
}
