//! Durable file-backed storage backend.
//!
//! [`FileBackend`] keeps the full key space in memory and mirrors it to a
//! single JSON snapshot file. Every mutation writes a complete snapshot to a
//! sibling temp file, syncs it, and renames it over the previous snapshot, so
//! a crash leaves either the old or the new snapshot on disk, never a torn
//! one.
//!
//! A mutation is applied to the in-memory view only after its snapshot has
//! reached disk. Readers therefore never observe a value that could be lost
//! by a restart.
//!
//! # Concurrency
//!
//! All operations are serialized by one async mutex. Compare-and-set is
//! therefore atomic for every clone of the same `FileBackend`. Opening the
//! same file from two independent `FileBackend` instances is not supported.
//!
//! # Example
//!
//! ```no_run
//! use signet_storage::{FileBackend, StorageBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = FileBackend::open("/var/lib/signet/counters.json").await?;
//! backend.set(b"keyusage/1/ab".to_vec(), b"{\"count\":1}".to_vec()).await?;
//!
//! // A fresh handle on the same path sees the persisted value.
//! let reopened = FileBackend::open("/var/lib/signet/counters.json").await?;
//! assert!(reopened.get(b"keyusage/1/ab").await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::{cas_matches, scan_prefix},
    types::KeyValue,
};

/// Current on-disk snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Snapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotEntry {
    key: String,
    value: String,
}

struct FileInner {
    path: PathBuf,
    data: Mutex<BTreeMap<Vec<u8>, Bytes>>,
}

/// Storage backend persisted to a JSON snapshot file.
///
/// Cheaply cloneable; all clones share the same in-memory view and file.
#[derive(Clone)]
pub struct FileBackend {
    inner: Arc<FileInner>,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend").field("path", &self.inner.path).finish_non_exhaustive()
    }
}

impl FileBackend {
    /// Opens the snapshot at `path`, creating an empty store if the file does
    /// not exist yet.
    ///
    /// Parent directories are created on demand.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Io`] if the file or its directory cannot be read or created
    /// - [`StorageError::Serialization`] if the snapshot is corrupt or has an unknown version
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::io_with_source(
                    format!("failed to create directory {}", parent.display()),
                    e,
                )
            })?;
        }

        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_snapshot(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StorageError::io_with_source(
                    format!("failed to read snapshot {}", path.display()),
                    e,
                ));
            },
        };

        tracing::debug!(path = %path.display(), keys = data.len(), "opened file backend");

        Ok(Self { inner: Arc::new(FileInner { path, data: Mutex::new(data) }) })
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Applies `change` to a copy of the current state, persists the copy,
    /// and only then publishes it.
    ///
    /// `change` returns `Ok(false)` when it made no modification, in which
    /// case nothing is written.
    async fn mutate<F>(&self, change: F) -> StorageResult<()>
    where
        F: FnOnce(&mut BTreeMap<Vec<u8>, Bytes>) -> StorageResult<bool> + Send,
    {
        let mut data = self.inner.data.lock().await;
        let mut next = data.clone();
        if !change(&mut next)? {
            return Ok(());
        }
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    async fn persist(&self, data: &BTreeMap<Vec<u8>, Bytes>) -> StorageResult<()> {
        let bytes = encode_snapshot(data)?;
        let path = &self.inner.path;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let io_err = |what: &str, e: std::io::Error| {
            StorageError::io_with_source(format!("{what} {}", tmp.display()), e)
        };

        let mut file =
            tokio::fs::File::create(&tmp).await.map_err(|e| io_err("failed to create", e))?;
        file.write_all(&bytes).await.map_err(|e| io_err("failed to write", e))?;
        file.sync_all().await.map_err(|e| io_err("failed to sync", e))?;
        drop(file);

        tokio::fs::rename(&tmp, path).await.map_err(|e| io_err("failed to rename", e))?;
        Ok(())
    }
}

fn encode_snapshot(data: &BTreeMap<Vec<u8>, Bytes>) -> StorageResult<Vec<u8>> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        entries: data
            .iter()
            .map(|(k, v)| SnapshotEntry { key: STANDARD.encode(k), value: STANDARD.encode(v) })
            .collect(),
    };
    serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| StorageError::serialization_with_source("failed to encode snapshot", e))
}

fn decode_snapshot(bytes: &[u8]) -> StorageResult<BTreeMap<Vec<u8>, Bytes>> {
    let snapshot: Snapshot = serde_json::from_slice(bytes)
        .map_err(|e| StorageError::serialization_with_source("failed to decode snapshot", e))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StorageError::serialization(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    let mut data = BTreeMap::new();
    for entry in snapshot.entries {
        let key = STANDARD
            .decode(entry.key.as_bytes())
            .map_err(|e| StorageError::serialization_with_source("invalid snapshot key", e))?;
        let value = STANDARD
            .decode(entry.value.as_bytes())
            .map_err(|e| StorageError::serialization_with_source("invalid snapshot value", e))?;
        data.insert(key, Bytes::from(value));
    }
    Ok(data)
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let data = self.inner.data.lock().await;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.mutate(move |data| {
            data.insert(key, Bytes::from(value));
            Ok(true)
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(path = %self.inner.path.display()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.mutate(move |data| {
            if !cas_matches(expected, data.get(key)) {
                return Err(StorageError::Conflict);
            }
            data.insert(key.to_vec(), Bytes::from(new_value));
            Ok(true)
        })
        .await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.mutate(move |data| Ok(data.remove(key).is_some())).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let data = self.inner.data.lock().await;
        Ok(scan_prefix(&data, prefix))
    }

    async fn health_check(&self) -> StorageResult<()> {
        let _unused = self.inner.data.lock().await;
        let dir = self.inner.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            tokio::fs::metadata(dir).await.map_err(|e| {
                StorageError::io_with_source(format!("snapshot directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }
}
