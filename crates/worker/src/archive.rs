//! Archiving of completed requests.
//!
//! After a successful signing operation the pipeline hands the response to
//! every configured [`Archiver`]. Archiving never unwinds a completed
//! signature: failures are reported as [`WorkerError::ArchiveFailure`] and
//! logged by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use signet_storage::{StorageBackend, WorkerId};

use crate::{
    context::RequestContext,
    error::{Result, WorkerError},
};

/// Key prefix of archived records.
pub const ARCHIVE_PREFIX: &str = "archive/";

/// What an [`Archivable`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// The client's request payload.
    Request,
    /// The produced response payload.
    Response,
}

/// One item handed to the archivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archivable {
    archive_id: String,
    worker_id: WorkerId,
    kind: ArchiveKind,
    data: Bytes,
}

impl Archivable {
    /// Creates an archivable with a fresh archive id.
    #[must_use]
    pub fn new(worker_id: WorkerId, kind: ArchiveKind, data: impl Into<Bytes>) -> Self {
        Self { archive_id: uuid::Uuid::new_v4().to_string(), worker_id, kind, data: data.into() }
    }

    /// Returns the archive id.
    #[must_use]
    pub fn archive_id(&self) -> &str {
        &self.archive_id
    }

    /// Returns the worker that produced the item.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the item kind.
    #[must_use]
    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Returns the archived bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Destination for archivables.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Archives `item`. Returns `false` if the archiver chose to skip it.
    async fn archive(&self, item: &Archivable, ctx: &RequestContext) -> Result<bool>;
}

#[async_trait]
impl<A: Archiver + ?Sized> Archiver for Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn archive(&self, item: &Archivable, ctx: &RequestContext) -> Result<bool> {
        (**self).archive(item, ctx).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory archiver
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps archived items in memory.
#[derive(Debug, Default)]
pub struct MemoryArchiver {
    items: Mutex<Vec<(Archivable, Option<String>)>>,
}

impl MemoryArchiver {
    /// Creates an empty archiver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the archived items in arrival order.
    #[must_use]
    pub fn items(&self) -> Vec<Archivable> {
        self.items.lock().iter().map(|(item, _)| item.clone()).collect()
    }

    /// Returns the transaction id recorded with `archive_id`.
    #[must_use]
    pub fn transaction_id(&self, archive_id: &str) -> Option<String> {
        self.items
            .lock()
            .iter()
            .find(|(item, _)| item.archive_id == archive_id)
            .and_then(|(_, tx)| tx.clone())
    }

    /// Returns the number of archived items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns `true` if nothing has been archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl Archiver for MemoryArchiver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn archive(&self, item: &Archivable, ctx: &RequestContext) -> Result<bool> {
        self.items.lock().push((item.clone(), ctx.transaction_id().map(str::to_owned)));
        Ok(true)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage-backed archiver
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveRecord {
    archive_id: String,
    worker_id: WorkerId,
    kind: ArchiveKind,
    archived_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_ip: Option<String>,
    data: String,
}

/// Returns the storage key of an archived item.
#[must_use]
pub fn archive_key(worker_id: WorkerId, archive_id: &str) -> Vec<u8> {
    format!("{ARCHIVE_PREFIX}{worker_id}/{archive_id}").into_bytes()
}

/// Persists archivables as JSON records in a [`StorageBackend`].
pub struct StorageArchiver {
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageArchiver").finish_non_exhaustive()
    }
}

impl StorageArchiver {
    /// Creates an archiver writing to `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Reads back the data archived under `archive_id`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ArchiveFailure`] if the record cannot be read
    /// or decoded.
    pub async fn load(&self, worker_id: WorkerId, archive_id: &str) -> Result<Option<Bytes>> {
        let Some(raw) = self
            .backend
            .get(&archive_key(worker_id, archive_id))
            .await
            .map_err(|e| WorkerError::archive_failure_with_source("reading archive record", e))?
        else {
            return Ok(None);
        };
        let record: ArchiveRecord = serde_json::from_slice(&raw)
            .map_err(|e| WorkerError::archive_failure_with_source("decoding archive record", e))?;
        let data = STANDARD
            .decode(record.data)
            .map_err(|e| WorkerError::archive_failure_with_source("decoding archived data", e))?;
        Ok(Some(Bytes::from(data)))
    }
}

#[async_trait]
impl Archiver for StorageArchiver {
    fn name(&self) -> &str {
        "storage"
    }

    async fn archive(&self, item: &Archivable, ctx: &RequestContext) -> Result<bool> {
        let record = ArchiveRecord {
            archive_id: item.archive_id.clone(),
            worker_id: item.worker_id,
            kind: item.kind,
            archived_at: Utc::now(),
            transaction_id: ctx.transaction_id().map(str::to_owned),
            remote_ip: ctx.remote_ip().map(str::to_owned),
            data: STANDARD.encode(&item.data),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| WorkerError::archive_failure_with_source("encoding archive record", e))?;
        self.backend
            .set(archive_key(item.worker_id, &item.archive_id), value)
            .await
            .map_err(|e| WorkerError::archive_failure_with_source("writing archive record", e))?;
        tracing::debug!(
            worker_id = %item.worker_id,
            archive_id = %item.archive_id,
            "archived response"
        );
        Ok(true)
    }
}
