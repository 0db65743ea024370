//! Storage contracts and the facade that mediates between the pipeline and
//! the injected backends.
//!
//! Two interfaces: a [`MetadataStore`] holding one record per cache key and
//! a [`BlobStore`] holding large payloads. The facade implements the
//! claim-check policy — small results ride inline in the record, large ones
//! live in the blob store with only their location in the record — and
//! applies the integrity envelope on both paths.

mod fs;
mod sqlite;

pub use fs::FsBlobStore;
pub use sqlite::SqliteMetadataStore;

use thiserror::Error;
use tracing::warn;

use crate::envelope::{self, EnvelopeError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("blob missing: {0}")]
    BlobMissing(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("invalid record for key {cache_key}: {reason}")]
    InvalidRecord { cache_key: String, reason: String },
}

/// How a result is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// Payload inline in the metadata record.
    DirectBlob,
    /// Payload in the blob store; the record holds its location.
    File,
}

impl ResultType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultType::DirectBlob => "DIRECT_BLOB",
            ResultType::File => "FILE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DIRECT_BLOB" => Some(ResultType::DirectBlob),
            "FILE" => Some(ResultType::File),
            _ => None,
        }
    }
}

/// One persisted memoization result.
///
/// Exactly one of `result_value` (blob location) and `result_data` (inline
/// payload) is populated, matching `result_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub cache_key: String,
    pub func_name: String,
    pub input_id: String,
    pub version: Option<String>,
    pub result_type: ResultType,
    pub content_type: Option<String>,
    pub result_value: Option<String>,
    pub result_data: Option<Vec<u8>>,
    /// Set by the metadata store on upsert.
    pub updated_at: Option<String>,
}

/// Record table contract. Implementations must be safe for concurrent
/// reads and writes; `put` is an upsert (last writer wins).
pub trait MetadataStore: Send + Sync {
    /// Create or migrate the schema. Idempotent.
    fn init_schema(&self) -> Result<(), StorageError>;

    fn get(&self, cache_key: &str) -> Result<Option<CacheRecord>, StorageError>;

    fn put(&self, record: &CacheRecord) -> Result<(), StorageError>;

    /// Remove a record; reports whether one existed.
    fn delete(&self, cache_key: &str) -> Result<bool, StorageError>;

    /// Recent records, newest first. Best effort.
    fn history(&self, limit: usize) -> Result<Vec<CacheRecord>, StorageError>;
}

/// Large-payload byte storage contract. `delete` is idempotent.
pub trait BlobStore: Send + Sync {
    /// Store bytes under a deterministic key; returns an opaque location.
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError>;

    fn get(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, location: &str) -> Result<(), StorageError>;
}

/// Identity of a result being persisted, minus the payload.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub cache_key: String,
    pub func_name: String,
    pub input_id: String,
    pub version: Option<String>,
    pub content_type: Option<String>,
    pub save_blob: bool,
}

/// Outcome of a payload fetch, separating "nothing stored" from "stored
/// but unreadable" so the pipeline can reclassify the latter as a miss.
#[derive(Debug)]
pub enum Fetched {
    Miss,
    Hit(Vec<u8>),
    Unreadable(StorageError),
}

/// Mediates between the pipeline and the two injected backends.
pub struct StorageFacade {
    meta: Box<dyn MetadataStore>,
    blobs: Box<dyn BlobStore>,
}

impl StorageFacade {
    pub fn new(meta: Box<dyn MetadataStore>, blobs: Box<dyn BlobStore>) -> Self {
        Self { meta, blobs }
    }

    /// Fetch the stored payload for a key, already unframed.
    ///
    /// Metadata-store failures propagate; anything wrong with the payload
    /// itself (missing blob, truncated bytes, checksum mismatch) comes
    /// back as [`Fetched::Unreadable`].
    pub fn fetch(&self, cache_key: &str) -> Result<Fetched, StorageError> {
        let Some(record) = self.meta.get(cache_key)? else {
            return Ok(Fetched::Miss);
        };
        match self.open_payload(&record) {
            Ok(payload) => Ok(Fetched::Hit(payload)),
            Err(err) => Ok(Fetched::Unreadable(err)),
        }
    }

    fn open_payload(&self, record: &CacheRecord) -> Result<Vec<u8>, StorageError> {
        let sealed = match record.result_type {
            ResultType::DirectBlob => {
                record
                    .result_data
                    .clone()
                    .ok_or_else(|| StorageError::InvalidRecord {
                        cache_key: record.cache_key.clone(),
                        reason: "DIRECT_BLOB record has no inline payload".into(),
                    })?
            }
            ResultType::File => {
                let location =
                    record
                        .result_value
                        .as_deref()
                        .ok_or_else(|| StorageError::InvalidRecord {
                            cache_key: record.cache_key.clone(),
                            reason: "FILE record has no blob location".into(),
                        })?;
                self.blobs.get(location)?
            }
        };
        Ok(envelope::open(&sealed)?)
    }

    /// Seal and persist a payload, routing inline or to the blob store.
    pub fn persist(&self, request: &PersistRequest, payload: &[u8]) -> Result<(), StorageError> {
        let sealed = envelope::seal(payload)?;

        let (result_type, result_value, result_data) = if request.save_blob {
            let location = self.blobs.put(&request.cache_key, &sealed)?;
            (ResultType::File, Some(location), None)
        } else {
            (ResultType::DirectBlob, None, Some(sealed))
        };

        self.meta.put(&CacheRecord {
            cache_key: request.cache_key.clone(),
            func_name: request.func_name.clone(),
            input_id: request.input_id.clone(),
            version: request.version.clone(),
            result_type,
            content_type: request.content_type.clone(),
            result_value,
            result_data,
            updated_at: None,
        })
    }

    /// Delete a record and, best-effort, its blob. Returns whether a
    /// record existed. A missing or undeletable blob never blocks record
    /// removal.
    pub fn delete(&self, cache_key: &str) -> Result<bool, StorageError> {
        let record = self.meta.get(cache_key)?;
        let existed = self.meta.delete(cache_key)?;
        if let Some(record) = record {
            if record.result_type == ResultType::File {
                if let Some(location) = record.result_value.as_deref() {
                    if let Err(err) = self.blobs.delete(location) {
                        warn!(cache_key, location, error = %err, "failed to delete blob; record removed anyway");
                    }
                }
            }
        }
        Ok(existed)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<CacheRecord>, StorageError> {
        self.meta.history(limit)
    }
}
