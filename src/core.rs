//! The memoization pipeline.
//!
//! A [`Vault`] owns the serializer registry, the storage facade, and the
//! optional rate limiter, and drives every call through the same sequence:
//! project the arguments into a key, look the key up, and on a miss admit
//! the call, execute it, and persist the result.
//!
//! Failure semantics:
//! - An unreadable stored entry (corrupt bytes, missing blob, unknown
//!   extension code) is logged and treated as a miss. Callers never see
//!   the corruption.
//! - A failing user function propagates its error and caches nothing, so
//!   the next call re-executes.
//! - A storage failure after successful execution propagates; the value is
//!   not returned with a silently skipped write.
//!
//! Concurrent calls with the same key may each execute the user function;
//! the work is assumed idempotent and the last writer wins in the record
//! table. Hits never consume rate-limit budget.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, warn};

use crate::canon;
use crate::codec::{RegistrationError, SerializationError, Serializer};
use crate::limiter::{LimiterError, RateLimiter};
use crate::policy::KeyPolicy;
use crate::store::{
    BlobStore, CacheRecord, Fetched, FsBlobStore, MetadataStore, PersistRequest,
    SqliteMetadataStore, StorageError, StorageFacade,
};
use crate::value::{Args, Value};

/// Error type produced by user functions. Propagated unchanged through the
/// pipeline inside [`VaultError::Task`].
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_BLOB_WARNING_THRESHOLD: usize = 1024 * 1024;
const DEFAULT_IO_WORKERS: usize = 4;
const DEFAULT_BLOB_DIR: &str = "./blobs";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error("scoped task '{0}' was invoked after its scope ended")]
    ScopeExpired(String),

    #[error("task '{0}' failed")]
    Task(String, #[source] TaskError),

    #[error("storage worker pool failed: {0}")]
    Pool(String),
}

/// Rate-limit cost of a call: a constant, or computed from the arguments
/// on the calling side before admission.
#[derive(Clone)]
pub enum Cost {
    Fixed(u32),
    PerCall(Arc<dyn Fn(&Args) -> u32 + Send + Sync>),
}

impl Default for Cost {
    fn default() -> Self {
        Cost::Fixed(1)
    }
}

impl Cost {
    fn eval(&self, args: &Args) -> u32 {
        match self {
            Cost::Fixed(c) => *c,
            Cost::PerCall(f) => f(args),
        }
    }
}

/// Per-call configuration.
#[derive(Clone, Default)]
pub struct CallConfig {
    pub version: Option<String>,
    pub save_blob: bool,
    pub content_type: Option<String>,
    pub key_policy: KeyPolicy,
    pub cost: Cost,
}

impl CallConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque tag mixed into the cache key; change it to invalidate all
    /// prior entries for the function.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Route the result to the blob store instead of inline storage.
    pub fn save_blob(mut self, save_blob: bool) -> Self {
        self.save_blob = save_blob;
        self
    }

    /// MIME-like hint persisted alongside the record.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = Cost::Fixed(cost);
        self
    }

    pub fn cost_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Args) -> u32 + Send + Sync + 'static,
    {
        self.cost = Cost::PerCall(Arc::new(f));
        self
    }
}

/// Worker pool for offloading storage I/O on async call paths.
///
/// An injected handle is used but never shut down; an internally created
/// runtime is torn down when the owning [`Vault`] drops.
enum IoDriver {
    Owned(Option<Runtime>),
    Borrowed(Handle),
}

impl IoDriver {
    fn handle(&self) -> Handle {
        match self {
            IoDriver::Owned(rt) => rt
                .as_ref()
                .map(|rt| rt.handle().clone())
                // Only None mid-drop, where no call can observe it.
                .unwrap_or_else(Handle::current),
            IoDriver::Borrowed(handle) => handle.clone(),
        }
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        if let IoDriver::Owned(rt) = self {
            if let Some(rt) = rt.take() {
                // Non-blocking teardown: safe even when the vault is
                // dropped from inside another runtime.
                rt.shutdown_background();
            }
        }
    }
}

/// Builder for [`Vault`]. Defaults: SQLite metadata at `<name>.db`,
/// filesystem blobs under `./blobs`, no rate limit, 1 MiB inline-payload
/// warning threshold, four I/O workers.
pub struct VaultBuilder {
    name: String,
    db_path: Option<PathBuf>,
    metadata_store: Option<Box<dyn MetadataStore>>,
    blob_dir: Option<PathBuf>,
    blob_store: Option<Box<dyn BlobStore>>,
    tpm: Option<u32>,
    burst: Option<u32>,
    blob_warning_threshold: usize,
    io_workers: usize,
    io_handle: Option<Handle>,
}

impl VaultBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            db_path: None,
            metadata_store: None,
            blob_dir: None,
            blob_store: None,
            tpm: None,
            burst: None,
            blob_warning_threshold: DEFAULT_BLOB_WARNING_THRESHOLD,
            io_workers: DEFAULT_IO_WORKERS,
            io_handle: None,
        }
    }

    /// Path for the default SQLite metadata store.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Inject a metadata store; overrides `db_path`.
    pub fn metadata_store(mut self, store: Box<dyn MetadataStore>) -> Self {
        self.metadata_store = Some(store);
        self
    }

    /// Directory for the default filesystem blob store.
    pub fn blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = Some(dir.into());
        self
    }

    /// Inject a blob store; overrides `blob_dir`.
    pub fn blob_store(mut self, store: Box<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Rate budget in tokens per minute. Unset disables limiting.
    pub fn tpm(mut self, tpm: u32) -> Self {
        self.tpm = Some(tpm);
        self
    }

    /// Burst reservoir in cost units; defaults to the full `tpm` budget.
    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Inline-payload size over which a warning is emitted.
    pub fn blob_warning_threshold(mut self, bytes: usize) -> Self {
        self.blob_warning_threshold = bytes;
        self
    }

    /// Blocking-I/O worker count for the internally created pool.
    pub fn io_workers(mut self, workers: usize) -> Self {
        self.io_workers = workers;
        self
    }

    /// Borrow an existing runtime for I/O offload instead of creating one.
    /// The vault never shuts a borrowed runtime down.
    pub fn io_handle(mut self, handle: Handle) -> Self {
        self.io_handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Vault, VaultError> {
        let meta: Box<dyn MetadataStore> = match (self.metadata_store, self.db_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Box::new(SqliteMetadataStore::open(path)?),
            (None, None) => Box::new(SqliteMetadataStore::open(format!("{}.db", self.name))?),
        };
        meta.init_schema()?;

        let blobs: Box<dyn BlobStore> = match (self.blob_store, self.blob_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Box::new(FsBlobStore::new(dir)?),
            (None, None) => Box::new(FsBlobStore::new(DEFAULT_BLOB_DIR)?),
        };

        let limiter = match self.tpm {
            Some(tpm) => Some(match self.burst {
                Some(burst) => RateLimiter::with_burst(tpm, burst)?,
                None => RateLimiter::per_minute(tpm)?,
            }),
            None => None,
        };

        let io = match self.io_handle {
            Some(handle) => IoDriver::Borrowed(handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(self.io_workers.max(1))
                    .thread_name(format!("{}-io", self.name))
                    .enable_time()
                    .build()
                    .map_err(StorageError::from)?;
                IoDriver::Owned(Some(runtime))
            }
        };

        Ok(Vault {
            name: self.name,
            serializer: RwLock::new(Serializer::new()),
            storage: Arc::new(StorageFacade::new(meta, blobs)),
            limiter,
            blob_warning_threshold: self.blob_warning_threshold,
            io,
        })
    }
}

/// Persistent function-result memoization engine.
pub struct Vault {
    name: String,
    serializer: RwLock<Serializer>,
    storage: Arc<StorageFacade>,
    limiter: Option<RateLimiter>,
    blob_warning_threshold: usize,
    io: IoDriver,
}

impl Vault {
    pub fn builder(name: impl Into<String>) -> VaultBuilder {
        VaultBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// Register a custom type with the serializer. Registrations are
    /// process-wide for this vault and never removed.
    pub fn register_type<T, E, D>(
        &self,
        code: u8,
        encoder: E,
        decoder: D,
    ) -> Result<(), RegistrationError>
    where
        T: crate::value::CustomValue,
        E: Fn(&T) -> Value + Send + Sync + 'static,
        D: Fn(Value) -> Result<T, SerializationError> + Send + Sync + 'static,
    {
        self.serializer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register::<T, E, D>(code, encoder, decoder)
    }

    /// Memoized synchronous call.
    ///
    /// On a hit the stored value is rehydrated and `func` never runs. On a
    /// miss the call is admitted through the rate limiter (if any), `func`
    /// runs, and its result is persisted before being returned.
    pub fn invoke<F>(
        &self,
        func_name: &str,
        args: &Args,
        config: &CallConfig,
        func: F,
    ) -> Result<Value, VaultError>
    where
        F: FnOnce(&Args) -> Result<Value, TaskError>,
    {
        let (cache_key, input_id) = self.derive_keys(func_name, args, config)?;

        let fetched = self.storage.fetch(&cache_key)?;
        if let Some(hit) = self.decode_fetched(&cache_key, fetched)? {
            debug!(func_name, %cache_key, "cache hit");
            return Ok(hit);
        }
        debug!(func_name, %cache_key, "cache miss");

        if let Some(limiter) = &self.limiter {
            limiter.acquire(config.cost.eval(args))?;
        }

        let value = func(args).map_err(|e| VaultError::Task(func_name.to_owned(), e))?;

        let payload = self.encode(&value)?;
        self.warn_if_oversized(func_name, config, payload.len());
        self.storage
            .persist(&self.persist_request(func_name, &cache_key, &input_id, config), &payload)?;
        Ok(value)
    }

    /// Memoized asynchronous call. Storage I/O runs on the worker pool so
    /// the caller's scheduler is never stalled; limiter waits suspend
    /// cooperatively.
    pub async fn invoke_async<F, Fut>(
        &self,
        func_name: &str,
        args: Args,
        config: &CallConfig,
        func: F,
    ) -> Result<Value, VaultError>
    where
        F: FnOnce(Args) -> Fut,
        Fut: Future<Output = Result<Value, TaskError>>,
    {
        let (cache_key, input_id) = self.derive_keys(func_name, &args, config)?;

        let fetched = {
            let storage = Arc::clone(&self.storage);
            let key = cache_key.clone();
            self.io
                .handle()
                .spawn_blocking(move || storage.fetch(&key))
                .await
                .map_err(|e| VaultError::Pool(e.to_string()))??
        };
        if let Some(hit) = self.decode_fetched(&cache_key, fetched)? {
            debug!(func_name, %cache_key, "cache hit");
            return Ok(hit);
        }
        debug!(func_name, %cache_key, "cache miss");

        if let Some(limiter) = &self.limiter {
            limiter.acquire_async(config.cost.eval(&args)).await?;
        }

        let value = func(args)
            .await
            .map_err(|e| VaultError::Task(func_name.to_owned(), e))?;

        let payload = self.encode(&value)?;
        self.warn_if_oversized(func_name, config, payload.len());

        let request = self.persist_request(func_name, &cache_key, &input_id, config);
        {
            let storage = Arc::clone(&self.storage);
            self.io
                .handle()
                .spawn_blocking(move || storage.persist(&request, &payload))
                .await
                .map_err(|e| VaultError::Pool(e.to_string()))??;
        }
        Ok(value)
    }

    /// Remove a record and its blob, if any. Returns whether a record
    /// existed.
    pub fn delete(&self, cache_key: &str) -> Result<bool, VaultError> {
        Ok(self.storage.delete(cache_key)?)
    }

    /// Recent records, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<CacheRecord>, VaultError> {
        Ok(self.storage.history(limit)?)
    }

    fn derive_keys(
        &self,
        func_name: &str,
        args: &Args,
        config: &CallConfig,
    ) -> Result<(String, String), VaultError> {
        let seed = config.key_policy.project(args);
        let canonical = {
            let ser = self.serializer.read().unwrap_or_else(|e| e.into_inner());
            canon::canonical_bytes(&ser, &seed)?
        };
        let cache_key = canon::derive_cache_key(func_name, &canonical, config.version.as_deref());
        Ok((cache_key, canon::input_id(&canonical)))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, VaultError> {
        let ser = self.serializer.read().unwrap_or_else(|e| e.into_inner());
        Ok(ser.encode(value)?)
    }

    /// Decode a fetched payload; anything unreadable is a miss, not an
    /// error the caller sees.
    fn decode_fetched(
        &self,
        cache_key: &str,
        fetched: Fetched,
    ) -> Result<Option<Value>, VaultError> {
        match fetched {
            Fetched::Miss => Ok(None),
            Fetched::Hit(bytes) => {
                let ser = self.serializer.read().unwrap_or_else(|e| e.into_inner());
                match ser.decode(&bytes) {
                    Ok(value) => Ok(Some(value)),
                    Err(err) => {
                        warn_unreadable(cache_key, &err);
                        Ok(None)
                    }
                }
            }
            Fetched::Unreadable(err) => {
                warn_unreadable(cache_key, &err);
                Ok(None)
            }
        }
    }

    fn warn_if_oversized(&self, func_name: &str, config: &CallConfig, payload_len: usize) {
        if !config.save_blob && payload_len > self.blob_warning_threshold {
            warn!(
                func_name,
                size_kib = payload_len / 1024,
                "large result stored inline; this bloats the record table, \
                 consider enabling `save_blob` for this task"
            );
        }
    }

    fn persist_request(
        &self,
        func_name: &str,
        cache_key: &str,
        input_id: &str,
        config: &CallConfig,
    ) -> PersistRequest {
        PersistRequest {
            cache_key: cache_key.to_owned(),
            func_name: func_name.to_owned(),
            input_id: input_id.to_owned(),
            version: config.version.clone(),
            content_type: config.content_type.clone(),
            save_blob: config.save_blob,
        }
    }
}

fn warn_unreadable(cache_key: &str, err: &dyn std::fmt::Display) {
    warn!(
        cache_key,
        error = %err,
        "cached entry is unreadable, re-executing; if this persists, bump `version` to retire the entry"
    );
}
