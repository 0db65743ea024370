//! # memovault
//!
//! Persistent function-result memoization with GCRA rate limiting and
//! pluggable storage.
//!
//! Expensive, idempotent operations (API calls, heavy computations,
//! scrapes) are deduplicated by content-hashing their arguments; results
//! survive process restarts and rehydrate on repeat calls, and misses are
//! throttled against a declared rate budget.
//!
//! ## Subsystems
//!
//! | Module | Responsibility |
//! |:-------|:---------------|
//! | [`value`] | Dynamic value model for arguments and results |
//! | [`canon`] | Canonicalization and SHA-256 cache-key derivation |
//! | [`policy`] | Per-parameter key policies (ignore, path-stat, file-content) |
//! | [`codec`] | MessagePack codec with a custom-type registry (ext codes 0–127) |
//! | [`limiter`] | GCRA admission control, blocking and cooperative |
//! | [`envelope`] | LZ4 + xxHash3 integrity framing of persisted payloads |
//! | [`store`] | Metadata/blob storage contracts, SQLite and filesystem defaults |
//! | [`core`] | The lookup → admit → execute → persist pipeline |
//! | [`scope`] | Lifetime-bounded memoized wrappers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memovault::{Args, CallConfig, Value, Vault};
//!
//! # fn main() -> Result<(), memovault::VaultError> {
//! let vault = Vault::builder("fetcher").tpm(600).build()?;
//! let config = CallConfig::new().version("v1");
//!
//! // First call executes; the second returns the stored result.
//! for _ in 0..2 {
//!     let doubled = vault.invoke(
//!         "double_len",
//!         &Args::new().with("s", "hello"),
//!         &config,
//!         |args| {
//!             let s = args.get("s").and_then(Value::as_str).unwrap_or_default();
//!             Ok(Value::Int((s.len() * 2) as i64))
//!         },
//!     )?;
//!     assert_eq!(doubled, Value::Int(10));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Semantics
//!
//! - Corrupt or undecodable cached entries are logged and re-executed;
//!   callers never observe the corruption.
//! - Errors from the wrapped function propagate unchanged and nothing is
//!   cached, so failures are retried on the next call.
//! - Cache hits never consume rate-limit budget.

pub mod canon;
pub mod codec;
pub mod core;
pub mod envelope;
pub mod limiter;
pub mod policy;
pub mod scope;
pub mod store;
pub mod value;

pub use codec::{RegistrationError, SerializationError, Serializer, MAX_EXT_CODE};
pub use core::{CallConfig, Cost, TaskError, Vault, VaultBuilder, VaultError};
pub use envelope::EnvelopeError;
pub use limiter::{LimiterError, RateLimiter};
pub use policy::{KeyPolicy, ParamPolicy};
pub use scope::{Scope, ScopedAsyncTask, ScopedTask};
pub use store::{
    BlobStore, CacheRecord, FsBlobStore, MetadataStore, ResultType, SqliteMetadataStore,
    StorageError, StorageFacade,
};
pub use value::{Args, ArrayValue, CustomValue, Value};
