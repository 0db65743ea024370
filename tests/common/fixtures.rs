//! Test fixtures for the memovault test suite.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memovault::{SerializationError, Value, Vault};

/// Build a vault whose database and blob directory live under `dir`.
pub fn temp_vault(dir: &Path) -> Vault {
    Vault::builder("test_vault")
        .db_path(dir.join("test.db"))
        .blob_dir(dir.join("blobs"))
        .build()
        .expect("vault should build in a temp dir")
}

/// Sample custom type for registry tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TestObj {
    pub v: i64,
}

/// Register `TestObj` under the given ext code, encoding as `{"v": ...}`.
pub fn register_test_obj(vault: &Vault, code: u8) {
    vault
        .register_type::<TestObj, _, _>(
            code,
            |o| Value::Map(vec![("v".into(), Value::Int(o.v))]),
            |v| {
                v.get("v")
                    .and_then(Value::as_int)
                    .map(|v| TestObj { v })
                    .ok_or_else(|| SerializationError::Malformed("missing field 'v'".into()))
            },
        )
        .expect("registration should succeed");
}

/// Shared execution counter for asserting how often a task body ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
