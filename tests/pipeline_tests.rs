//! Pipeline integration tests.
//!
//! End-to-end behavior of the memoization pipeline against the default
//! SQLite metadata store and filesystem blob store:
//!
//! - `hit_path`: dedup of repeat calls and persistence across instances
//! - `keying`: parameter policies and version isolation
//! - `failure_semantics`: non-caching of errors and corruption recovery
//! - `persistence_routing`: inline vs blob storage, deletion, history

mod common;

use common::fixtures::{register_test_obj, temp_vault, CallCounter, TestObj};
use memovault::{
    Args, CallConfig, KeyPolicy, ResultType, SqliteMetadataStore, MetadataStore, Value, VaultError,
};

fn double_len(args: &Args) -> Result<Value, memovault::TaskError> {
    let s = args.get("s").and_then(Value::as_str).unwrap_or_default();
    Ok(Value::Int((s.len() * 2) as i64))
}

// ============================================================================
// Hit Path
// ============================================================================

mod hit_path {
    use super::*;

    #[test]
    fn test_second_call_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new();
        let args = Args::new().with("s", "hello");

        for _ in 0..2 {
            let result = vault
                .invoke("double_len", &args, &config, |a| {
                    counter.bump();
                    double_len(a)
                })
                .unwrap();
            assert_eq!(result, Value::Int(10));
        }
        assert_eq!(counter.count(), 1, "body must execute exactly once");
    }

    #[test]
    fn test_different_args_execute_again() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new();

        for s in ["hello", "world!", "hello"] {
            vault
                .invoke("double_len", &Args::new().with("s", s), &config, |a| {
                    counter.bump();
                    double_len(a)
                })
                .unwrap();
        }
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_results_survive_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let counter = CallCounter::new();
        let config = CallConfig::new();
        let args = Args::new().with("s", "persist me");

        {
            let vault = temp_vault(dir.path());
            vault
                .invoke("double_len", &args, &config, |a| {
                    counter.bump();
                    double_len(a)
                })
                .unwrap();
        }

        // Fresh vault over the same storage: still a hit.
        let vault = temp_vault(dir.path());
        let result = vault
            .invoke("double_len", &args, &config, |a| {
                counter.bump();
                double_len(a)
            })
            .unwrap();
        assert_eq!(result, Value::Int(20));
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_custom_type_rehydrates_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = CallConfig::new();
        let args = Args::new().with("seed", 7);

        {
            let vault = temp_vault(dir.path());
            register_test_obj(&vault, 10);
            vault
                .invoke("make_obj", &args, &config, |_| {
                    Ok(Value::custom(TestObj { v: 7 }))
                })
                .unwrap();
        }

        let vault = temp_vault(dir.path());
        register_test_obj(&vault, 10);
        let result = vault
            .invoke("make_obj", &args, &config, |_| {
                panic!("must be served from cache");
            })
            .unwrap();
        assert_eq!(result.as_custom::<TestObj>(), Some(&TestObj { v: 7 }));
    }
}

// ============================================================================
// Keying
// ============================================================================

mod keying {
    use super::*;

    #[test]
    fn test_ignored_parameter_hits() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new().key_policy(KeyPolicy::ignore(["verbose"]));

        for verbose in [true, false] {
            let result = vault
                .invoke(
                    "process",
                    &Args::new().with("data", 5).with("verbose", verbose),
                    &config,
                    |a| {
                        counter.bump();
                        Ok(Value::Int(a.get("data").and_then(Value::as_int).unwrap()))
                    },
                )
                .unwrap();
            assert_eq!(result, Value::Int(5));
        }
        assert_eq!(counter.count(), 1, "verbose flag must not affect the key");
    }

    #[test]
    fn test_argument_order_does_not_affect_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new();

        let ab = Args::new().with("a", 1).with("b", 2);
        let ba = Args::new().with("b", 2).with("a", 1);
        for args in [&ab, &ba] {
            vault
                .invoke("sum", args, &config, |_| {
                    counter.bump();
                    Ok(Value::Int(3))
                })
                .unwrap();
        }
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_version_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let args = Args::new().with("s", "data");

        for version in ["v1", "v1", "v2"] {
            let config = CallConfig::new().version(version);
            vault
                .invoke("double_len", &args, &config, |a| {
                    counter.bump();
                    double_len(a)
                })
                .unwrap();
        }
        assert_eq!(counter.count(), 2, "v2 must not observe v1 records");
    }
}

// ============================================================================
// Failure Semantics
// ============================================================================

mod failure_semantics {
    use super::*;

    #[test]
    fn test_task_errors_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new();
        let args = Args::new().with("s", "flaky");

        let failing = vault.invoke("flaky", &args, &config, |_| {
            counter.bump();
            Err("upstream unavailable".into())
        });
        assert!(matches!(failing, Err(VaultError::Task(_, _))));

        // Second attempt executes (nothing was cached) and succeeds.
        let result = vault
            .invoke("flaky", &args, &config, |_| {
                counter.bump();
                Ok(Value::Int(1))
            })
            .unwrap();
        assert_eq!(result, Value::Int(1));
        assert_eq!(counter.count(), 2);

        // Third attempt is a hit.
        vault
            .invoke("flaky", &args, &config, |_| {
                counter.bump();
                Ok(Value::Int(1))
            })
            .unwrap();
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_corrupted_inline_payload_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new();
        let args = Args::new().with("s", "corrupt me");
        let task = |_: &Args| Ok(Value::Str("x".repeat(200)));

        vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                task(a)
            })
            .unwrap();

        // Flip one byte of the stored payload behind the vault's back.
        let store = SqliteMetadataStore::open(dir.path().join("test.db")).unwrap();
        let mut record = store
            .get(&vault.history(1).unwrap()[0].cache_key)
            .unwrap()
            .unwrap();
        let data = record.result_data.as_mut().unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        store.put(&record).unwrap();

        // Next call must re-execute and overwrite, with no error escaping.
        let result = vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                task(a)
            })
            .unwrap();
        assert_eq!(result, Value::Str("x".repeat(200)));
        assert_eq!(counter.count(), 2);

        // And the overwritten record is readable again.
        vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                task(a)
            })
            .unwrap();
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_missing_blob_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let counter = CallCounter::new();
        let config = CallConfig::new().save_blob(true);
        let args = Args::new().with("s", "blobbed");

        vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                double_len(a)
            })
            .unwrap();

        // Lose the blob behind the vault's back.
        let location = vault.history(1).unwrap()[0].result_value.clone().unwrap();
        std::fs::remove_file(&location).unwrap();

        let result = vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                double_len(a)
            })
            .unwrap();
        assert_eq!(result, Value::Int(14));
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_unknown_ext_code_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = CallConfig::new();
        let args = Args::new().with("seed", 1);
        let counter = CallCounter::new();

        {
            let vault = temp_vault(dir.path());
            register_test_obj(&vault, 10);
            vault
                .invoke("make_obj", &args, &config, |_| {
                    counter.bump();
                    Ok(Value::custom(TestObj { v: 1 }))
                })
                .unwrap();
        }

        // A vault without the registration cannot decode the stored ext
        // frame; the call degrades to a miss and re-executes.
        let bare = temp_vault(dir.path());
        let result = bare.invoke("make_obj", &args, &config, |_| {
            counter.bump();
            Ok(Value::Int(0))
        });
        assert_eq!(result.unwrap(), Value::Int(0));
        assert_eq!(counter.count(), 2);
    }
}

// ============================================================================
// Persistence Routing
// ============================================================================

mod persistence_routing {
    use super::*;
    use memovault::Vault;

    #[test]
    fn test_inline_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let config = CallConfig::new().content_type("application/json");

        vault
            .invoke(
                "gen",
                &Args::new().with("s", "inline"),
                &config,
                double_len,
            )
            .unwrap();

        let record = &vault.history(1).unwrap()[0];
        assert_eq!(record.result_type, ResultType::DirectBlob);
        assert!(record.result_data.is_some());
        assert!(record.result_value.is_none());
        assert_eq!(record.content_type.as_deref(), Some("application/json"));
        assert_eq!(record.func_name, "gen");
    }

    #[test]
    fn test_blob_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let config = CallConfig::new().save_blob(true);

        vault
            .invoke("gen", &Args::new().with("s", "blob"), &config, double_len)
            .unwrap();

        let record = &vault.history(1).unwrap()[0];
        assert_eq!(record.result_type, ResultType::File);
        assert!(record.result_data.is_none());
        let location = record.result_value.as_deref().unwrap();
        assert!(std::path::Path::new(location).exists());
    }

    #[test]
    fn test_oversized_inline_payload_still_persists() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::builder("guard_test")
            .db_path(dir.path().join("guard.db"))
            .blob_dir(dir.path().join("blobs"))
            .blob_warning_threshold(64)
            .build()
            .unwrap();
        let counter = CallCounter::new();
        let config = CallConfig::new();
        let args = Args::new().with("n", 1);

        // Result is far over the 64-byte threshold: warned, not rejected.
        for _ in 0..2 {
            let result = vault
                .invoke("heavy", &args, &config, |_| {
                    counter.bump();
                    Ok(Value::Str("x".repeat(2048)))
                })
                .unwrap();
            assert_eq!(result, Value::Str("x".repeat(2048)));
        }
        assert_eq!(counter.count(), 1);
        assert_eq!(
            vault.history(1).unwrap()[0].result_type,
            ResultType::DirectBlob
        );
    }

    #[test]
    fn test_delete_removes_record_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let config = CallConfig::new().save_blob(true);
        let counter = CallCounter::new();
        let args = Args::new().with("s", "doomed");

        vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                double_len(a)
            })
            .unwrap();

        let record = vault.history(1).unwrap().remove(0);
        let location = record.result_value.clone().unwrap();
        assert!(std::path::Path::new(&location).exists());

        assert!(vault.delete(&record.cache_key).unwrap());
        assert!(!std::path::Path::new(&location).exists());

        // Idempotent second delete.
        assert!(!vault.delete(&record.cache_key).unwrap());

        // The entry is gone for real: the next call executes.
        vault
            .invoke("gen", &args, &config, |a| {
                counter.bump();
                double_len(a)
            })
            .unwrap();
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_delete_with_already_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let config = CallConfig::new().save_blob(true);

        vault
            .invoke("gen", &Args::new().with("s", "x"), &config, double_len)
            .unwrap();
        let record = vault.history(1).unwrap().remove(0);
        std::fs::remove_file(record.result_value.as_deref().unwrap()).unwrap();

        // Missing blob must not block record removal.
        assert!(vault.delete(&record.cache_key).unwrap());
        assert_eq!(vault.history(10).unwrap().len(), 0);
    }

    #[test]
    fn test_delete_unknown_key_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        assert!(!vault.delete("no_such_key").unwrap());
    }

    #[test]
    fn test_history_lists_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vault = temp_vault(dir.path());
        let config = CallConfig::new();

        for s in ["a", "b", "c"] {
            vault
                .invoke("gen", &Args::new().with("s", s), &config, double_len)
                .unwrap();
        }
        assert_eq!(vault.history(10).unwrap().len(), 3);
        assert_eq!(vault.history(2).unwrap().len(), 2);
    }
}
