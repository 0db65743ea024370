//! Scoped wrapper tests: in-scope memoization and fail-fast after the
//! scope ends.

mod common;

use common::fixtures::{temp_vault, CallCounter};
use memovault::{Args, CallConfig, Value, VaultError};

#[test]
fn test_scoped_task_memoizes_in_scope() {
    let dir = tempfile::tempdir().unwrap();
    let vault = temp_vault(dir.path());
    let counter = CallCounter::new();

    let scope = vault.scoped(CallConfig::new());
    let adder = scope.bind("adder", {
        let counter = counter.clone();
        move |args: &Args| {
            counter.bump();
            let a = args.get("a").and_then(Value::as_int).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_int).unwrap_or(0);
            Ok(Value::Int(a + b))
        }
    });

    let args = Args::new().with("a", 10).with("b", 20);
    assert_eq!(adder.call(&args).unwrap(), Value::Int(30));
    assert_eq!(adder.call(&args).unwrap(), Value::Int(30));
    assert_eq!(counter.count(), 1);
}

#[test]
fn test_multiple_tasks_share_one_scope() {
    let dir = tempfile::tempdir().unwrap();
    let vault = temp_vault(dir.path());
    let calls_a = CallCounter::new();
    let calls_b = CallCounter::new();

    let scope = vault.scoped(CallConfig::new());
    let task_a = scope.bind("task_a", {
        let calls_a = calls_a.clone();
        move |args: &Args| {
            calls_a.bump();
            Ok(Value::Int(
                args.get("x").and_then(Value::as_int).unwrap_or(0) * 2,
            ))
        }
    });
    let task_b = scope.bind("task_b", {
        let calls_b = calls_b.clone();
        move |args: &Args| {
            calls_b.bump();
            Ok(Value::Int(
                args.get("x").and_then(Value::as_int).unwrap_or(0) + 100,
            ))
        }
    });

    let args = Args::new().with("x", 5);
    assert_eq!(task_a.call(&args).unwrap(), Value::Int(10));
    assert_eq!(task_b.call(&args).unwrap(), Value::Int(105));
    assert_eq!(task_a.call(&args).unwrap(), Value::Int(10));
    assert_eq!(calls_a.count(), 1);
    assert_eq!(calls_b.count(), 1);
}

#[test]
fn test_call_after_scope_end_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let vault = temp_vault(dir.path());
    let counter = CallCounter::new();

    let scope = vault.scoped(CallConfig::new());
    let task = scope.bind("simple", {
        let counter = counter.clone();
        move |_: &Args| {
            counter.bump();
            Ok(Value::Int(1))
        }
    });

    let args = Args::new().with("x", 1);
    assert_eq!(task.call(&args).unwrap(), Value::Int(1));

    drop(scope);

    let err = task.call(&args).unwrap_err();
    assert!(matches!(err, VaultError::ScopeExpired(name) if name == "simple"));
    assert_eq!(counter.count(), 1, "expired wrapper must not execute");

    // The vault itself is still usable after the scope ends.
    assert!(vault.history(10).is_ok());
}

#[test]
fn test_scope_config_versions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let vault = temp_vault(dir.path());
    let counter = CallCounter::new();
    let args = Args::new().with("data", "test");

    for version in ["v2", "v3"] {
        let scope = vault.scoped(CallConfig::new().version(version));
        let task = scope.bind("sensitive", {
            let counter = counter.clone();
            move |args: &Args| {
                counter.bump();
                Ok(args.get("data").cloned().unwrap_or(Value::Null))
            }
        });
        task.call(&args).unwrap();
    }
    assert_eq!(counter.count(), 2, "different versions must not share entries");
}

#[tokio::test]
async fn test_async_scoped_task_expires_too() {
    let dir = tempfile::tempdir().unwrap();
    let vault = temp_vault(dir.path());
    let counter = CallCounter::new();

    let scope = vault.scoped(CallConfig::new());
    let task = scope.bind_async("fetch", {
        let counter = counter.clone();
        move |args: Args| {
            let counter = counter.clone();
            async move {
                counter.bump();
                let n = args.get("n").and_then(Value::as_int).unwrap_or(0);
                Ok(Value::Int(n * 3))
            }
        }
    });

    let args = Args::new().with("n", 7);
    assert_eq!(task.call(args.clone()).await.unwrap(), Value::Int(21));
    assert_eq!(task.call(args.clone()).await.unwrap(), Value::Int(21));
    assert_eq!(counter.count(), 1);

    drop(scope);
    let err = task.call(args).await.unwrap_err();
    assert!(matches!(err, VaultError::ScopeExpired(_)));
}
