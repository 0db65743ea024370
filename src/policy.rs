//! Per-parameter key policies.
//!
//! A policy projects call arguments into the seed value that gets
//! canonicalized and hashed. Policies bind by parameter name; since every
//! argument in [`Args`](crate::Args) is named, the projection is immune to
//! call-site argument order.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::value::{Args, Value};

// Markers substituted when a path-based policy cannot reach the file.
// Keying stays total: a missing file is a distinct, stable key input.
const TAG_MISSING: &str = "__missing__";
const TAG_UNREADABLE: &str = "__unreadable__";

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Strategy for a single named parameter.
#[derive(Clone)]
pub enum ParamPolicy {
    /// Canonicalize the argument value as-is.
    Default,
    /// Drop the parameter from the key entirely.
    Ignore,
    /// Treat a string argument as a filesystem path and key on
    /// `(path, size, mtime_ns)`. Fast, but touch-sensitive.
    PathStat,
    /// Treat a string argument as a filesystem path and key on the SHA-256
    /// of its contents. Slower, but rename- and touch-insensitive.
    FileContent,
    /// Arbitrary projection of the argument value.
    Custom(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl std::fmt::Debug for ParamPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamPolicy::Default => f.write_str("Default"),
            ParamPolicy::Ignore => f.write_str("Ignore"),
            ParamPolicy::PathStat => f.write_str("PathStat"),
            ParamPolicy::FileContent => f.write_str("FileContent"),
            ParamPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How the cache key seed is produced from the call arguments.
#[derive(Clone, Default)]
pub enum KeyPolicy {
    /// Canonicalize all arguments.
    #[default]
    Default,
    /// Per-parameter strategies; parameters without an entry use
    /// [`ParamPolicy::Default`].
    PerParam(HashMap<String, ParamPolicy>),
    /// Full custom projection of the argument set.
    Custom(Arc<dyn Fn(&Args) -> Value + Send + Sync>),
}

impl std::fmt::Debug for KeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPolicy::Default => f.write_str("Default"),
            KeyPolicy::PerParam(m) => f.debug_tuple("PerParam").field(m).finish(),
            KeyPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KeyPolicy {
    /// Ignore the named parameters, default-hash the rest.
    pub fn ignore<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPolicy::PerParam(
            names
                .into_iter()
                .map(|n| (n.into(), ParamPolicy::Ignore))
                .collect(),
        )
    }

    /// Mixed per-parameter strategies.
    pub fn map<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, ParamPolicy)>,
        S: Into<String>,
    {
        KeyPolicy::PerParam(entries.into_iter().map(|(n, p)| (n.into(), p)).collect())
    }

    /// Full custom seed function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Args) -> Value + Send + Sync + 'static,
    {
        KeyPolicy::Custom(Arc::new(f))
    }

    /// Project the arguments into the key seed. The seed is a map keyed by
    /// parameter name, so canonicalization sorts it independently of call
    /// order.
    pub fn project(&self, args: &Args) -> Value {
        match self {
            KeyPolicy::Default => seed_from(args, &HashMap::new()),
            KeyPolicy::PerParam(per_param) => seed_from(args, per_param),
            KeyPolicy::Custom(f) => f(args),
        }
    }
}

fn seed_from(args: &Args, per_param: &HashMap<String, ParamPolicy>) -> Value {
    let mut entries = Vec::with_capacity(args.len());
    for (name, value) in args.iter() {
        let policy = per_param.get(name).unwrap_or(&ParamPolicy::Default);
        match policy {
            ParamPolicy::Ignore => continue,
            ParamPolicy::Default => entries.push((name.to_owned(), value.clone())),
            ParamPolicy::PathStat => entries.push((name.to_owned(), path_stat(value))),
            ParamPolicy::FileContent => entries.push((name.to_owned(), file_content(value))),
            ParamPolicy::Custom(f) => entries.push((name.to_owned(), f(value))),
        }
    }
    Value::Map(entries)
}

/// `(path, size, mtime_ns)` substitute for a path-valued argument.
fn path_stat(value: &Value) -> Value {
    let Some(path) = value.as_str() else {
        // Non-string arguments fall back to their own value.
        return value.clone();
    };
    let Ok(meta) = std::fs::metadata(path) else {
        return missing_marker(path);
    };
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Value::Seq(vec![
        Value::Str(path.to_owned()),
        Value::Int(meta.len() as i64),
        Value::Int(mtime_ns),
    ])
}

/// SHA-256-of-contents substitute for a path-valued argument, streamed in
/// 64 KiB chunks.
fn file_content(value: &Value) -> Value {
    let Some(path) = value.as_str() else {
        return value.clone();
    };
    if !Path::new(path).exists() {
        return missing_marker(path);
    }
    match hash_file(path) {
        Ok(digest) => Value::Str(digest),
        Err(_) => Value::Seq(vec![
            Value::Str(TAG_UNREADABLE.into()),
            Value::Str(path.to_owned()),
        ]),
    }
}

fn missing_marker(path: &str) -> Value {
    Value::Seq(vec![
        Value::Str(TAG_MISSING.into()),
        Value::Str(path.to_owned()),
    ])
}

fn hash_file(path: &str) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_drops_parameter() {
        let policy = KeyPolicy::ignore(["verbose"]);
        let a = policy.project(&Args::new().with("data", 5).with("verbose", true));
        let b = policy.project(&Args::new().with("data", 5).with("verbose", false));
        assert_eq!(a, b);

        let c = policy.project(&Args::new().with("data", 6).with("verbose", true));
        assert_ne!(a, c);
    }

    #[test]
    fn test_default_seed_is_order_insensitive_after_canonicalization() {
        use crate::canon::canonical_bytes;
        use crate::codec::Serializer;

        let policy = KeyPolicy::Default;
        let a = policy.project(&Args::new().with("a", 1).with("b", 2));
        let b = policy.project(&Args::new().with("b", 2).with("a", 1));

        let ser = Serializer::new();
        assert_eq!(
            canonical_bytes(&ser, &a).unwrap(),
            canonical_bytes(&ser, &b).unwrap()
        );
    }

    #[test]
    fn test_path_stat_missing_file_marker() {
        let policy = KeyPolicy::map([("path", ParamPolicy::PathStat)]);
        let seed = policy.project(&Args::new().with("path", "/definitely/not/here.cfg"));
        let projected = seed.get("path").unwrap();
        match projected {
            Value::Seq(parts) => assert_eq!(parts[0], Value::Str(TAG_MISSING.into())),
            other => panic!("expected marker, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_param_projection() {
        let policy = KeyPolicy::map([(
            "text",
            ParamPolicy::Custom(Arc::new(|v| {
                Value::Int(v.as_str().map(|s| s.len() as i64).unwrap_or(0))
            })),
        )]);
        let a = policy.project(&Args::new().with("text", "abc"));
        let b = policy.project(&Args::new().with("text", "xyz"));
        // Same length projects to the same seed.
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_whole_args_policy() {
        let policy = KeyPolicy::custom(|_| Value::Str("fixed".into()));
        let a = policy.project(&Args::new().with("x", 1));
        let b = policy.project(&Args::new().with("x", 2));
        assert_eq!(a, b);
    }
}
