//! Canonicalization and cache-key derivation.
//!
//! `canonicalize` reduces semantically-equivalent value trees to a single
//! normal form: maps become entry lists sorted by key bytes, sets become
//! sequences sorted by each element's canonical encoding, arrays carry
//! their raw bytes, and custom types are replaced by their registered
//! intermediate. The normal form uses only plain atoms, so its msgpack
//! encoding is deterministic and safe to hash.
//!
//! SHA-256 is used throughout. The raw-bytes rule for arrays matters: any
//! truncated textual rendering would collide for large arrays that share a
//! prefix.

use sha2::{Digest, Sha256};

use crate::codec::{SerializationError, Serializer};
use crate::value::Value;

// Tags for canonical composites. Dunder names keep them out of the way of
// ordinary string atoms.
const TAG_FLOAT: &str = "__f64__";
const TAG_ARRAY: &str = "__array__";
const TAG_OBJECT: &str = "__object__";

/// Normalize a value tree into its canonical form.
///
/// The serializer supplies encoders for custom types; an unregistered
/// custom value fails here with the same error encoding it would produce.
pub fn canonicalize(ser: &Serializer, value: &Value) -> Result<Value, SerializationError> {
    match value {
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Str(_) | Value::Bytes(_) => {
            Ok(value.clone())
        }
        Value::Float(f) => Ok(canonical_float(*f)),
        Value::Seq(items) => Ok(Value::Seq(
            items
                .iter()
                .map(|v| canonicalize(ser, v))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Set(items) => {
            let mut keyed = items
                .iter()
                .map(|v| {
                    let canonical = canonicalize(ser, v)?;
                    let bytes = ser.encode(&canonical)?;
                    Ok((bytes, canonical))
                })
                .collect::<Result<Vec<_>, SerializationError>>()?;
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            keyed.dedup_by(|a, b| a.0 == b.0);
            Ok(Value::Seq(keyed.into_iter().map(|(_, v)| v).collect()))
        }
        Value::Map(entries) => {
            let mut sorted: Vec<_> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            Ok(Value::Seq(
                sorted
                    .into_iter()
                    .map(|(k, v)| {
                        Ok(Value::Seq(vec![
                            Value::Str(k.clone()),
                            canonicalize(ser, v)?,
                        ]))
                    })
                    .collect::<Result<Vec<_>, SerializationError>>()?,
            ))
        }
        Value::Array(arr) => Ok(Value::Seq(vec![
            Value::Str(TAG_ARRAY.into()),
            Value::Seq(arr.shape.iter().map(|&d| Value::Int(d as i64)).collect()),
            Value::Str(arr.dtype.clone()),
            Value::Bytes(arr.data.clone()),
        ])),
        Value::Custom(c) => {
            let (type_name, intermediate) = ser.intermediate_for(c.as_ref())?;
            Ok(Value::Seq(vec![
                Value::Str(TAG_OBJECT.into()),
                Value::Str(type_name.into()),
                canonicalize(ser, &intermediate)?,
            ]))
        }
    }
}

/// Non-finite floats get typed markers so NaN keys stably; -0.0 folds into
/// 0.0 so the two zero bit patterns share a key.
fn canonical_float(f: f64) -> Value {
    if f.is_nan() {
        Value::Seq(vec![Value::Str(TAG_FLOAT.into()), Value::Str("nan".into())])
    } else if f == f64::INFINITY {
        Value::Seq(vec![Value::Str(TAG_FLOAT.into()), Value::Str("inf".into())])
    } else if f == f64::NEG_INFINITY {
        Value::Seq(vec![Value::Str(TAG_FLOAT.into()), Value::Str("-inf".into())])
    } else if f == 0.0 {
        Value::Float(0.0)
    } else {
        Value::Float(f)
    }
}

/// Canonicalize and encode in one step: the stable byte form fed to SHA-256.
pub fn canonical_bytes(ser: &Serializer, value: &Value) -> Result<Vec<u8>, SerializationError> {
    let canonical = canonicalize(ser, value)?;
    ser.encode(&canonical)
}

/// Informational identifier for the canonical input: hex SHA-256 of the
/// canonical bytes.
pub fn input_id(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

/// Derive the cache key: `SHA256(func_name || 0x00 || canonical || 0x00 || version)`,
/// lowercase hex. The NUL separators keep `("ab", "c")` and `("a", "bc")`
/// on different keys.
pub fn derive_cache_key(func_name: &str, canonical: &[u8], version: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(func_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical);
    hasher.update([0u8]);
    if let Some(v) = version {
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}
