//! MessagePack codec with a user-extensible type registry.
//!
//! The wire format is standard msgpack. Registered custom types are carried
//! as ext frames with application codes 0..=127; the engine's own composite
//! frames (sets, raw arrays) use reserved negative codes so they can never
//! collide with a user registration.
//!
//! Custom encoding is nested: a user encoder returns an intermediate
//! `Value` (typically a map), which is itself msgpack-encoded to form the
//! ext payload. Decoding reverses the nesting before the user decoder runs,
//! so encoders and decoders only ever deal in structured values, never in
//! binary framing.

use std::any::TypeId;
use std::collections::HashMap;

use rmpv::Value as Wire;
use thiserror::Error;

use crate::value::{ArrayValue, CustomValue, Value};

/// Highest ext code available to user registrations.
pub const MAX_EXT_CODE: u8 = 127;

// Engine-internal ext codes. Negative codes are reserved by the msgpack
// spec, which keeps them disjoint from the 0..=127 user range.
const EXT_SET: i8 = -2;
const EXT_ARRAY: i8 = -3;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error(
        "type '{type_name}' is not serializable; register it with `register_type` \
         (code 0..=127, encoder, decoder) first"
    )]
    Unregistered { type_name: &'static str },

    #[error("unknown extension code {0}; the data may have been written by a registry with more types")]
    UnknownCode(i8),

    #[error("custom decoder for extension code {code} failed: {reason}")]
    DecoderFailed { code: u8, reason: String },

    #[error("value cannot be encoded: {0}")]
    Encode(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("extension code {0} is out of range (custom codes are 0..=127)")]
    CodeOutOfRange(u8),

    #[error("extension code {0} is already registered")]
    CodeInUse(u8),

    #[error("type '{0}' is already registered")]
    TypeInUse(&'static str),
}

type EncodeFn = Box<dyn Fn(&dyn CustomValue) -> Result<Value, SerializationError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(Value) -> Result<Value, SerializationError> + Send + Sync>;

struct TypeEntry {
    code: u8,
    type_name: &'static str,
    encode: EncodeFn,
}

/// Codec plus the process-global injective mapping of custom types to ext
/// codes. Registrations happen during setup; encode/decode afterwards.
#[derive(Default)]
pub struct Serializer {
    by_type: HashMap<TypeId, TypeEntry>,
    decoders: HashMap<u8, DecodeFn>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom type under `code`.
    ///
    /// The encoder maps a `&T` to any serializable `Value` (further
    /// registered custom types included); the decoder rebuilds a `T` from
    /// that intermediate. Duplicate codes and duplicate types are rejected.
    pub fn register<T, E, D>(
        &mut self,
        code: u8,
        encoder: E,
        decoder: D,
    ) -> Result<(), RegistrationError>
    where
        T: CustomValue,
        E: Fn(&T) -> Value + Send + Sync + 'static,
        D: Fn(Value) -> Result<T, SerializationError> + Send + Sync + 'static,
    {
        if code > MAX_EXT_CODE {
            return Err(RegistrationError::CodeOutOfRange(code));
        }
        if self.decoders.contains_key(&code) {
            return Err(RegistrationError::CodeInUse(code));
        }
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_type.get(&type_id) {
            return Err(RegistrationError::TypeInUse(existing.type_name));
        }

        let type_name = std::any::type_name::<T>();
        self.by_type.insert(
            type_id,
            TypeEntry {
                code,
                type_name,
                encode: Box::new(move |cv| {
                    let concrete = cv
                        .as_any()
                        .downcast_ref::<T>()
                        .ok_or(SerializationError::Unregistered {
                            type_name: cv.type_name(),
                        })?;
                    Ok(encoder(concrete))
                }),
            },
        );
        self.decoders.insert(
            code,
            Box::new(move |intermediate| {
                decoder(intermediate)
                    .map(Value::custom)
                    .map_err(|e| SerializationError::DecoderFailed {
                        code,
                        reason: e.to_string(),
                    })
            }),
        );
        Ok(())
    }

    /// Encode a value tree to msgpack bytes.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        let wire = self.to_wire(value)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &wire)
            .map_err(|e| SerializationError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode msgpack bytes back into a value tree.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        let wire = rmpv::decode::read_value(&mut &bytes[..])
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.from_wire(wire)
    }

    /// Run the registered encoder for a custom value, returning the type
    /// name and the structured intermediate. Used by canonicalization,
    /// where the intermediate stands in for the object's attributes.
    pub(crate) fn intermediate_for(
        &self,
        custom: &dyn CustomValue,
    ) -> Result<(&'static str, Value), SerializationError> {
        let entry = self
            .by_type
            .get(&custom.as_any().type_id())
            .ok_or(SerializationError::Unregistered {
                type_name: custom.type_name(),
            })?;
        let intermediate = (entry.encode)(custom)?;
        Ok((entry.type_name, intermediate))
    }

    fn to_wire(&self, value: &Value) -> Result<Wire, SerializationError> {
        match value {
            Value::Null => Ok(Wire::Nil),
            Value::Bool(b) => Ok(Wire::Boolean(*b)),
            Value::Int(n) => Ok(Wire::from(*n)),
            Value::Float(f) => Ok(Wire::F64(*f)),
            Value::Str(s) => Ok(Wire::from(s.as_str())),
            Value::Bytes(b) => Ok(Wire::Binary(b.clone())),
            Value::Seq(items) => Ok(Wire::Array(
                items
                    .iter()
                    .map(|v| self.to_wire(v))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::Map(entries) => Ok(Wire::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((Wire::from(k.as_str()), self.to_wire(v)?)))
                    .collect::<Result<Vec<_>, SerializationError>>()?,
            )),
            Value::Set(items) => {
                let inner = Wire::Array(
                    items
                        .iter()
                        .map(|v| self.to_wire(v))
                        .collect::<Result<Vec<_>, _>>()?,
                );
                Ok(Wire::Ext(EXT_SET, pack_wire(&inner)?))
            }
            Value::Array(arr) => {
                let inner = Wire::Array(vec![
                    Wire::Array(arr.shape.iter().map(|&d| Wire::from(d)).collect()),
                    Wire::from(arr.dtype.as_str()),
                    Wire::Binary(arr.data.clone()),
                ]);
                Ok(Wire::Ext(EXT_ARRAY, pack_wire(&inner)?))
            }
            Value::Custom(c) => {
                let entry = self.by_type.get(&c.as_any().type_id()).ok_or(
                    SerializationError::Unregistered {
                        type_name: c.type_name(),
                    },
                )?;
                let intermediate = (entry.encode)(c.as_ref())?;
                // Nested: the intermediate is a full msgpack document of
                // its own, so encoders may return further custom types.
                let payload = self.encode(&intermediate)?;
                Ok(Wire::Ext(entry.code as i8, payload))
            }
        }
    }

    fn from_wire(&self, wire: Wire) -> Result<Value, SerializationError> {
        match wire {
            Wire::Nil => Ok(Value::Null),
            Wire::Boolean(b) => Ok(Value::Bool(b)),
            Wire::Integer(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| SerializationError::Malformed("integer out of i64 range".into())),
            Wire::F32(f) => Ok(Value::Float(f64::from(f))),
            Wire::F64(f) => Ok(Value::Float(f)),
            Wire::String(s) => s
                .into_str()
                .map(Value::Str)
                .ok_or_else(|| SerializationError::Malformed("non-UTF-8 string".into())),
            Wire::Binary(b) => Ok(Value::Bytes(b)),
            Wire::Array(items) => Ok(Value::Seq(
                items
                    .into_iter()
                    .map(|w| self.from_wire(w))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Wire::Map(entries) => Ok(Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Wire::String(s) => s.into_str().ok_or_else(|| {
                                SerializationError::Malformed("non-UTF-8 map key".into())
                            })?,
                            other => {
                                return Err(SerializationError::Malformed(format!(
                                    "map key must be a string, got {other}"
                                )))
                            }
                        };
                        Ok((key, self.from_wire(v)?))
                    })
                    .collect::<Result<Vec<_>, SerializationError>>()?,
            )),
            Wire::Ext(EXT_SET, payload) => match unpack_wire(&payload)? {
                Wire::Array(items) => Ok(Value::Set(
                    items
                        .into_iter()
                        .map(|w| self.from_wire(w))
                        .collect::<Result<Vec<_>, _>>()?,
                )),
                _ => Err(SerializationError::Malformed(
                    "set frame does not contain an array".into(),
                )),
            },
            Wire::Ext(EXT_ARRAY, payload) => match unpack_wire(&payload)? {
                Wire::Array(mut parts) if parts.len() == 3 => {
                    let data = match parts.remove(2) {
                        Wire::Binary(b) => b,
                        _ => {
                            return Err(SerializationError::Malformed(
                                "array frame data is not binary".into(),
                            ))
                        }
                    };
                    let dtype = match parts.remove(1) {
                        Wire::String(s) => s.into_str().ok_or_else(|| {
                            SerializationError::Malformed("non-UTF-8 dtype".into())
                        })?,
                        _ => {
                            return Err(SerializationError::Malformed(
                                "array frame dtype is not a string".into(),
                            ))
                        }
                    };
                    let shape = match parts.remove(0) {
                        Wire::Array(dims) => dims
                            .into_iter()
                            .map(|d| {
                                d.as_u64().ok_or_else(|| {
                                    SerializationError::Malformed(
                                        "array dimension is not an integer".into(),
                                    )
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => {
                            return Err(SerializationError::Malformed(
                                "array frame shape is not an array".into(),
                            ))
                        }
                    };
                    Ok(Value::Array(ArrayValue { shape, dtype, data }))
                }
                _ => Err(SerializationError::Malformed(
                    "array frame does not contain a [shape, dtype, data] triple".into(),
                )),
            },
            Wire::Ext(code, payload) if code >= 0 => {
                let decoder = self
                    .decoders
                    .get(&(code as u8))
                    .ok_or(SerializationError::UnknownCode(code))?;
                // Nested: unwrap the payload into a structured value before
                // the user decoder sees it.
                let intermediate = self.decode(&payload)?;
                decoder(intermediate)
            }
            Wire::Ext(code, _) => Err(SerializationError::UnknownCode(code)),
        }
    }
}

fn pack_wire(wire: &Wire) -> Result<Vec<u8>, SerializationError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, wire)
        .map_err(|e| SerializationError::Encode(e.to_string()))?;
    Ok(buf)
}

fn unpack_wire(bytes: &[u8]) -> Result<Wire, SerializationError> {
    rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| SerializationError::Malformed(e.to_string()))
}
