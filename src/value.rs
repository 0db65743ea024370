//! The value model shared by keying, serialization, and the pipeline.
//!
//! `Value` closes over everything the engine can hash and persist: the
//! primitive atoms, ordered sequences, sets, string-keyed maps, raw
//! multi-dimensional arrays, and registered custom types. Results returned by
//! memoized functions and arguments fed into key generation are both
//! expressed as `Value` trees.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A user-defined type that can travel through the engine once registered.
///
/// Implemented automatically for any `Debug + Send + Sync + PartialEq`
/// type; do not implement it by hand.
pub trait CustomValue: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
    fn eq_dyn(&self, other: &dyn CustomValue) -> bool;
}

impl<T> CustomValue for T
where
    T: fmt::Debug + Send + Sync + PartialEq + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn eq_dyn(&self, other: &dyn CustomValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|o| self == o)
    }
}

/// Raw array payload: shape, element type tag, and the backing bytes.
///
/// Carrying the full byte buffer (never a textual rendering) is what keeps
/// two arrays with equal shape and dtype but different contents on distinct
/// cache keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub shape: Vec<u64>,
    pub dtype: String,
    pub data: Vec<u8>,
}

/// A dynamically-typed value.
///
/// `Map` keys are strings and preserve insertion order; equality for `Map`
/// and `Set` is order-insensitive. Float equality identifies all NaNs, so a
/// NaN argument hits the same cache entry on every call.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(String, Value)>),
    Array(ArrayValue),
    Custom(Arc<dyn CustomValue>),
}

impl Value {
    /// Wrap a registered custom type.
    pub fn custom<T: CustomValue>(value: T) -> Self {
        Value::Custom(Arc::new(value))
    }

    /// Downcast a `Custom` value to its concrete type.
    pub fn as_custom<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Custom(c) => c.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Map lookup by key; `None` for absent keys and non-map values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

/// Set comparison: mutual containment, so duplicates collapse the way
/// canonicalization collapses them.
fn set_eq(a: &[Value], b: &[Value]) -> bool {
    a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => set_eq(a, b),
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(bk, bv)| bk == k && bv == v))
            }
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => a.eq_dyn(b.as_ref()),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

/// Named call arguments, in call-site order.
///
/// Every argument is named, so per-parameter key policies always bind by
/// name and the derived cache key is independent of argument order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    params: Vec<(String, Value)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_equality_ignores_entry_order() {
        let a = Value::Map(vec![
            ("x".into(), Value::Int(1)),
            ("y".into(), Value::Int(2)),
        ]);
        let b = Value::Map(vec![
            ("y".into(), Value::Int(2)),
            ("x".into(), Value::Int(1)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_equality_ignores_order_and_duplicates() {
        let a = Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(2)]);
        let b = Value::Set(vec![Value::Int(2), Value::Int(1)]);
        let c = Value::Set(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(f64::NAN), Value::Float(0.0));
    }

    #[test]
    fn test_custom_equality_via_downcast() {
        #[derive(Debug, PartialEq)]
        struct Point {
            x: i64,
        }
        let a = Value::custom(Point { x: 3 });
        let b = Value::custom(Point { x: 3 });
        let c = Value::custom(Point { x: 4 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_custom::<Point>().unwrap().x, 3);
    }

    #[test]
    fn test_args_lookup_by_name() {
        let args = Args::new().with("data", 5).with("verbose", true);
        assert_eq!(args.get("data"), Some(&Value::Int(5)));
        assert_eq!(args.get("verbose"), Some(&Value::Bool(true)));
        assert_eq!(args.get("missing"), None);
        assert_eq!(args.len(), 2);
    }
}
