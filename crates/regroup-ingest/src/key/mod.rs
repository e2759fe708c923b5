//! Sortable keys
//!
//! A [`SortableKey`] is the composite identity a staged row is sorted by. It
//! is encoded against a [`Schema`] into a fixed binary layout (see
//! [`codec`]) and exposes a human-readable position through a
//! [`PositionSpec`].

pub mod builder;
pub mod codec;
pub mod position;
pub mod schema;

use chrono::{DateTime, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt;

pub use builder::{parse_value, KeyBuilder};
pub use codec::{decode, encode, encode_into};
pub use position::{GeneratorKind, PositionField, PositionSpec};
pub use schema::{FieldDef, FieldType, Schema};

/// Typed value of one key field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Str(String),
    Int32(i32),
    Int64(i64),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Timestamp value at the millisecond precision keys are stored with
    pub fn timestamp(ts: DateTime<Utc>) -> Self {
        let millis = ts.nanosecond() / 1_000_000 * 1_000_000;
        Value::Timestamp(ts.with_nanosecond(millis).unwrap_or(ts))
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Str(_) => FieldType::String,
            Value::Int32(_) => FieldType::Int32,
            Value::Int64(_) => FieldType::Int64,
            Value::Timestamp(_) => FieldType::Timestamp,
        }
    }

    /// String form used in positions; timestamps honour `format` when given
    pub fn render(&self, format: Option<&str>) -> String {
        match (self, format) {
            (Value::Timestamp(ts), Some(fmt)) => ts.format(fmt).to_string(),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Timestamp(ts) => write!(f, "{}", ts.timestamp_millis()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::timestamp(v)
    }
}

/// Immutable mapping of field name to typed value
///
/// Keys are built from parsed columns or decoded from staged bytes. Decoded
/// keys only ever carry stored values; generated position parts live in
/// [`PositionSpec`] and never enter the binary form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortableKey {
    values: BTreeMap<String, Value>,
}

impl SortableKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this key with `name` bound to `value`
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for SortableKey {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
