mod compare;

pub use compare::{canonical_string, compare, equals, type_order, TypeOrder};

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::model::{DocumentKey, Timestamp};

/// A typed field value.
///
/// `ServerTimestamp` is a local-only sentinel for a pending server-assigned
/// time; it carries the write time for ordering and the overwritten value so
/// reads can keep showing it until the backend version arrives.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp {
        local_write_time: Timestamp,
        previous: Option<Box<Value>>,
    },
    String(String),
    Bytes(Bytes),
    Reference(DocumentKey),
    GeoPoint {
        latitude: f64,
        longitude: f64,
    },
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<Value>) -> Self {
        Value::ServerTimestamp {
            local_write_time,
            previous: previous.map(Box::new),
        }
    }

    /// The value a pending server timestamp displays locally: the value it
    /// overwrote, if any.
    pub fn server_timestamp_previous(&self) -> Option<&Value> {
        match self {
            Value::ServerTimestamp { previous, .. } => previous.as_deref(),
            _ => None,
        }
    }

    /// Builds a value from plain JSON. Numbers become `Integer` when they fit
    /// in `i64`, `Double` otherwise; objects and arrays convert recursively.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
