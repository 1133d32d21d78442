//! The unit of data flowing from a reader to a processor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record read from a source.
///
/// Tabular sources produce an ordered mapping of column name to string value;
/// structured sources may produce any JSON value. A record carries no
/// position of its own, the reader's checkpoint does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Value);

impl Record {
    /// Build a tabular record from `(field, value)` pairs, keeping their order.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        Self(Value::Object(map))
    }

    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Field names, in source order. Empty for non-object records.
    pub fn fields(&self) -> Vec<&str> {
        self.0
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Raw value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.as_object().and_then(|map| map.get(field))
    }

    /// String value of a field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The record as a plain JSON string, e.g. for the error log.
    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}
