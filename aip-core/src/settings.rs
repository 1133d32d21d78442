//! Path-addressed configuration and state maps.
//!
//! Components keep their raw configuration as [`Settings`] so that a stored
//! process reproduces exactly what it was created with, and parse a typed view
//! from it when they are constructed. Options nobody models in a struct stay
//! reachable through [`Settings::get`], which is the escape hatch for
//! extension-specific keys.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AipError, Result};

/// A nested JSON object addressed with `/`-separated paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(Map<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. `null` becomes an empty map; anything else but an
    /// object is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(AipError::validation(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Look up a value by path, e.g. `processing_limit/record_count`.
    ///
    /// Returns `None` as soon as a segment is missing or a non-object is
    /// encountered on the way down.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Look up a value by path, falling back to `default`.
    pub fn get_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get(path).unwrap_or(default)
    }

    /// String value at `path`, if it is a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Set a value by path, creating intermediate objects. Intermediate
    /// values that are not objects are replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.0;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current.insert(last.to_string(), value);
    }

    /// Remove the value at `path`, returning it.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (last, parents) = segments.split_last()?;
        let mut current = &mut self.0;
        for segment in parents {
            current = current.get_mut(*segment)?.as_object_mut()?;
        }
        current.remove(*last)
    }

    /// Parse a typed view of these settings.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            AipError::configuration(format!("invalid configuration: {e}"))
        })
    }

    /// Build settings from any serializable configuration struct.
    pub fn from_serializable<T: Serialize>(config: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(config)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Settings {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Lenient boolean used for every on/off option.
///
/// `true`, non-zero numbers, non-empty arrays/objects and strings other than
/// `""`, `0`, `false`, `no`, `off` are true. `null` is false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "0" | "false" | "no" | "off")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// `deserialize_with` helper applying [`truthy`].
pub fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(truthy(&value))
}

/// `deserialize_with` helper for counts given as numbers or numeric strings.
/// Zero and missing values both mean "no limit".
pub fn deserialize_limit<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = Value::deserialize(deserializer)?;
    let count = match &value {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(
            s.trim()
                .parse::<f64>()
                .map_err(|_| D::Error::custom(format!("'{s}' is not a number")))?,
        ),
        other => return Err(D::Error::custom(format!("'{other}' is not a number"))),
    };
    Ok(count.filter(|c| *c >= 1.0).map(|c| c as u64))
}
