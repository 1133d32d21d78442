//! Files holding a JSON array of records.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::{RecordSource, StreamReader};
use crate::{AipError, Record, Result, Settings};

/// Reader for JSON files, see [`JsonSource`]
pub type JsonReader = StreamReader<JsonSource>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonOptions {
    path: Option<String>,
}

/// The elements of a top-level JSON array, one record each
///
/// Elements must be objects or arrays. With `path` (e.g. `"contact/address"`)
/// each record is the value found by descending into the element, or `null`
/// if it is not there.
pub struct JsonSource {
    path: Vec<String>,
    elements: Option<std::vec::IntoIter<Value>>,
}

impl JsonSource {
    fn select(&self, element: Value) -> Value {
        self.path.iter().fold(element, |value, segment| match value {
            Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
            Value::Array(mut items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => items.swap_remove(index),
                _ => Value::Null,
            },
            _ => Value::Null,
        })
    }
}

impl RecordSource for JsonSource {
    const CLASS: &'static str = "json";

    fn from_settings(configuration: &Settings) -> Result<Self> {
        let options: JsonOptions = configuration.parse()?;
        let path = options
            .path
            .map(|p| {
                p.split('/')
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { path, elements: None })
    }

    fn can_read(&self, uri: &str) -> bool {
        Path::new(uri).is_file() && fs::File::open(uri).is_ok()
    }

    fn open(&mut self, uri: &str) -> Result<()> {
        let data = fs::read(uri)
            .map_err(|e| AipError::source_access(format!("Couldn't open file '{uri}' for reading: {e}")))?;
        let elements = match serde_json::from_slice(&data) {
            Ok(Value::Array(elements)) => elements,
            Ok(_) => {
                return Err(AipError::invalid_format(format!(
                    "JSON file '{uri}' does not contain an array"
                )))
            }
            Err(e) => {
                return Err(AipError::invalid_format(format!(
                    "Couldn't parse JSON file '{uri}': {e}"
                )))
            }
        };
        self.elements = Some(elements.into_iter());
        Ok(())
    }

    fn read_record(&mut self) -> Option<Result<Record>> {
        let element = self.elements.as_mut()?.next()?;
        if !(element.is_object() || element.is_array()) {
            return Some(Err(AipError::record("Couldn't read record.")));
        }
        Some(Ok(Record::from_value(self.select(element))))
    }

    fn close(&mut self) {
        self.elements = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reader;
    use serde_json::json;
    use tempfile::TempDir;

    fn source_file(dir: &TempDir, content: &Value) -> String {
        let path = dir.path().join("records.json");
        fs::write(&path, content.to_string()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn reader(config: Value) -> JsonReader {
        JsonReader::new(Settings::from_value(config).unwrap(), Value::Null).unwrap()
    }

    #[test]
    fn test_reads_array_elements() {
        let dir = TempDir::new().unwrap();
        let uri = source_file(&dir, &json!([{"id": 1}, {"id": 2}]));
        let mut reader = reader(json!({}));
        assert!(reader.can_read_source(&uri));

        reader.initialise_with_source(&uri).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().get("id"), Some(&json!(1)));
        assert_eq!(reader.next_record().unwrap().unwrap().get("id"), Some(&json!(2)));
        assert!(!reader.has_more_records());
    }

    #[test]
    fn test_path_descends_into_records() {
        let dir = TempDir::new().unwrap();
        let uri = source_file(
            &dir,
            &json!([
                {"contact": {"address": {"city": "Berlin"}}},
                {"contact": {}},
            ]),
        );
        let mut reader = reader(json!({"path": "contact/address"}));
        reader.initialise_with_source(&uri).unwrap();

        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.get_str("city"), Some("Berlin"));
        let second = reader.next_record().unwrap().unwrap();
        assert!(second.as_value().is_null());
    }

    #[test]
    fn test_scalar_element_fails_as_record() {
        let dir = TempDir::new().unwrap();
        let uri = source_file(&dir, &json!([{"id": 1}, 42, {"id": 3}]));
        let mut reader = reader(json!({}));
        reader.initialise_with_source(&uri).unwrap();

        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(reader.next_record(), Err(AipError::RecordProcessing(_))));
        assert_eq!(reader.next_record().unwrap().unwrap().get("id"), Some(&json!(3)));
    }

    #[test]
    fn test_non_array_file_cannot_be_initialised() {
        let dir = TempDir::new().unwrap();
        let uri = source_file(&dir, &json!({"id": 1}));
        let mut reader = reader(json!({}));
        assert!(reader.initialise_with_source(&uri).is_err());
    }

    #[test]
    fn test_resume_skips_elements() {
        let dir = TempDir::new().unwrap();
        let uri = source_file(&dir, &json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        let state = json!({"version": 1, "current_file": uri, "processed_count": 2, "failed_count": 0});
        let mut reader = JsonReader::new(Settings::new(), state).unwrap();
        reader.initialise_with_source(&uri).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().get("id"), Some(&json!(3)));
        assert_eq!(reader.processed_count(), 2);
    }
}
