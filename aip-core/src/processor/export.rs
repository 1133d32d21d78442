//! Reshape records and append them to a JSON lines file.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::Processor;
use crate::component::parse_state;
use crate::{AipError, Component, Record, Result, RunContext, Settings};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutputOptions {
    file: Option<PathBuf>,
}

/// Which fields to trim
#[derive(Debug, Default, PartialEq)]
enum Trim {
    #[default]
    None,
    All,
    Fields(Vec<String>),
}

impl<'de> Deserialize<'de> for Trim {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) if s.eq_ignore_ascii_case("all") => Trim::All,
            value => match field_list(value) {
                Some(fields) => Trim::Fields(fields),
                None => Trim::None,
            },
        })
    }
}

/// A list of field names, given as an array or as a comma separated string
fn field_list(value: Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
        Value::String(s) if !s.trim().is_empty() => Some(
            s.split(',')
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn deserialize_field_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(field_list(Value::deserialize(deserializer)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportOptions {
    output: OutputOptions,
    parameter_mapping: Map<String, Value>,
    #[serde(deserialize_with = "deserialize_field_list")]
    positive_parameter_list: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_field_list")]
    negative_parameter_list: Option<Vec<String>>,
    trim_parameters: Trim,
    #[serde(alias = "api_values")]
    static_values: Map<String, Value>,
}

/// Checkpoint of an [`ExportProcessor`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportState {
    pub exported_count: u64,
}

/// Writes each record, reshaped, as one line of JSON
///
/// The record passes through these steps in order:
/// 1. `parameter_mapping` renames fields (`{"old": "new"}`); fields that are
///    missing or `null` are left alone.
/// 2. `positive_parameter_list` keeps only the listed fields, then
///    `negative_parameter_list` removes the listed ones.
/// 3. `trim_parameters` trims string values, `"all"` or a list of fields.
/// 4. `static_values` are merged in, replacing fields of the same name.
///
/// The result is appended to `output/file`.
pub struct ExportProcessor {
    configuration: Settings,
    options: ExportOptions,
    state: ExportState,
    last_record: Option<Record>,
}

impl ExportProcessor {
    pub const CLASS: &'static str = "export";

    pub fn new(configuration: Settings, state: Value) -> Result<Self> {
        let options = configuration.parse()?;
        Ok(Self {
            configuration,
            options,
            state: parse_state(Self::CLASS, state)?,
            last_record: None,
        })
    }

    pub fn checkpoint(&self) -> &ExportState {
        &self.state
    }

    fn output_file(&self) -> Result<&PathBuf> {
        self.options
            .output
            .file
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| AipError::configuration("No 'output/file' set"))
    }

    /// Apply mapping, filters, trimming and static values to `record`
    pub fn transform(&self, record: &Record) -> Result<Map<String, Value>> {
        let mut fields = record
            .as_object()
            .cloned()
            .ok_or_else(|| AipError::record("Record is not a mapping of fields"))?;

        for (old, new) in &self.options.parameter_mapping {
            let Some(new) = new.as_str() else { continue };
            if old == new {
                continue;
            }
            if let Some(value) = fields.get(old).filter(|v| !v.is_null()).cloned() {
                fields.remove(old);
                fields.insert(new.to_string(), value);
            }
        }

        if let Some(keep) = &self.options.positive_parameter_list {
            let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
            fields.retain(|name, _| keep.contains(name.as_str()));
        }
        if let Some(drop) = &self.options.negative_parameter_list {
            for name in drop {
                fields.remove(name);
            }
        }

        match &self.options.trim_parameters {
            Trim::None => {}
            Trim::All => fields.values_mut().for_each(trim),
            Trim::Fields(names) => {
                for name in names {
                    if let Some(value) = fields.get_mut(name) {
                        trim(value);
                    }
                }
            }
        }

        for (name, value) in &self.options.static_values {
            fields.insert(name.clone(), value.clone());
        }
        Ok(fields)
    }
}

fn trim(value: &mut Value) {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if trimmed.len() != s.len() {
            *s = trimmed.to_string();
        }
    }
}

impl Component for ExportProcessor {
    fn class(&self) -> &'static str {
        Self::CLASS
    }

    fn configuration(&self) -> &Settings {
        &self.configuration
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn verify_configuration(&self, _ctx: &RunContext<'_>) -> Result<()> {
        let file = self.output_file()?;
        match file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            Some(dir) if !dir.is_dir() => Err(AipError::configuration(format!(
                "Output folder '{}' does not exist",
                dir.display()
            ))),
            _ => Ok(()),
        }
    }
}

impl Processor for ExportProcessor {
    fn process_record(&mut self, ctx: &RunContext<'_>, record: &Record) -> Result<()> {
        self.last_record = Some(record.clone());
        let fields = self.transform(record)?;
        let path = self.output_file()?.clone();

        let mut line = serde_json::to_string(&fields)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        self.state.exported_count += 1;
        tracing::debug!(
            process_id = ctx.id_for_log(),
            file = %path.display(),
            exported = self.state.exported_count,
            "Exported record"
        );
        Ok(())
    }

    fn last_record(&self) -> Option<&Record> {
        self.last_record.as_ref()
    }
}

/// Read back everything an [`ExportProcessor`] wrote to `path`
pub fn read_exported(path: &std::path::Path) -> Result<Vec<Value>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}
