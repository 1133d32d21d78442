//! A single, fixed local file.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Finder;
use crate::component::parse_state;
use crate::settings::deserialize_flag;
use crate::{AipError, Component, Result, RunContext, Settings};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StaticFileOptions {
    #[serde(alias = "url")]
    path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_flag")]
    detect_changes: bool,
}

/// Checkpoint of a [`StaticFileFinder`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticFileState {
    /// SHA-256 of the contents last claimed
    pub last_file_checksum: Option<String>,
    pub processed_count: u64,
    pub failed_count: u64,
}

/// Offers the same file on every run
///
/// With `detect_changes` the file is only offered again once its contents
/// differ from what was claimed last time. The file is never moved, so
/// claiming and marking only update the checkpoint.
pub struct StaticFileFinder {
    configuration: Settings,
    options: StaticFileOptions,
    state: StaticFileState,
}

impl StaticFileFinder {
    pub const CLASS: &'static str = "static_file";

    pub fn new(configuration: Settings, state: Value) -> Result<Self> {
        let options = configuration.parse()?;
        Ok(Self {
            configuration,
            options,
            state: parse_state(Self::CLASS, state)?,
        })
    }

    pub fn checkpoint(&self) -> &StaticFileState {
        &self.state
    }

    fn path(&self) -> Result<&PathBuf> {
        self.options
            .path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| AipError::configuration("No 'path' set"))
    }
}

fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

impl Component for StaticFileFinder {
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
        self.path().map(|_| ())
    }
}

impl Finder for StaticFileFinder {
    fn find_next_source(&self, ctx: &RunContext<'_>) -> Result<Option<String>> {
        let path = self.path()?;
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(process_id = ctx.id_for_log(), file = %path.display(), "Cannot read file: {}", e);
                return Ok(None);
            }
        };

        if self.options.detect_changes
            && self.state.last_file_checksum.as_deref() == Some(checksum(&data).as_str())
        {
            tracing::debug!(process_id = ctx.id_for_log(), file = %path.display(), "File has not changed");
            return Ok(None);
        }
        Ok(Some(path.to_string_lossy().into_owned()))
    }

    fn claim_source(&mut self, _ctx: &RunContext<'_>, uri: &str) -> Result<String> {
        if self.options.detect_changes {
            let data = fs::read(uri)
                .map_err(|e| AipError::source_access(format!("Couldn't claim source '{uri}': {e}")))?;
            self.state.last_file_checksum = Some(checksum(&data));
        }
        Ok(uri.to_string())
    }

    fn mark_source_processed(&mut self, _ctx: &RunContext<'_>, _uri: &str) -> Result<()> {
        self.state.processed_count += 1;
        Ok(())
    }

    fn mark_source_failed(&mut self, _ctx: &RunContext<'_>, _uri: &str) -> Result<()> {
        self.state.failed_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn finder(config: Value) -> StaticFileFinder {
        StaticFileFinder::new(Settings::from_value(config).unwrap(), Value::Null).unwrap()
    }

    #[test]
    fn test_requires_path() {
        let finder = finder(json!({}));
        assert!(finder.verify_configuration(&RunContext::detached()).is_err());
    }

    #[test]
    fn test_always_offers_file_without_change_detection() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.csv");
        fs::write(&path, "a\n1\n").unwrap();
        let mut finder = finder(json!({"url": path}));
        let ctx = RunContext::detached();

        let found = finder.find_next_source(&ctx).unwrap().unwrap();
        assert_eq!(finder.claim_source(&ctx, &found).unwrap(), found);
        finder.mark_source_processed(&ctx, &found).unwrap();
        assert!(finder.find_next_source(&ctx).unwrap().is_some());
        assert!(path.exists());
    }

    #[test]
    fn test_detect_changes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.csv");
        fs::write(&path, "a\n1\n").unwrap();
        let mut finder = finder(json!({"path": path, "detect_changes": true}));
        let ctx = RunContext::detached();

        let found = finder.find_next_source(&ctx).unwrap().unwrap();
        finder.claim_source(&ctx, &found).unwrap();
        finder.mark_source_processed(&ctx, &found).unwrap();
        assert!(finder.find_next_source(&ctx).unwrap().is_none());

        fs::write(&path, "a\n1\n2\n").unwrap();
        assert!(finder.find_next_source(&ctx).unwrap().is_some());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let finder = finder(json!({"path": temp_dir.path().join("nope.csv")}));
        assert!(finder.find_next_source(&RunContext::detached()).unwrap().is_none());
    }

    #[test]
    fn test_checksum_survives_restore() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.csv");
        fs::write(&path, "a\n1\n").unwrap();
        let config = json!({"path": path, "detect_changes": "1"});
        let mut first = finder(config.clone());
        let ctx = RunContext::detached();
        let found = first.find_next_source(&ctx).unwrap().unwrap();
        first.claim_source(&ctx, &found).unwrap();

        let restored =
            StaticFileFinder::new(Settings::from_value(config).unwrap(), first.state().unwrap()).unwrap();
        assert_eq!(restored.checkpoint(), first.checkpoint());
        assert!(restored.find_next_source(&ctx).unwrap().is_none());
    }
}
