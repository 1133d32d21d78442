//! Files dropped into an inbox folder.
//!
//! The finder works on five folders: files are uploaded into `uploading`,
//! moved to `inbox` when complete, claimed into `processing` and finally moved
//! to `processed` or `failed`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Finder;
use crate::component::parse_state;
use crate::{AipError, Component, Result, RunContext, Settings};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DropFolderOptions {
    folder: Folders,
    filter: Filter,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Folders {
    uploading: Option<PathBuf>,
    inbox: Option<PathBuf>,
    processing: Option<PathBuf>,
    processed: Option<PathBuf>,
    failed: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Filter {
    file_name: Option<String>,
}

/// Checkpoint of a [`DropFolderFinder`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropFolderState {
    pub claimed_count: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub last_claimed: Option<String>,
}

/// Finder picking files from an inbox folder, oldest name first
pub struct DropFolderFinder {
    configuration: Settings,
    folders: Folders,
    file_filter: Option<Regex>,
    state: DropFolderState,
}

impl DropFolderFinder {
    pub const CLASS: &'static str = "drop_folder";

    pub fn new(configuration: Settings, state: Value) -> Result<Self> {
        let options: DropFolderOptions = configuration.parse()?;
        let file_filter = options
            .filter
            .file_name
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(compile_filter)
            .transpose()?;

        Ok(Self {
            configuration,
            folders: options.folder,
            file_filter,
            state: parse_state(Self::CLASS, state)?,
        })
    }

    pub fn checkpoint(&self) -> &DropFolderState {
        &self.state
    }

    fn folder(&self, stage: &'static str) -> Result<&Path> {
        let folder = match stage {
            "uploading" => &self.folders.uploading,
            "inbox" => &self.folders.inbox,
            "processing" => &self.folders.processing,
            "processed" => &self.folders.processed,
            _ => &self.folders.failed,
        };
        folder
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| AipError::configuration(format!("Folder '{stage}' is not configured.")))
    }

    fn move_into(&self, stage: &'static str, uri: &str) -> Result<String> {
        let source = Path::new(uri);
        let file_name = source
            .file_name()
            .ok_or_else(|| AipError::source_access(format!("'{uri}' is not a file path")))?;
        let target = self.folder(stage)?.join(file_name);
        fs::rename(source, &target).map_err(|e| {
            AipError::source_access(format!("Couldn't move '{uri}' to {stage}: {e}"))
        })?;
        Ok(target.to_string_lossy().into_owned())
    }
}

/// Compile a file name filter. Patterns written as `/…/flags` have their
/// delimiters stripped; the `i` flag is honoured.
fn compile_filter(pattern: &str) -> Result<Regex> {
    let delimited = pattern
        .strip_prefix('/')
        .and_then(|rest| rest.rfind('/').map(|end| (&rest[..end], &rest[end + 1..])))
        .filter(|(_, flags)| flags.chars().all(|c| c.is_ascii_alphabetic()));
    let (body, case_insensitive) = match delimited {
        Some((body, flags)) => (body, flags.contains('i')),
        None => (pattern, false),
    };
    RegexBuilder::new(body)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| AipError::configuration(format!("Invalid file name filter '{pattern}': {e}")))
}

impl Component for DropFolderFinder {
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
        let mut seen: Vec<&Path> = Vec::new();
        for stage in ["uploading", "inbox", "processing", "processed", "failed"] {
            let folder = self.folder(stage)?;
            if seen.contains(&folder) {
                return Err(AipError::configuration(format!(
                    "Folder '{}' is used for multiple stages.",
                    folder.display()
                )));
            }
            seen.push(folder);

            let metadata = fs::metadata(folder).map_err(|_| {
                AipError::configuration(format!("Folder '{}' is not readable.", folder.display()))
            })?;
            if !metadata.is_dir() {
                return Err(AipError::configuration(format!(
                    "Folder '{}' is not a folder.",
                    folder.display()
                )));
            }
            if metadata.permissions().readonly() {
                return Err(AipError::configuration(format!(
                    "Folder '{}' is not writable.",
                    folder.display()
                )));
            }
        }
        Ok(())
    }
}

impl Finder for DropFolderFinder {
    fn find_next_source(&self, ctx: &RunContext<'_>) -> Result<Option<String>> {
        let inbox = self.folder("inbox")?;
        let entries = fs::read_dir(inbox).map_err(|e| {
            AipError::source_access(format!(
                "Cannot list files in inbox folder '{}': {}",
                inbox.display(),
                e
            ))
        })?;

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        candidates.sort();

        for path in candidates {
            let path_str = path.to_string_lossy();
            let matches = self
                .file_filter
                .as_ref()
                .map_or(true, |filter| filter.is_match(&path_str));
            if !matches {
                tracing::debug!(process_id = ctx.id_for_log(), file = %path_str, "File doesn't match the filter");
                continue;
            }
            if path.is_file() && File::open(&path).is_ok() {
                return Ok(Some(path_str.into_owned()));
            }
            tracing::warn!(process_id = ctx.id_for_log(), file = %path_str, "File could not be read");
        }
        Ok(None)
    }

    fn claim_source(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<String> {
        let source = Path::new(uri);
        let file_name = source
            .file_name()
            .ok_or_else(|| AipError::source_access(format!("'{uri}' is not a file path")))?
            .to_string_lossy();
        let unique = Uuid::new_v4().simple().to_string();
        let target_name = format!(
            "{}_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &unique[..20],
            file_name
        );
        let target = self.folder("processing")?.join(target_name);

        fs::rename(source, &target)
            .map_err(|e| AipError::source_access(format!("Couldn't claim source '{uri}': {e}")))?;
        let claimed = target.to_string_lossy().into_owned();
        tracing::info!(process_id = ctx.id_for_log(), from = uri, to = %claimed, "Moved file for processing");

        self.state.claimed_count += 1;
        self.state.last_claimed = Some(claimed.clone());
        Ok(claimed)
    }

    fn mark_source_processed(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<()> {
        let target = self.move_into("processed", uri)?;
        tracing::info!(process_id = ctx.id_for_log(), from = uri, to = %target, "Marked file as processed");
        self.state.processed_count += 1;
        Ok(())
    }

    fn mark_source_failed(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<()> {
        let target = self.move_into("failed", uri)?;
        tracing::warn!(process_id = ctx.id_for_log(), from = uri, to = %target, "Marked file as FAILED");
        self.state.failed_count += 1;
        Ok(())
    }
}
