//! Durable record of individual record failures.
//!
//! Entries are written when a process has `use_aip_error_log` set. The engine
//! only ever appends; resolving entries is left to operators.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AipError, ProcessId, Record, Result};

/// One failed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    /// Owning process; `None` for transient processes
    pub process_id: Option<ProcessId>,
    pub error_timestamp: DateTime<Utc>,
    pub error_message: String,
    /// The record as a JSON mapping
    pub data: String,
    pub is_resolved: bool,
}

impl ErrorLogEntry {
    pub fn new<S: Into<String>>(process_id: Option<ProcessId>, error_message: S, record: &Record) -> Self {
        Self {
            process_id,
            error_timestamp: Utc::now(),
            error_message: error_message.into(),
            data: record.to_json(),
            is_resolved: false,
        }
    }
}

/// Append-only sink for [`ErrorLogEntry`]s
#[cfg_attr(test, mockall::automock)]
pub trait ErrorLog: Send + Sync {
    fn append(&self, entry: &ErrorLogEntry) -> Result<()>;
}

/// One JSON object per line in a file
#[derive(Debug)]
pub struct JsonLinesErrorLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesErrorLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all entries back, e.g. for operators' tooling
    pub fn read_entries(&self) -> Result<Vec<ErrorLogEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AipError::from))
            .collect()
    }
}

impl ErrorLog for JsonLinesErrorLog {
    fn append(&self, entry: &ErrorLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AipError::storage("error log lock poisoned"))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Entries kept in memory, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryErrorLog {
    entries: Arc<Mutex<Vec<ErrorLogEntry>>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl ErrorLog for MemoryErrorLog {
    fn append(&self, entry: &ErrorLogEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AipError::storage("error log lock poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}
