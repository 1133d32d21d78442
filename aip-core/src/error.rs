/*!
Error types for the AIP core engine.
*/

use std::time::Duration;

use thiserror::Error;

use crate::ProcessId;

/// Result type used throughout the AIP core.
pub type Result<T> = std::result::Result<T, AipError>;

/// Errors that can occur while configuring, running, storing or restoring a process.
#[derive(Error, Debug)]
pub enum AipError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV parsing errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// A component is missing something it needs before processing can start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A source could not be claimed, opened or released
    #[error("Source access error: {0}")]
    SourceAccess(String),

    /// Timeout-class failure while retrieving or processing a record.
    /// The run loop logs these and carries on without counting a failure.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A single record could not be read or processed
    #[error("Record processing failed: {0}")]
    RecordProcessing(String),

    /// The run stopped on a failed record; state has already been persisted
    #[error("Processing of '{source_uri}' aborted due to an exception: {message}")]
    Aborted { source_uri: String, message: String },

    /// The process lock could not be acquired in time
    #[error("Could not acquire lock '{name}' within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    /// A stored process could not be reconstructed
    #[error("Error while loading process [{id}]: {reason}")]
    Restore { id: ProcessId, reason: String },

    /// No process with the given id exists in the store
    #[error("Couldn't find process [{0}]")]
    NotFound(ProcessId),

    /// An insert raced with another writer for the same id
    #[error("Process [{0}] already exists")]
    AlreadyExists(ProcessId),

    /// No constructor is registered for a component class
    #[error("Unknown {role} class '{class}'")]
    UnknownComponent { role: &'static str, class: String },

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid envelope format
    #[error("Invalid envelope format: {0}")]
    InvalidFormat(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AipError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new source access error
    pub fn source_access<S: Into<String>>(msg: S) -> Self {
        Self::SourceAccess(msg.into())
    }

    /// Create a new timeout-class error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new record processing error
    pub fn record<S: Into<String>>(msg: S) -> Self {
        Self::RecordProcessing(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a restore error for the given process
    pub fn restore<S: Into<String>>(id: ProcessId, reason: S) -> Self {
        Self::Restore {
            id,
            reason: reason.into(),
        }
    }

    /// True for failures the run loop tolerates without marking the record failed
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
