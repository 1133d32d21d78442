//! Configuration for the engine and for individual processes.
//!
//! [`EngineConfig`] selects where processes, locks and the error log live.
//! [`ProcessConfig`] is the typed view of the options a process reads from its
//! own configuration mapping before every run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::budget::parse_duration;
use crate::settings::{deserialize_flag, deserialize_limit};

/// Lock timeout used when `lock_timeout` is absent or unusable.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Engine-wide settings: where state and locks are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one envelope file per process
    pub store_dir: PathBuf,
    /// Directory for lock files (defaults to `<store_dir>/locks`)
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    /// JSON-lines file receiving failed records
    #[serde(default)]
    pub error_log: Option<PathBuf>,
    /// Gzip envelopes on disk
    #[serde(default = "default_compress")]
    pub compress: bool,
    /// Lock files older than this many seconds are taken over
    #[serde(default)]
    pub stale_lock_after_secs: Option<u64>,
}

fn default_compress() -> bool {
    true
}

impl EngineConfig {
    /// Create a configuration storing everything below `./aip`
    pub fn default_local() -> Self {
        Self::with_store_dir("aip")
    }

    pub fn with_store_dir<P: Into<PathBuf>>(store_dir: P) -> Self {
        EngineConfig {
            store_dir: store_dir.into(),
            lock_dir: None,
            error_log: None,
            compress: true,
            stale_lock_after_secs: None,
        }
    }

    /// Effective lock directory
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.store_dir.join("locks"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.store_dir.as_os_str().is_empty() {
            return Err(crate::AipError::validation("store_dir cannot be empty"));
        }
        if let Some(dir) = &self.lock_dir {
            if dir.as_os_str().is_empty() {
                return Err(crate::AipError::validation("lock_dir cannot be empty"));
            }
        }
        if let Some(path) = &self.error_log {
            if path.as_os_str().is_empty() {
                return Err(crate::AipError::validation("error_log cannot be empty"));
            }
        }
        if self.stale_lock_after_secs == Some(0) {
            return Err(crate::AipError::validation(
                "stale_lock_after_secs must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_local()
    }
}

/// Options a process reads from its own configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Skip the per-process lock
    #[serde(deserialize_with = "deserialize_flag")]
    pub parallel_execution: bool,
    /// Seconds or a time expression; see [`ProcessConfig::lock_timeout`]
    #[serde(rename = "lock_timeout")]
    pub lock_timeout_raw: Option<Value>,
    /// Keep going after a record failed
    #[serde(deserialize_with = "deserialize_flag")]
    pub continue_with_failed_record: bool,
    /// Append failed records to the engine's error log
    #[serde(deserialize_with = "deserialize_flag")]
    pub use_aip_error_log: bool,
    pub processing_limit: ProcessingLimit,
    pub log: LogConfig,
}

impl ProcessConfig {
    /// How long to wait for the process lock.
    pub fn lock_timeout(&self) -> Duration {
        match &self.lock_timeout_raw {
            None | Some(Value::Null) => DEFAULT_LOCK_TIMEOUT,
            Some(value) => match parse_duration(value) {
                Ok(timeout) => timeout,
                Err(reason) => {
                    tracing::warn!(
                        lock_timeout = %value,
                        "Unusable lock_timeout ({}), using {}s",
                        reason,
                        DEFAULT_LOCK_TIMEOUT.as_secs()
                    );
                    DEFAULT_LOCK_TIMEOUT
                }
            },
        }
    }
}

/// Budgets bounding one invocation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessingLimit {
    /// Records per invocation; zero or absent means unlimited
    #[serde(deserialize_with = "deserialize_limit")]
    pub record_count: Option<u64>,
    /// Time budget measured from the start of this run
    pub processing_time: Option<Value>,
    /// Time budget measured from the externally supplied invocation start
    #[serde(rename = "php_process_time", alias = "process_time")]
    pub process_time: Option<Value>,
}

/// Per-process logging sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `debug`, `info`, `warning` or `error`
    pub level: Option<String>,
    /// Log file; absent means the host's sink
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn is_configured(&self) -> bool {
        self.level.is_some() || self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Settings;
    use serde_json::json;

    fn parse(value: Value) -> ProcessConfig {
        Settings::from_value(value).unwrap().parse().unwrap()
    }

    #[test]
    fn test_default_local_config() {
        let config = EngineConfig::default_local();
        assert_eq!(config.store_dir, PathBuf::from("aip"));
        assert_eq!(config.lock_dir(), PathBuf::from("aip/locks"));
        assert!(config.compress);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_engine_config() {
        let mut config = EngineConfig::with_store_dir("");
        assert!(config.validate().is_err());

        config.store_dir = PathBuf::from("/var/lib/aip");
        config.stale_lock_after_secs = Some(0);
        assert!(config.validate().is_err());

        config.stale_lock_after_secs = Some(3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_from_json() {
        let config: EngineConfig =
            serde_json::from_value(json!({"store_dir": "/srv/aip"})).unwrap();
        assert!(config.compress);
        assert!(config.lock_dir.is_none());
    }

    #[test]
    fn test_process_config_defaults() {
        let config = parse(json!({}));
        assert!(!config.parallel_execution);
        assert!(!config.continue_with_failed_record);
        assert!(!config.use_aip_error_log);
        assert_eq!(config.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.processing_limit.record_count, None);
        assert!(!config.log.is_configured());
    }

    #[test]
    fn test_process_config_lenient_values() {
        let config = parse(json!({
            "parallel_execution": "1",
            "continue_with_failed_record": 1,
            "use_aip_error_log": "0",
            "lock_timeout": "30",
            "processing_limit": {"record_count": "25", "php_process_time": "2 minutes"},
            "log": {"level": "debug", "file": "/tmp/aip.log"}
        }));
        assert!(config.parallel_execution);
        assert!(config.continue_with_failed_record);
        assert!(!config.use_aip_error_log);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.processing_limit.record_count, Some(25));
        assert_eq!(config.processing_limit.process_time, Some(json!("2 minutes")));
        assert_eq!(config.log.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_zero_record_count_is_unlimited() {
        let config = parse(json!({"processing_limit": {"record_count": 0}}));
        assert_eq!(config.processing_limit.record_count, None);
    }

    #[test]
    fn test_bad_lock_timeout_falls_back() {
        let config = parse(json!({"lock_timeout": "whenever"}));
        assert_eq!(config.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
    }
}
