/*!
The persisted form of a process.

One envelope per process id holds the process identity plus two JSON blobs:
`config` and `state`, each an object keyed by `finder`, `reader`, `processor`
and `process`. Component configurations carry their class tag under the
reserved key `class`, which is stripped again on restore.
*/

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{AipError, Result, Settings};

/// Current envelope format version for compatibility tracking
pub const ENVELOPE_FORMAT_VERSION: u8 = 1;

/// Key under which a component's class tag is stored in its config blob
pub const CLASS_KEY: &str = "class";

/// Class tag of the process itself
pub const PROCESS_CLASS: &str = "process";

/// The component slots of an envelope, in storage order.
pub const ROLES: [&str; 4] = ["finder", "reader", "processor", "process"];

/// Identity of a persisted process. Never zero; a process without an id is
/// transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new(id: u64) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = AipError;

    fn from_str(s: &str) -> Result<Self> {
        let id: u64 = s
            .trim()
            .parse()
            .map_err(|_| AipError::validation(format!("'{s}' is not a process id")))?;
        ProcessId::new(id).ok_or_else(|| AipError::validation("process id cannot be 0"))
    }
}

/// Everything the store keeps for one process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessEnvelope {
    pub id: ProcessId,

    /// Human label, not used for identity
    pub name: String,

    #[serde(default)]
    pub documentation: String,

    /// Inactive processes are skipped by batch runs
    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Start of the most recent run
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,

    /// Class tag of the process
    pub class: String,

    /// Component configurations keyed by role
    pub config: Value,

    /// Component states keyed by role
    pub state: Value,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,

    /// SHA-256 over config and state
    pub content_hash: String,

    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ProcessEnvelope {
    /// Create an envelope and compute its content hash
    pub fn new<S: Into<String>>(id: ProcessId, name: S, config: Value, state: Value) -> Self {
        let content_hash = Self::compute_hash(&config, &state);
        Self {
            id,
            name: name.into(),
            documentation: String::new(),
            is_active: true,
            last_run: None,
            class: PROCESS_CLASS.to_string(),
            config,
            state,
            format_version: ENVELOPE_FORMAT_VERSION,
            content_hash,
            updated_at: Utc::now(),
        }
    }

    pub fn with_documentation<S: Into<String>>(mut self, documentation: S) -> Self {
        self.documentation = documentation.into();
        self
    }

    pub fn with_last_run(mut self, last_run: Option<DateTime<Utc>>) -> Self {
        self.last_run = last_run;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// SHA-256 of the serialized config followed by the serialized state
    pub fn compute_hash(config: &Value, state: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(config.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(state.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Check the blobs against the stored hash
    pub fn verify_integrity(&self) -> Result<()> {
        let computed_hash = Self::compute_hash(&self.config, &self.state);
        if computed_hash == self.content_hash {
            Ok(())
        } else {
            Err(AipError::IntegrityCheckFailed {
                expected: self.content_hash.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Structural checks performed before an envelope is restored
    pub fn validate(&self) -> Result<()> {
        if self.class.is_empty() {
            return Err(AipError::validation("class cannot be empty"));
        }
        if !self.is_compatible() {
            return Err(AipError::invalid_format(format!(
                "format version {} is newer than supported version {}",
                self.format_version, ENVELOPE_FORMAT_VERSION
            )));
        }
        let config = self
            .config
            .as_object()
            .ok_or_else(|| AipError::invalid_format("config must be an object"))?;
        if !self.state.is_object() {
            return Err(AipError::invalid_format("state must be an object"));
        }
        for role in ROLES {
            if !config.get(role).is_some_and(Value::is_object) {
                return Err(AipError::invalid_format(format!(
                    "config has no '{role}' section"
                )));
            }
        }
        Ok(())
    }

    /// Check if this envelope is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= ENVELOPE_FORMAT_VERSION
    }

    /// Class tag and configuration (without the tag) stored for `role`
    pub fn component_config(&self, role: &str) -> Result<(String, Settings)> {
        let mut section = self
            .config
            .get(role)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| AipError::invalid_format(format!("config has no '{role}' section")))?;

        let class = match section.remove(CLASS_KEY) {
            Some(Value::String(class)) => class,
            _ if role == "process" => self.class.clone(),
            _ => {
                return Err(AipError::invalid_format(format!(
                    "'{role}' config does not name its class"
                )))
            }
        };
        Ok((class, Settings::from(section)))
    }

    /// State stored for `role`, `null` when absent
    pub fn component_state(&self, role: &str) -> Value {
        self.state.get(role).cloned().unwrap_or(Value::Null)
    }

    /// File name used by file-based stores
    pub fn file_name(id: ProcessId) -> String {
        format!("process-{id}.json")
    }
}

/// A component's configuration with its class tag added, ready for the
/// `config` blob.
pub fn tagged_config(class: &str, config: &Settings) -> Value {
    let mut section: Map<String, Value> = config.as_map().clone();
    section.insert(CLASS_KEY.to_string(), Value::String(class.to_string()));
    Value::Object(section)
}
