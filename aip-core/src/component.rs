//! What finders, readers and processors have in common.

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::{ProcessId, Result, Settings};

static NO_SETTINGS: Lazy<Settings> = Lazy::new(Settings::new);

/// A configuration + state holder that can be persisted and restored.
///
/// Configuration is fixed for the lifetime of the instance. State is the
/// component's checkpoint; [`Component::state`] serializes it for the
/// process store and the registry constructor turns it back into a component.
pub trait Component: Send {
    /// Stable class tag used to reconstruct the component from the registry.
    fn class(&self) -> &'static str;

    /// Raw configuration, exactly as the component was created with.
    fn configuration(&self) -> &Settings;

    /// Current checkpoint as JSON.
    fn state(&self) -> Result<Value>;

    /// Fail fast if something the component needs is missing or unusable.
    fn verify_configuration(&self, _ctx: &RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Information about the owning process, handed to components on every call.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub process_id: Option<ProcessId>,
    pub process_name: &'a str,
    /// The process's own configuration, for options shared with components
    pub process_config: &'a Settings,
}

impl<'a> RunContext<'a> {
    pub fn new(process_id: Option<ProcessId>, process_name: &'a str, process_config: &'a Settings) -> Self {
        Self {
            process_id,
            process_name,
            process_config,
        }
    }

    /// A context not attached to any process.
    pub fn detached() -> RunContext<'static> {
        RunContext {
            process_id: None,
            process_name: "",
            process_config: &NO_SETTINGS,
        }
    }

    /// Process id for log fields; `0` for transient processes.
    pub fn id_for_log(&self) -> u64 {
        self.process_id.map(ProcessId::get).unwrap_or(0)
    }
}

/// Parse a typed state blob; `null` yields the default state.
pub(crate) fn parse_state<T>(class: &str, state: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if state.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(state)
        .map_err(|e| crate::AipError::invalid_format(format!("state of '{class}': {e}")))
}
