//! Processors apply the side effect for each record.
//!
//! A processor signals failure by returning an error. Errors for which
//! [`AipError::is_timeout`](crate::AipError::is_timeout) holds are treated as
//! transient by the run loop; everything else marks the record failed. The
//! core never retries a record itself.

pub mod export;

pub use export::ExportProcessor;

use serde_json::{json, Value};

use crate::{Component, Record, Result, RunContext, Settings};

pub trait Processor: Component {
    fn process_record(&mut self, ctx: &RunContext<'_>, record: &Record) -> Result<()>;

    /// The record most recently handed to [`Processor::process_record`]
    fn last_record(&self) -> Option<&Record>;
}

/// Accepts every record and does nothing with it
pub struct NoopProcessor {
    configuration: Settings,
    last_record: Option<Record>,
}

impl NoopProcessor {
    pub const CLASS: &'static str = "noop";

    pub fn new(configuration: Settings, _state: Value) -> Result<Self> {
        Ok(Self {
            configuration,
            last_record: None,
        })
    }
}

impl Component for NoopProcessor {
    fn class(&self) -> &'static str {
        Self::CLASS
    }

    fn configuration(&self) -> &Settings {
        &self.configuration
    }

    fn state(&self) -> Result<Value> {
        Ok(json!({}))
    }
}

impl Processor for NoopProcessor {
    fn process_record(&mut self, ctx: &RunContext<'_>, record: &Record) -> Result<()> {
        tracing::trace!(process_id = ctx.id_for_log(), record = %record.to_json(), "Skipping record");
        self.last_record = Some(record.clone());
        Ok(())
    }

    fn last_record(&self) -> Option<&Record> {
        self.last_record.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_remembers_last_record() {
        let mut processor = NoopProcessor::new(Settings::new(), Value::Null).unwrap();
        assert!(processor.last_record().is_none());

        let ctx = RunContext::detached();
        processor.process_record(&ctx, &Record::from_fields([("id", "1")])).unwrap();
        processor.process_record(&ctx, &Record::from_fields([("id", "2")])).unwrap();
        assert_eq!(processor.last_record().and_then(|r| r.get_str("id")), Some("2"));
        assert_eq!(processor.class(), "noop");
    }
}
