//! Readers turn a claimed source into a resumable stream of records.
//!
//! A reader keeps a checkpoint of the source it is working on and how many of
//! its records have been accounted for. Re-initialising a reader with the
//! same source skips exactly that many records, which is what makes a process
//! resumable across runs and restarts.
//!
//! All built-in readers are a [`StreamReader`] over a [`RecordSource`]; the
//! source only knows how to open a file and produce records, the stream
//! reader does the checkpointing.

pub mod csv;
pub mod json;

pub use self::csv::{CsvReader, CsvSource};
pub use self::json::{JsonReader, JsonSource};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::parse_state;
use crate::{AipError, Component, Record, Result, Settings};

pub trait Reader: Component {
    /// Existence, permission and type check. `false` means the source must
    /// not be claimed.
    fn can_read_source(&self, uri: &str) -> bool;

    /// Open `uri`, resuming if it is the source in the checkpoint and
    /// starting over otherwise. Buffers the first record to return.
    fn initialise_with_source(&mut self, uri: &str) -> Result<()>;

    /// Whether a record is buffered. Never performs I/O.
    fn has_more_records(&self) -> bool;

    /// Return the buffered record and buffer the one after it. `Ok(None)`
    /// at the end of the source; `Err` if the buffered record could not be
    /// read.
    fn next_record(&mut self) -> Result<Option<Record>>;

    fn mark_last_record_processed(&mut self);

    fn mark_last_record_failed(&mut self);

    /// Forget the current source so that the next initialisation starts over.
    fn mark_source_processed(&mut self, uri: &str);

    /// Forget the current source so that the next initialisation starts over.
    fn mark_source_failed(&mut self, uri: &str);

    /// Source being worked on, if a run was interrupted mid-source
    fn current_source(&self) -> Option<&str>;

    /// Records of the current source processed, across runs
    fn processed_count(&self) -> u64;

    /// Records of the current source failed, across runs
    fn failed_count(&self) -> u64;

    fn record_count(&self) -> u64 {
        self.processed_count() + self.failed_count()
    }

    /// Records processed since [`Reader::start_session`]
    fn session_processed_count(&self) -> u64;

    /// Records failed since [`Reader::start_session`]
    fn session_failed_count(&self) -> u64;

    fn session_record_count(&self) -> u64 {
        self.session_processed_count() + self.session_failed_count()
    }

    /// Reset the session counters; called at the start of every run.
    fn start_session(&mut self);
}

pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted progress of a reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderCheckpoint {
    pub version: u32,
    pub current_file: Option<String>,
    pub processed_count: u64,
    pub failed_count: u64,
}

impl Default for ReaderCheckpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            current_file: None,
            processed_count: 0,
            failed_count: 0,
        }
    }
}

impl ReaderCheckpoint {
    fn starting(uri: &str) -> Self {
        Self {
            current_file: Some(uri.to_string()),
            ..Self::default()
        }
    }
}

/// Produces records from one kind of file
pub trait RecordSource: Send + Sized {
    /// Class tag of the reader built on this source
    const CLASS: &'static str;

    fn from_settings(configuration: &Settings) -> Result<Self>;

    fn can_read(&self, uri: &str) -> bool;

    /// Open `uri`, positioned before the first record
    fn open(&mut self, uri: &str) -> Result<()>;

    /// The next record, `None` at the end
    fn read_record(&mut self) -> Option<Result<Record>>;

    fn close(&mut self);
}

enum Lookahead {
    Empty,
    Record(Record),
    Failed(AipError),
}

/// Checkpointing reader over any [`RecordSource`]
pub struct StreamReader<S: RecordSource> {
    configuration: Settings,
    source: S,
    checkpoint: ReaderCheckpoint,
    lookahead: Lookahead,
    session_processed: u64,
    session_failed: u64,
}

impl<S: RecordSource> StreamReader<S> {
    pub fn new(configuration: Settings, state: Value) -> Result<Self> {
        let source = S::from_settings(&configuration)?;
        let checkpoint: ReaderCheckpoint = parse_state(S::CLASS, state)?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(AipError::invalid_format(format!(
                "reader checkpoint version {} is not supported",
                checkpoint.version
            )));
        }
        Ok(Self {
            configuration,
            source,
            checkpoint,
            lookahead: Lookahead::Empty,
            session_processed: 0,
            session_failed: 0,
        })
    }

    pub fn checkpoint(&self) -> &ReaderCheckpoint {
        &self.checkpoint
    }

    fn advance(&mut self) {
        self.lookahead = match self.source.read_record() {
            None => Lookahead::Empty,
            Some(Ok(record)) => Lookahead::Record(record),
            Some(Err(e)) => Lookahead::Failed(e),
        };
    }

    fn release_source(&mut self) {
        self.checkpoint.current_file = None;
        self.lookahead = Lookahead::Empty;
        self.source.close();
    }
}

impl<S: RecordSource> Component for StreamReader<S> {
    fn class(&self) -> &'static str {
        S::CLASS
    }

    fn configuration(&self) -> &Settings {
        &self.configuration
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.checkpoint)?)
    }
}

impl<S: RecordSource> Reader for StreamReader<S> {
    fn can_read_source(&self, uri: &str) -> bool {
        self.source.can_read(uri)
    }

    fn initialise_with_source(&mut self, uri: &str) -> Result<()> {
        self.source.close();
        self.source.open(uri)?;

        if self.checkpoint.current_file.as_deref() == Some(uri) {
            let skip = self.checkpoint.processed_count + self.checkpoint.failed_count;
            let mut skipped = 0;
            while skipped < skip {
                if self.source.read_record().is_none() {
                    tracing::warn!(source = uri, skip, skipped, "Source is shorter than its checkpoint");
                    break;
                }
                skipped += 1;
            }
            tracing::debug!(source = uri, skipped, "Resumed processing source");
        } else {
            self.checkpoint = ReaderCheckpoint::starting(uri);
            tracing::debug!(source = uri, "Started processing source");
        }

        self.advance();
        Ok(())
    }

    fn has_more_records(&self) -> bool {
        !matches!(self.lookahead, Lookahead::Empty)
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        match std::mem::replace(&mut self.lookahead, Lookahead::Empty) {
            Lookahead::Empty => Ok(None),
            Lookahead::Record(record) => {
                self.advance();
                Ok(Some(record))
            }
            Lookahead::Failed(e) => {
                self.advance();
                Err(e)
            }
        }
    }

    fn mark_last_record_processed(&mut self) {
        self.checkpoint.processed_count += 1;
        self.session_processed += 1;
    }

    fn mark_last_record_failed(&mut self) {
        self.checkpoint.failed_count += 1;
        self.session_failed += 1;
    }

    fn mark_source_processed(&mut self, uri: &str) {
        tracing::debug!(source = uri, "Source processed");
        self.release_source();
    }

    fn mark_source_failed(&mut self, uri: &str) {
        tracing::debug!(source = uri, "Source failed");
        self.release_source();
    }

    fn current_source(&self) -> Option<&str> {
        self.checkpoint.current_file.as_deref()
    }

    fn processed_count(&self) -> u64 {
        self.checkpoint.processed_count
    }

    fn failed_count(&self) -> u64 {
        self.checkpoint.failed_count
    }

    fn session_processed_count(&self) -> u64 {
        self.session_processed
    }

    fn session_failed_count(&self) -> u64 {
        self.session_failed
    }

    fn start_session(&mut self) {
        self.session_processed = 0;
        self.session_failed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Numbers `0..len` from a "file" named by its length, e.g. `mem://5`.
    /// Multiples of `fail_every` cannot be read.
    struct CountingSource {
        len: u64,
        next: u64,
        fail_every: Option<u64>,
    }

    impl RecordSource for CountingSource {
        const CLASS: &'static str = "counting";

        fn from_settings(configuration: &Settings) -> Result<Self> {
            Ok(Self {
                len: 0,
                next: 0,
                fail_every: configuration.get("fail_every").and_then(Value::as_u64),
            })
        }

        fn can_read(&self, uri: &str) -> bool {
            uri.starts_with("mem://")
        }

        fn open(&mut self, uri: &str) -> Result<()> {
            self.len = uri
                .trim_start_matches("mem://")
                .parse()
                .map_err(|_| AipError::source_access(uri))?;
            self.next = 0;
            Ok(())
        }

        fn read_record(&mut self) -> Option<Result<Record>> {
            if self.next >= self.len {
                return None;
            }
            let n = self.next;
            self.next += 1;
            if self.fail_every.is_some_and(|every| n > 0 && n % every == 0) {
                return Some(Err(AipError::record(format!("unreadable row {n}"))));
            }
            Some(Ok(Record::from_fields([("n", n.to_string())])))
        }

        fn close(&mut self) {
            self.len = 0;
        }
    }

    fn reader(state: Value) -> StreamReader<CountingSource> {
        StreamReader::new(Settings::new(), state).unwrap()
    }

    fn value_of(record: Option<Record>) -> String {
        record.unwrap().get_str("n").unwrap().to_string()
    }

    #[test]
    fn test_lookahead_and_end_of_source() {
        let mut reader = reader(Value::Null);
        assert!(!reader.has_more_records());
        assert!(reader.next_record().unwrap().is_none());

        reader.initialise_with_source("mem://2").unwrap();
        assert!(reader.has_more_records());
        assert_eq!(value_of(reader.next_record().unwrap()), "0");
        assert!(reader.has_more_records());
        assert_eq!(value_of(reader.next_record().unwrap()), "1");
        assert!(!reader.has_more_records());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_resume_skips_accounted_records() {
        let mut first = reader(Value::Null);
        first.initialise_with_source("mem://10").unwrap();
        for _ in 0..3 {
            first.next_record().unwrap();
            first.mark_last_record_processed();
        }
        first.next_record().unwrap();
        first.mark_last_record_failed();

        // a fresh reader built only from the persisted state
        let mut resumed = reader(first.state().unwrap());
        assert_eq!(resumed.current_source(), Some("mem://10"));
        resumed.initialise_with_source("mem://10").unwrap();
        assert_eq!(value_of(resumed.next_record().unwrap()), "4");
        assert_eq!(resumed.processed_count(), 3);
        assert_eq!(resumed.failed_count(), 1);
    }

    #[test]
    fn test_new_source_resets_checkpoint() {
        let mut reader = reader(json!({"current_file": "mem://10", "processed_count": 5}));
        reader.initialise_with_source("mem://3").unwrap();
        assert_eq!(reader.processed_count(), 0);
        assert_eq!(reader.current_source(), Some("mem://3"));
        assert_eq!(value_of(reader.next_record().unwrap()), "0");
    }

    #[test]
    fn test_checkpoint_beyond_end_of_source() {
        let mut reader = reader(json!({"current_file": "mem://2", "processed_count": 5}));
        reader.initialise_with_source("mem://2").unwrap();
        assert!(!reader.has_more_records());
    }

    #[test]
    fn test_mark_source_processed_forgets_source() {
        let mut reader = reader(Value::Null);
        reader.initialise_with_source("mem://1").unwrap();
        reader.next_record().unwrap();
        reader.mark_last_record_processed();
        reader.mark_source_processed("mem://1");
        assert_eq!(reader.current_source(), None);
        assert_eq!(reader.processed_count(), 1);

        // the same uri again is a new source
        reader.initialise_with_source("mem://1").unwrap();
        assert_eq!(reader.processed_count(), 0);
        assert!(reader.has_more_records());
    }

    #[test]
    fn test_unreadable_record_is_reported_once() {
        let mut reader: StreamReader<CountingSource> =
            StreamReader::new(Settings::from_value(json!({"fail_every": 2})).unwrap(), Value::Null).unwrap();
        reader.initialise_with_source("mem://4").unwrap();

        assert_eq!(value_of(reader.next_record().unwrap()), "0");
        assert_eq!(value_of(reader.next_record().unwrap()), "1");
        assert!(reader.next_record().is_err());
        assert_eq!(value_of(reader.next_record().unwrap()), "3");
    }

    #[test]
    fn test_counter_invariants() {
        let mut reader = reader(json!({"current_file": "mem://20", "processed_count": 4, "failed_count": 1}));
        reader.start_session();
        reader.initialise_with_source("mem://20").unwrap();
        for i in 0..6 {
            reader.next_record().unwrap();
            if i % 3 == 0 {
                reader.mark_last_record_failed();
            } else {
                reader.mark_last_record_processed();
            }
            assert_eq!(reader.record_count(), reader.processed_count() + reader.failed_count());
            assert!(reader.session_processed_count() <= reader.processed_count());
        }
        assert_eq!(reader.session_record_count(), 6);
        assert_eq!(reader.record_count(), 11);

        reader.start_session();
        assert_eq!(reader.session_record_count(), 0);
        assert_eq!(reader.record_count(), 11);
    }

    #[test]
    fn test_newer_checkpoint_version_is_rejected() {
        let result = StreamReader::<CountingSource>::new(Settings::new(), json!({"version": 99}));
        assert!(result.is_err());
    }
}
