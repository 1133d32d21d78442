/*!
# AIP Core Engine

Resumable, checkpointed batch processing.

A [`Process`] owns exactly one [`Finder`], one [`Reader`] and one
[`Processor`]. Each run locates (or resumes) a source, streams records from it
and hands them to the processor until the source is exhausted, a budget runs
out or a record fails. Every component keeps its progress in a JSON state blob
that is persisted after every run, so the next run picks up exactly where the
previous one stopped.

## Architecture

- Ports: [`ProcessStore`], [`LockManager`], [`ErrorLog`] and
  [`CompressionAdapter`] with file-based and in-memory adapters
- Plugins: finders, readers and processors resolved by class tag through the
  [`ComponentRegistry`]
- Orchestration: [`Process::run`] and [`ProcessEngine::run_processes`]

## Usage

```rust,no_run
use aip_core::{create_default_engine, Process};
use serde_json::json;

let engine = create_default_engine("/var/lib/aip")?;

let definition = json!({
    "finder": {"class": "drop_folder", "folder": {
        "inbox": "/data/inbox", "processing": "/data/processing",
        "processed": "/data/processed", "failed": "/data/failed",
        "uploading": "/data/uploading"
    }},
    "reader": {"class": "csv", "csv_separator": ","},
    "processor": {"class": "export", "output": {"file": "/data/out.jsonl"}},
    "process": {"processing_limit": {"record_count": 500}}
});

let mut process = Process::from_definition(engine.registry(), &definition)?;
let id = process.store(&engine)?;

let report = engine.run_process(id)?;
println!("{} records processed in total", report.total_processed);
# Ok::<(), aip_core::AipError>(())
```
*/

pub mod budget;
pub mod component;
pub mod compression;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod error_log;
pub mod finder;
pub mod lock;
pub mod observability;
pub mod process;
pub mod processor;
pub mod reader;
pub mod record;
pub mod registry;
pub mod settings;
pub mod storage;

#[cfg(test)]
mod error_tests;

pub use budget::{Budget, BudgetStop, RunClock};
pub use component::{Component, RunContext};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{EngineConfig, LogConfig, ProcessConfig, ProcessingLimit};
pub use engine::{create_default_engine, create_engine_from_config, BatchReport, ProcessEngine};
pub use envelope::{ProcessEnvelope, ProcessId, ENVELOPE_FORMAT_VERSION};
pub use error::{AipError, Result};
pub use error_log::{ErrorLog, ErrorLogEntry, JsonLinesErrorLog, MemoryErrorLog};
pub use finder::{DropFolderFinder, Finder, StaticFileFinder};
pub use lock::{lock_name, FileLockManager, LockManager, MemoryLockManager, NamedLock};
pub use process::{Process, ProcessState, RunOutcome, RunReport};
pub use processor::{ExportProcessor, NoopProcessor, Processor};
pub use reader::{CsvReader, JsonReader, Reader, ReaderCheckpoint, RecordSource, StreamReader};
pub use record::Record;
pub use registry::ComponentRegistry;
pub use settings::Settings;
pub use storage::{FileProcessStore, MemoryProcessStore, ProcessStore};
