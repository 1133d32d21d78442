/*!
End-to-end tests for the AIP engine.
These run processes through the file-based store and lock manager, restoring
them from disk between runs the way a scheduler would.
*/

use aip_core::{
    create_default_engine, create_engine_from_config, AipError, Component, ComponentRegistry,
    EngineConfig, FileLockManager, JsonLinesErrorLog, LockManager, Process, ProcessEngine, ProcessId,
    Processor, Record, RecordSource, Result, RunContext, RunOutcome, Settings, StreamReader,
};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn drop_folders(root: &Path) -> Value {
    let mut folders = serde_json::Map::new();
    for stage in ["uploading", "inbox", "processing", "processed", "failed"] {
        let dir = root.join(stage);
        fs::create_dir_all(&dir).unwrap();
        folders.insert(stage.to_string(), json!(dir));
    }
    json!({"class": "drop_folder", "folder": folders})
}

fn files_in(dir: PathBuf) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn create(engine: &ProcessEngine, definition: Value) -> ProcessId {
    let mut process = Process::from_definition(engine.registry(), &definition).unwrap();
    process.store(engine).unwrap()
}

#[test]
fn test_two_record_csv_resumes_across_invocations() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let store = temp_dir.path().join("store");
    let out = temp_dir.path().join("out.jsonl");

    let id = {
        let engine = create_default_engine(&store).unwrap();
        create(
            &engine,
            json!({
                "name": "contacts",
                "finder": drop_folders(&data),
                "reader": {"class": "csv"},
                "processor": {"class": "export", "output": {"file": out}},
                "process": {"processing_limit": {"record_count": 1}},
            }),
        )
    };
    fs::write(data.join("inbox/contacts.csv"), "name;email\nAda;ada@example.org\nGrace;grace@example.org\n").unwrap();

    // every invocation gets a fresh engine, as a cron job would
    let first = create_default_engine(&store).unwrap().run_process(id).unwrap();
    assert_eq!(first.outcome, RunOutcome::Suspended);
    assert_eq!(first.total_processed, 1);
    assert_eq!(files_in(data.join("processing")).len(), 1);

    let second = create_default_engine(&store).unwrap().run_process(id).unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.session_processed, 1);
    assert_eq!(second.total_processed, 2);

    let engine = create_default_engine(&store).unwrap();
    let process = engine.load_process(id).unwrap();
    let finder_state = process.finder().state().unwrap();
    assert_eq!(finder_state["processed_count"], json!(1));
    assert_eq!(finder_state["claimed_count"], json!(1));
    assert_eq!(process.reader().processed_count(), 2);
    assert_eq!(files_in(data.join("processed")).len(), 1);

    let exported = aip_core::processor::export::read_exported(&out).unwrap();
    assert_eq!(
        exported,
        vec![
            json!({"name": "Ada", "email": "ada@example.org"}),
            json!({"name": "Grace", "email": "grace@example.org"}),
        ]
    );
}

/// Fails every record
struct RejectingProcessor {
    configuration: Settings,
    last_record: Option<Record>,
}

impl Component for RejectingProcessor {
    fn class(&self) -> &'static str {
        "rejecting"
    }

    fn configuration(&self) -> &Settings {
        &self.configuration
    }

    fn state(&self) -> Result<Value> {
        Ok(json!({}))
    }
}

impl Processor for RejectingProcessor {
    fn process_record(&mut self, _ctx: &RunContext<'_>, record: &Record) -> Result<()> {
        self.last_record = Some(record.clone());
        Err(AipError::record("remote API refused the record"))
    }

    fn last_record(&self) -> Option<&Record> {
        self.last_record.as_ref()
    }
}

#[test]
fn test_always_failing_processor_aborts() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let errors = temp_dir.path().join("errors.jsonl");

    let mut registry = ComponentRegistry::default();
    registry.register_processor("rejecting", |configuration, _state| {
        Ok(Box::new(RejectingProcessor {
            configuration,
            last_record: None,
        }))
    });
    let mut config = EngineConfig::with_store_dir(temp_dir.path().join("store"));
    config.error_log = Some(errors.clone());
    let engine = create_engine_from_config(config).unwrap().with_registry(registry);

    let id = create(
        &engine,
        json!({
            "finder": drop_folders(&data),
            "reader": {"class": "csv"},
            "processor": {"class": "rejecting"},
            "process": {"use_aip_error_log": "1"},
        }),
    );
    fs::write(data.join("inbox/a.csv"), "id\n1\n2\n").unwrap();

    let err = engine.run_process(id).unwrap_err();
    assert!(matches!(err, AipError::Aborted { .. }));
    assert!(err.to_string().contains("remote API refused the record"));

    let process = engine.load_process(id).unwrap();
    assert_eq!(process.reader().processed_count(), 0);
    assert_eq!(process.reader().failed_count(), 1);
    assert_eq!(process.reader().current_source(), None);
    assert_eq!(process.finder().state().unwrap()["failed_count"], json!(1));
    assert_eq!(files_in(data.join("failed")).len(), 1);

    let entries = JsonLinesErrorLog::new(&errors).read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].process_id, Some(id));
    assert_eq!(entries[0].data, r#"{"id":"1"}"#);
}

/// Counts upwards forever
struct EndlessSource {
    next: u64,
}

impl RecordSource for EndlessSource {
    const CLASS: &'static str = "endless";

    fn from_settings(_configuration: &Settings) -> Result<Self> {
        Ok(Self { next: 0 })
    }

    fn can_read(&self, uri: &str) -> bool {
        uri == "endless://numbers"
    }

    fn open(&mut self, _uri: &str) -> Result<()> {
        self.next = 0;
        Ok(())
    }

    fn read_record(&mut self) -> Option<Result<Record>> {
        self.next += 1;
        Some(Ok(Record::from_fields([("n", self.next.to_string())])))
    }

    fn close(&mut self) {}
}

#[test]
fn test_infinite_source_stops_on_processing_time() {
    let temp_dir = TempDir::new().unwrap();
    let mut engine = create_default_engine(temp_dir.path()).unwrap();
    engine.registry_mut().register_reader(EndlessSource::CLASS, |config, state| {
        Ok(Box::new(StreamReader::<EndlessSource>::new(config, state)?))
    });

    // the reader already holds the source, so no finder is consulted
    let reader_state = json!({"current_file": "endless://numbers", "processed_count": 0, "failed_count": 0});
    let finder_path = temp_dir.path().join("unused.txt");
    let mut process = Process::new(
        "endless",
        Settings::from_value(json!({"processing_limit": {"processing_time": 0.01}})).unwrap(),
        engine
            .registry()
            .build_finder("static_file", Settings::from_value(json!({"path": finder_path})).unwrap(), Value::Null)
            .unwrap(),
        engine
            .registry()
            .build_reader("endless", Settings::new(), reader_state)
            .unwrap(),
        engine
            .registry()
            .build_processor("noop", Settings::new(), Value::Null)
            .unwrap(),
    );

    let started = Instant::now();
    let report = process.run(&engine).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, RunOutcome::Suspended);
    assert!(report.session_processed > 0);
    assert_eq!(report.source.as_deref(), Some("endless://numbers"));

    let id = process.id().unwrap();
    let restored = engine.load_process(id).unwrap();
    assert_eq!(restored.reader().current_source(), Some("endless://numbers"));
    assert_eq!(restored.reader().processed_count(), report.total_processed);

    // the next invocation resumes the same source instead of asking the finder
    let next = engine.run_process(id).unwrap();
    assert_eq!(next.source.as_deref(), Some("endless://numbers"));
    assert!(next.total_processed >= report.total_processed);
}

#[test]
fn test_invocation_time_budget_is_shared_across_runs() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let engine = create_default_engine(temp_dir.path().join("store"))
        .unwrap()
        .with_invocation_started(Instant::now() - Duration::from_secs(120));

    let id = create(
        &engine,
        json!({
            "finder": drop_folders(&data),
            "reader": {"class": "csv"},
            "processor": {"class": "noop"},
            "process": {"processing_limit": {"php_process_time": "1 min"}},
        }),
    );
    fs::write(data.join("inbox/a.csv"), "id\n1\n2\n").unwrap();

    let report = engine.run_process(id).unwrap();
    assert_eq!(report.outcome, RunOutcome::Suspended);
    assert_eq!(report.session_processed, 0);
}

#[test]
fn test_concurrent_runs_are_mutually_exclusive() {
    let temp_dir = TempDir::new().unwrap();
    let store = temp_dir.path().join("store");
    let slow_file = temp_dir.path().join("slow.csv");
    let rows: String = (0..200).map(|i| format!("{i}\n")).collect();
    fs::write(&slow_file, format!("n\n{rows}")).unwrap();

    let id = {
        let engine = create_default_engine(&store).unwrap();
        create(
            &engine,
            json!({
                "finder": {"class": "static_file", "path": slow_file},
                "reader": {"class": "csv"},
                "processor": {"class": "noop"},
                "process": {"lock_timeout": "100ms"},
            }),
        )
    };

    // hold the process lock from another thread, as a running invocation would
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let lock_dir = store.join("locks");
    let holder = thread::spawn(move || {
        let locks = FileLockManager::new(&lock_dir);
        let mut lock = locks.create_lock(&aip_core::lock_name(id));
        assert!(lock.acquire(Duration::from_secs(1)).unwrap());
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        lock.release().unwrap();
    });
    locked_rx.recv().unwrap();

    let engine = create_default_engine(&store).unwrap();
    let err = engine.run_process(id).unwrap_err();
    assert!(matches!(err, AipError::LockTimeout { .. }));
    assert_eq!(engine.load_process(id).unwrap().state().runs, 0);

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    let report = engine.run_process(id).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.total_processed, 200);
}

#[test]
fn test_handle_loaded_before_another_run_does_not_repeat_records() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let store = temp_dir.path().join("store");
    let out = temp_dir.path().join("out.jsonl");

    let engine = create_default_engine(&store).unwrap();
    let id = create(
        &engine,
        json!({
            "finder": drop_folders(&data),
            "reader": {"class": "csv"},
            "processor": {"class": "export", "output": {"file": out}},
            "process": {"processing_limit": {"record_count": 1}},
        }),
    );
    fs::write(data.join("inbox/names.csv"), "name\nX\nY\n").unwrap();

    // loaded by one invocation while another one runs to completion
    let mut late = engine.load_process(id).unwrap();
    let first = create_default_engine(&store).unwrap().run_process(id).unwrap();
    assert_eq!(first.outcome, RunOutcome::Suspended);

    let second = late.run(&engine).unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.session_processed, 1);
    assert_eq!(second.total_processed, 2);

    let exported = aip_core::processor::export::read_exported(&out).unwrap();
    assert_eq!(exported, vec![json!({"name": "X"}), json!({"name": "Y"})]);
}

/// Writes record names to `file`, timing out once on the record named `flaky`
struct FlakyProcessor {
    configuration: Settings,
    timed_out: bool,
    last_record: Option<Record>,
}

impl FlakyProcessor {
    fn new(configuration: Settings, state: Value) -> Result<Self> {
        Ok(Self {
            configuration,
            timed_out: state["timed_out"].as_bool().unwrap_or(false),
            last_record: None,
        })
    }
}

impl Component for FlakyProcessor {
    fn class(&self) -> &'static str {
        "flaky"
    }

    fn configuration(&self) -> &Settings {
        &self.configuration
    }

    fn state(&self) -> Result<Value> {
        Ok(json!({"timed_out": self.timed_out}))
    }
}

impl Processor for FlakyProcessor {
    fn process_record(&mut self, _ctx: &RunContext<'_>, record: &Record) -> Result<()> {
        self.last_record = Some(record.clone());
        let name = record.get_str("name").unwrap_or_default();
        if !self.timed_out && self.configuration.get_str("flaky") == Some(name) {
            self.timed_out = true;
            return Err(AipError::timeout(format!("no answer for {name}")));
        }

        let path = self.configuration.get_str("file").unwrap_or_default();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{name}")?;
        Ok(())
    }

    fn last_record(&self) -> Option<&Record> {
        self.last_record.as_ref()
    }
}

#[test]
fn test_timed_out_record_is_handled_exactly_once() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let out = temp_dir.path().join("names.txt");

    let mut engine = create_default_engine(temp_dir.path().join("store")).unwrap();
    engine
        .registry_mut()
        .register_processor("flaky", |config, state| Ok(Box::new(FlakyProcessor::new(config, state)?)));
    let id = create(
        &engine,
        json!({
            "finder": drop_folders(&data),
            "reader": {"class": "csv"},
            "processor": {"class": "flaky", "file": out, "flaky": "B"},
            "process": {"processing_limit": {"record_count": 2}},
        }),
    );
    fs::write(data.join("inbox/names.csv"), "name\nA\nB\nC\nD\n").unwrap();

    let outcomes: Vec<RunOutcome> = (0..3).map(|_| engine.run_process(id).unwrap().outcome).collect();
    assert_eq!(
        outcomes,
        vec![RunOutcome::Suspended, RunOutcome::Suspended, RunOutcome::Completed]
    );
    assert_eq!(fs::read_to_string(&out).unwrap(), "A\nB\nC\nD\n");

    let process = engine.load_process(id).unwrap();
    assert_eq!(process.reader().processed_count(), 4);
    assert_eq!(process.reader().failed_count(), 0);
    assert_eq!(files_in(data.join("processed")).len(), 1);
}

#[test]
fn test_store_and_restore_roundtrip_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("data");
    let store = temp_dir.path().join("store");
    let definition = json!({
        "name": "roundtrip",
        "documentation": "Imports contacts",
        "finder": drop_folders(&data),
        "reader": {"class": "csv", "csv_separator": ",", "csv_string_encoding": "UTF-8"},
        "processor": {"class": "export", "output": {"file": temp_dir.path().join("out.jsonl")},
                      "parameter_mapping": {"mail": "email"}, "trim_parameters": "all"},
        "process": {"continue_with_failed_record": false, "extension": {"deep": {"value": null}}},
    });

    let engine = create_default_engine(&store).unwrap();
    let mut process = Process::from_definition(engine.registry(), &definition).unwrap();
    let id = process.store(&engine).unwrap();

    let restored = create_default_engine(&store).unwrap().load_process(id).unwrap();
    assert_eq!(restored.id(), Some(id));
    assert_eq!(restored.name(), "roundtrip");
    assert_eq!(restored.documentation(), "Imports contacts");
    assert_eq!(restored.configuration(), process.configuration());
    assert_eq!(restored.configuration().get("extension/deep/value"), Some(&Value::Null));
    assert_eq!(restored.configuration().get("extension/deep/missing"), None);
    assert_eq!(restored.finder().configuration(), process.finder().configuration());
    assert_eq!(restored.reader().configuration(), process.reader().configuration());
    assert_eq!(restored.processor().configuration(), process.processor().configuration());
    assert_eq!(restored.reader().state().unwrap(), process.reader().state().unwrap());

    let on_disk = engine.store().load(id).unwrap();
    assert_eq!(on_disk.config["reader"]["class"], json!("csv"));
    assert_eq!(on_disk.config["process"]["class"], json!("process"));
    assert!(store.join("process-1.json.gz").exists());
}

#[test]
fn test_batch_run_reports_per_process() {
    let temp_dir = TempDir::new().unwrap();
    let engine = create_default_engine(temp_dir.path().join("store")).unwrap();

    let mut ids = Vec::new();
    for (i, rows) in [3, 5].iter().enumerate() {
        let file = temp_dir.path().join(format!("source-{i}.json"));
        let records: Vec<Value> = (0..*rows).map(|n| json!({"n": n})).collect();
        fs::write(&file, serde_json::to_string(&records).unwrap()).unwrap();
        ids.push(create(
            &engine,
            json!({
                "finder": {"class": "static_file", "path": file, "detect_changes": true},
                "reader": {"class": "json"},
                "processor": {"class": "noop"},
            }),
        ));
    }

    let mut requested: Vec<String> = ids.iter().map(ProcessId::to_string).collect();
    requested.push("not-a-number".to_string());
    requested.push("77".to_string());

    let batch = engine.run_processes(&requested);
    assert_eq!(batch.runs.len(), 2);
    assert_eq!(batch.skipped, vec!["not-a-number", "77"]);
    assert_eq!(batch.session_processed(), 8);
    assert_eq!(batch.total_processed(), 8);

    // nothing changed, so nothing to do
    let again = engine.run_processes(&requested);
    assert_eq!(again.session_processed(), 0);
    assert!(again
        .runs
        .iter()
        .all(|(_, result)| result.as_ref().unwrap().outcome == RunOutcome::NoSource));
}
