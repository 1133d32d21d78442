/*!
The process: one finder, one reader and one processor, run as a unit.

A run locks the process, resumes the reader's current source or claims a new
one, feeds records to the processor until the source is exhausted, a budget
runs out or a record fails, and then persists every component's state. The
persisted envelope is all a later run needs to continue where this one
stopped.
*/

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::budget::{Budget, BudgetStop, RunClock};
use crate::component::parse_state;
use crate::config::ProcessConfig;
use crate::envelope::{tagged_config, ProcessEnvelope, CLASS_KEY, PROCESS_CLASS};
use crate::lock::{lock_name, NamedLock};
use crate::observability::LogSink;
use crate::{
    AipError, ComponentRegistry, ErrorLogEntry, Finder, ProcessEngine, ProcessId, ProcessStore,
    Processor, Reader, Record, Result, RunContext, Settings,
};

/// Attempts at finding a free id when two writers race for the same one
const MAX_ID_ATTEMPTS: usize = 16;

/// How a run ended, when it did not end in an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The source was read to the end and marked processed
    Completed,
    /// A budget ran out; the source stays claimed for the next run
    Suspended,
    /// The finder had nothing to offer
    NoSource,
    /// The reader cannot read the source that was found
    Unreadable,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Suspended => "suspended",
            RunOutcome::NoSource => "no_source",
            RunOutcome::Unreadable => "unreadable",
        })
    }
}

/// Result of one [`Process::run`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub process_id: Option<ProcessId>,
    pub outcome: RunOutcome,
    /// The source worked on, if any
    pub source: Option<String>,
    /// Set when the run was suspended by a budget
    #[serde(skip)]
    pub stopped_by: Option<BudgetStop>,
    /// Records of the source processed across all runs
    pub total_processed: u64,
    /// Records of the source failed across all runs
    pub total_failed: u64,
    pub session_processed: u64,
    pub session_failed: u64,
}

/// The process's own checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessState {
    pub runs: u64,
    pub last_outcome: Option<String>,
}

struct Execution {
    outcome: RunOutcome,
    source: Option<String>,
    stopped_by: Option<BudgetStop>,
}

impl Execution {
    fn ended(outcome: RunOutcome, source: Option<String>) -> Self {
        Self {
            outcome,
            source,
            stopped_by: None,
        }
    }
}

pub struct Process {
    id: Option<ProcessId>,
    name: String,
    documentation: String,
    is_active: bool,
    last_run: Option<DateTime<Utc>>,
    configuration: Settings,
    state: ProcessState,
    finder: Box<dyn Finder>,
    reader: Box<dyn Reader>,
    processor: Box<dyn Processor>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finder", &self.finder.class())
            .field("reader", &self.reader.class())
            .field("processor", &self.processor.class())
            .finish()
    }
}

impl Process {
    /// A transient process; it gets an id the first time it is stored.
    pub fn new<S: Into<String>>(
        name: S,
        configuration: Settings,
        finder: Box<dyn Finder>,
        reader: Box<dyn Reader>,
        processor: Box<dyn Processor>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            documentation: String::new(),
            is_active: true,
            last_run: None,
            configuration,
            state: ProcessState::default(),
            finder,
            reader,
            processor,
        }
    }

    /// Build a transient process from a definition such as
    ///
    /// ```json
    /// {
    ///   "name": "contacts",
    ///   "finder": {"class": "static_file", "path": "/data/contacts.csv"},
    ///   "reader": {"class": "csv"},
    ///   "processor": {"class": "noop"},
    ///   "process": {"processing_limit": {"record_count": 100}}
    /// }
    /// ```
    ///
    /// `process` and `name` may be omitted.
    pub fn from_definition(registry: &ComponentRegistry, definition: &Value) -> Result<Self> {
        let definition = definition
            .as_object()
            .ok_or_else(|| AipError::validation("process definition must be an object"))?;

        let finder = {
            let (class, config) = definition_section(definition, "finder")?;
            registry.build_finder(&class, config, Value::Null)?
        };
        let reader = {
            let (class, config) = definition_section(definition, "reader")?;
            registry.build_reader(&class, config, Value::Null)?
        };
        let processor = {
            let (class, config) = definition_section(definition, "processor")?;
            registry.build_processor(&class, config, Value::Null)?
        };
        let configuration = match definition.get("process") {
            None => Settings::new(),
            Some(process) => {
                let mut settings = Settings::from_value(process.clone())?;
                settings.remove(CLASS_KEY);
                settings
            }
        };
        configuration.parse::<ProcessConfig>()?;

        let name = definition.get("name").and_then(Value::as_str).unwrap_or_default();
        let mut process = Process::new(name, configuration, finder, reader, processor);
        if let Some(documentation) = definition.get("documentation").and_then(Value::as_str) {
            process.documentation = documentation.to_string();
        }
        Ok(process)
    }

    /// Load process `id` and rebuild its components through the engine's
    /// registry.
    pub fn restore(engine: &ProcessEngine, id: ProcessId) -> Result<Self> {
        let envelope = engine.store().load(id).map_err(|e| match e {
            AipError::NotFound(_) | AipError::Restore { .. } => e,
            other => AipError::restore(id, other.to_string()),
        })?;
        Self::from_envelope(engine.registry(), &envelope)
            .map_err(|e| AipError::restore(id, e.to_string()))
    }

    /// Rebuild a process from a persisted envelope
    pub fn from_envelope(registry: &ComponentRegistry, envelope: &ProcessEnvelope) -> Result<Self> {
        envelope.validate()?;

        let (class, configuration) = envelope.component_config("process")?;
        if class != PROCESS_CLASS {
            return Err(AipError::UnknownComponent {
                role: "process",
                class,
            });
        }
        let state: ProcessState = parse_state(PROCESS_CLASS, envelope.component_state("process"))?;

        let (class, config) = envelope.component_config("finder")?;
        let finder = registry.build_finder(&class, config, envelope.component_state("finder"))?;
        let (class, config) = envelope.component_config("reader")?;
        let reader = registry.build_reader(&class, config, envelope.component_state("reader"))?;
        let (class, config) = envelope.component_config("processor")?;
        let processor = registry.build_processor(&class, config, envelope.component_state("processor"))?;

        Ok(Self {
            id: Some(envelope.id),
            name: envelope.name.clone(),
            documentation: envelope.documentation.clone(),
            is_active: envelope.is_active,
            last_run: envelope.last_run,
            configuration,
            state,
            finder,
            reader,
            processor,
        })
    }

    /// Serialize the process and its components for `id`
    pub fn to_envelope(&self, id: ProcessId) -> Result<ProcessEnvelope> {
        let config = json!({
            "finder": tagged_config(self.finder.class(), self.finder.configuration()),
            "reader": tagged_config(self.reader.class(), self.reader.configuration()),
            "processor": tagged_config(self.processor.class(), self.processor.configuration()),
            "process": tagged_config(PROCESS_CLASS, &self.configuration),
        });
        let state = json!({
            "finder": self.finder.state()?,
            "reader": self.reader.state()?,
            "processor": self.processor.state()?,
            "process": serde_json::to_value(&self.state)?,
        });
        Ok(ProcessEnvelope::new(id, self.name.clone(), config, state)
            .with_documentation(self.documentation.clone())
            .with_active(self.is_active)
            .with_last_run(self.last_run))
    }

    /// Persist the process in the engine's store, returning its id.
    pub fn store(&mut self, engine: &ProcessEngine) -> Result<ProcessId> {
        self.store_in(engine.store())
    }

    /// Persist into `store`. A transient process is inserted under the next
    /// free id, a stored one is updated.
    pub fn store_in(&mut self, store: &dyn ProcessStore) -> Result<ProcessId> {
        if let Some(id) = self.id {
            store.update(&self.to_envelope(id)?)?;
            tracing::debug!(process_id = id.get(), "Process state persisted");
            return Ok(id);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = store.next_id()?;
            match store.insert(&self.to_envelope(id)?) {
                Ok(()) => {
                    self.id = Some(id);
                    tracing::info!(process_id = id.get(), name = %self.name, "Process stored");
                    return Ok(id);
                }
                Err(AipError::AlreadyExists(taken)) => {
                    tracing::debug!(process_id = taken.get(), "Process id taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AipError::storage("Couldn't allocate a process id"))
    }

    /// Run the process once.
    ///
    /// This method:
    /// 1. Installs the process's own log sink, if `log/level` or `log/file` is set
    /// 2. Acquires the process lock unless `parallel_execution` is set, and
    ///    reloads the process from the store once the lock is held
    /// 3. Verifies the configuration of all components
    /// 4. Resumes the reader's current source, or finds and claims a new one
    /// 5. Processes records while the budget allows and the source has more
    /// 6. Marks the source processed when it was read to the end
    /// 7. Persists the process, whatever happened in 3 to 6
    /// 8. Releases the lock
    ///
    /// A lock timeout fails the run before anything is touched or persisted.
    /// A timeout while reading or processing a record suspends the run; the
    /// record is retried by the next run.
    /// A record failure without `continue_with_failed_record` marks the source
    /// failed and returns [`AipError::Aborted`] after persisting.
    pub fn run(&mut self, engine: &ProcessEngine) -> Result<RunReport> {
        let options: ProcessConfig = self.configuration.parse()?;
        let sink = LogSink::from_config(&options.log)?;
        let _log_guard = sink.as_ref().map(LogSink::enter);
        let started = Instant::now();

        let mut lock = match self.acquire_lock(engine, &options) {
            Ok(lock) => lock,
            Err(e) => {
                record_run_metrics("lock_timeout", started);
                return Err(e);
            }
        };

        let result = self
            .reload_if_locked(engine, lock.is_some())
            .and_then(|options| self.run_locked(engine, &options));

        if let Some(lock) = lock.as_mut() {
            if let Err(e) = lock.release() {
                tracing::error!(process_id = self.id_for_log(), lock = lock.name(), "Couldn't release lock: {}", e);
            }
        }

        match &result {
            Ok(report) => {
                record_run_metrics(&report.outcome.to_string(), started);
                tracing::info!(
                    process_id = self.id_for_log(),
                    outcome = %report.outcome,
                    session_processed = report.session_processed,
                    session_failed = report.session_failed,
                    total_processed = report.total_processed,
                    "Run finished"
                );
            }
            Err(e) => {
                record_run_metrics(if matches!(e, AipError::Aborted { .. }) { "aborted" } else { "error" }, started);
                tracing::error!(process_id = self.id_for_log(), "Run failed: {}", e);
            }
        }
        result
    }

    fn acquire_lock(&self, engine: &ProcessEngine, options: &ProcessConfig) -> Result<Option<Box<dyn NamedLock>>> {
        if options.parallel_execution {
            tracing::debug!(process_id = self.id_for_log(), "Parallel execution allowed, not locking");
            return Ok(None);
        }
        let Some(id) = self.id else {
            tracing::debug!("Transient process, not locking");
            return Ok(None);
        };

        let name = lock_name(id);
        let timeout = options.lock_timeout();
        let mut lock = engine.locks().create_lock(&name);
        tracing::debug!(process_id = id.get(), lock = %name, timeout_secs = timeout.as_secs_f64(), "Acquiring lock");
        if !lock.acquire(timeout)? {
            #[cfg(feature = "metrics")]
            if let Some(metrics) = crate::observability::AipMetrics::global() {
                metrics.record_lock_timeout();
            }
            return Err(AipError::LockTimeout { name, timeout });
        }
        Ok(Some(lock))
    }

    /// A locked run starts from the stored envelope, never from an older
    /// copy held by this handle.
    fn reload_if_locked(&mut self, engine: &ProcessEngine, locked: bool) -> Result<ProcessConfig> {
        if let (true, Some(id)) = (locked, self.id) {
            *self = Self::restore(engine, id)?;
            tracing::debug!(process_id = id.get(), "Reloaded stored process");
        }
        self.configuration.parse()
    }

    /// Everything between acquiring and releasing the lock
    fn run_locked(&mut self, engine: &ProcessEngine, options: &ProcessConfig) -> Result<RunReport> {
        self.last_run = Some(Utc::now());
        self.state.runs += 1;
        self.reader.start_session();
        tracing::info!(process_id = self.id_for_log(), name = %self.name, run = self.state.runs, "Starting run");

        let executed = self.execute(engine, options);
        self.state.last_outcome = Some(match &executed {
            Ok(execution) => execution.outcome.to_string(),
            Err(AipError::Aborted { .. }) => "aborted".to_string(),
            Err(_) => "error".to_string(),
        });

        let persisted = self.store(engine);
        let execution = match (executed, persisted) {
            (Ok(execution), Ok(_)) => execution,
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(persist_error)) => {
                tracing::error!(process_id = self.id_for_log(), "Couldn't persist process: {}", persist_error);
                return Err(e);
            }
        };

        Ok(RunReport {
            process_id: self.id,
            outcome: execution.outcome,
            source: execution.source,
            stopped_by: execution.stopped_by,
            total_processed: self.reader.processed_count(),
            total_failed: self.reader.failed_count(),
            session_processed: self.reader.session_processed_count(),
            session_failed: self.reader.session_failed_count(),
        })
    }

    fn execute(&mut self, engine: &ProcessEngine, options: &ProcessConfig) -> Result<Execution> {
        let name = self.name.clone();
        let configuration = self.configuration.clone();
        let ctx = RunContext::new(self.id, &name, &configuration);

        self.finder.verify_configuration(&ctx)?;
        self.reader.verify_configuration(&ctx)?;
        self.processor.verify_configuration(&ctx)?;

        let clock = RunClock::new(engine.invocation_started());
        let mut budget = Budget::prepare(&options.processing_limit, &clock);

        let source = match self.open_source(&ctx)? {
            Sourcing::Open(source) => source,
            Sourcing::Ended(execution) => return Ok(execution),
        };

        let mut failure = None;
        let mut timed_out = false;
        while budget.should_process_more(self.reader.session_record_count()) && self.reader.has_more_records() {
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if e.is_timeout() => {
                    tracing::warn!(process_id = ctx.id_for_log(), source = %source, "Timed out reading record, it will be retried: {}", e);
                    timed_out = true;
                    break;
                }
                Err(e) => {
                    if self.record_failed(engine, options, &ctx, &e, None) {
                        continue;
                    }
                    failure = Some(e);
                    break;
                }
            };

            match self.processor.process_record(&ctx, &record) {
                Ok(()) => {
                    self.reader.mark_last_record_processed();
                    count_record(true);
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(process_id = ctx.id_for_log(), source = %source, "Timed out processing record, it will be retried: {}", e);
                    timed_out = true;
                    break;
                }
                Err(e) => {
                    if self.record_failed(engine, options, &ctx, &e, Some(&record)) {
                        continue;
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            tracing::error!(process_id = ctx.id_for_log(), source = %source, "Aborting, source marked failed");
            self.release_failed_source(&ctx, &source);
            return Err(AipError::Aborted {
                source_uri: source,
                message: e.to_string(),
            });
        }

        // the checkpoint ends before a timed out record, so the source stays open
        if timed_out || self.reader.has_more_records() {
            tracing::info!(
                process_id = ctx.id_for_log(),
                source = %source,
                processed = self.reader.processed_count(),
                "Suspending, source stays claimed"
            );
            return Ok(Execution {
                outcome: RunOutcome::Suspended,
                source: Some(source),
                stopped_by: budget.stop_reason(),
            });
        }

        self.finder.mark_source_processed(&ctx, &source)?;
        self.reader.mark_source_processed(&source);
        tracing::info!(process_id = ctx.id_for_log(), source = %source, "Source processed");
        Ok(Execution::ended(RunOutcome::Completed, Some(source)))
    }

    /// Resume the reader's source, or find, claim and open a new one
    fn open_source(&mut self, ctx: &RunContext<'_>) -> Result<Sourcing> {
        if let Some(uri) = self.reader.current_source().map(str::to_string) {
            tracing::info!(
                process_id = ctx.id_for_log(),
                source = %uri,
                processed = self.reader.processed_count(),
                failed = self.reader.failed_count(),
                "Resuming source"
            );
            if !self.reader.can_read_source(&uri) {
                tracing::warn!(process_id = ctx.id_for_log(), source = %uri, "Source can no longer be read, marking it failed");
                self.release_failed_source(ctx, &uri);
                return Ok(Sourcing::Ended(Execution::ended(RunOutcome::Unreadable, Some(uri))));
            }
            self.initialise(ctx, &uri)?;
            return Ok(Sourcing::Open(uri));
        }

        let Some(found) = self.finder.find_next_source(ctx)? else {
            tracing::info!(process_id = ctx.id_for_log(), "No source found");
            return Ok(Sourcing::Ended(Execution::ended(RunOutcome::NoSource, None)));
        };
        if !self.reader.can_read_source(&found) {
            tracing::warn!(process_id = ctx.id_for_log(), source = %found, "Reader cannot read source, leaving it unclaimed");
            return Ok(Sourcing::Ended(Execution::ended(RunOutcome::Unreadable, Some(found))));
        }

        let claimed = self.finder.claim_source(ctx, &found)?;
        tracing::info!(process_id = ctx.id_for_log(), source = %claimed, "Claimed source");
        self.initialise(ctx, &claimed)?;
        Ok(Sourcing::Open(claimed))
    }

    fn initialise(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<()> {
        if let Err(e) = self.reader.initialise_with_source(uri) {
            tracing::error!(process_id = ctx.id_for_log(), source = uri, "Couldn't open source: {}", e);
            self.release_failed_source(ctx, uri);
            return Err(e);
        }
        Ok(())
    }

    fn release_failed_source(&mut self, ctx: &RunContext<'_>, uri: &str) {
        if let Err(e) = self.finder.mark_source_failed(ctx, uri) {
            tracing::error!(process_id = ctx.id_for_log(), source = uri, "Couldn't mark source failed: {}", e);
        }
        self.reader.mark_source_failed(uri);
    }

    /// Account for a failed record. Returns whether the run goes on.
    fn record_failed(
        &mut self,
        engine: &ProcessEngine,
        options: &ProcessConfig,
        ctx: &RunContext<'_>,
        error: &AipError,
        record: Option<&Record>,
    ) -> bool {
        self.reader.mark_last_record_failed();
        count_record(false);
        tracing::warn!(
            process_id = ctx.id_for_log(),
            failed = self.reader.failed_count(),
            "Record failed: {}",
            error
        );

        if options.use_aip_error_log {
            match engine.error_log() {
                Some(log) => {
                    let unreadable = Record::from_value(Value::Null);
                    let entry = ErrorLogEntry::new(ctx.process_id, error.to_string(), record.unwrap_or(&unreadable));
                    if let Err(e) = log.append(&entry) {
                        tracing::error!(process_id = ctx.id_for_log(), "Couldn't write to error log: {}", e);
                    }
                }
                None => tracing::warn!(process_id = ctx.id_for_log(), "use_aip_error_log is set but no error log is configured"),
            }
        }

        if options.continue_with_failed_record {
            tracing::debug!(process_id = ctx.id_for_log(), "Continuing with the next record");
        }
        options.continue_with_failed_record
    }

    fn id_for_log(&self) -> u64 {
        self.id.map(ProcessId::get).unwrap_or(0)
    }

    /// `None` until the process is stored
    pub fn id(&self) -> Option<ProcessId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn documentation(&self) -> &str {
        &self.documentation
    }

    pub fn set_documentation<S: Into<String>>(&mut self, documentation: S) {
        self.documentation = documentation.into();
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn set_active(&mut self, is_active: bool) {
        self.is_active = is_active;
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn configuration(&self) -> &Settings {
        &self.configuration
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn finder(&self) -> &dyn Finder {
        self.finder.as_ref()
    }

    pub fn reader(&self) -> &dyn Reader {
        self.reader.as_ref()
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }
}

enum Sourcing {
    Open(String),
    Ended(Execution),
}

/// Class tag and configuration of one role in a process definition
fn definition_section(definition: &Map<String, Value>, role: &str) -> Result<(String, Settings)> {
    let mut section = definition
        .get(role)
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| AipError::validation(format!("process definition has no '{role}' section")))?;
    match section.remove(CLASS_KEY) {
        Some(Value::String(class)) => Ok((class, Settings::from(section))),
        _ => Err(AipError::validation(format!("'{role}' section does not name its class"))),
    }
}

#[cfg(feature = "metrics")]
fn record_run_metrics(outcome: &str, started: Instant) {
    if let Some(metrics) = crate::observability::AipMetrics::global() {
        metrics.record_run(outcome, started.elapsed());
    }
}

#[cfg(not(feature = "metrics"))]
fn record_run_metrics(_outcome: &str, _started: Instant) {}

#[cfg(feature = "metrics")]
fn count_record(processed: bool) {
    if let Some(metrics) = crate::observability::AipMetrics::global() {
        if processed {
            metrics.record_processed();
        } else {
            metrics.record_failed();
        }
    }
}

#[cfg(not(feature = "metrics"))]
fn count_record(_processed: bool) {}
