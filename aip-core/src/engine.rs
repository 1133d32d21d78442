/*!
The engine: where processes are stored, how they are locked, and which
component classes can be restored.

A host builds one [`ProcessEngine`] per invocation (e.g. per cron run) and
asks it to run processes by id. The engine's creation time is the invocation
start that `php_process_time` budgets are measured from.
*/

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error_log::JsonLinesErrorLog;
use crate::lock::FileLockManager;
use crate::storage::FileProcessStore;
use crate::{
    AipError, ComponentRegistry, ErrorLog, LockManager, Process, ProcessId, ProcessStore, Result,
    RunReport,
};

/// Everything a process needs from its surroundings to run
pub struct ProcessEngine {
    store: Box<dyn ProcessStore>,
    locks: Box<dyn LockManager>,
    error_log: Option<Box<dyn ErrorLog>>,
    registry: ComponentRegistry,
    invocation_started: Instant,
}

impl ProcessEngine {
    /// Create an engine with the built-in component classes
    pub fn new(store: Box<dyn ProcessStore>, locks: Box<dyn LockManager>) -> Self {
        Self {
            store,
            locks,
            error_log: None,
            registry: ComponentRegistry::default(),
            invocation_started: Instant::now(),
        }
    }

    pub fn with_error_log(mut self, error_log: Box<dyn ErrorLog>) -> Self {
        self.error_log = Some(error_log);
        self
    }

    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Measure invocation budgets from `started` instead of engine creation
    pub fn with_invocation_started(mut self, started: Instant) -> Self {
        self.invocation_started = started;
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    pub fn store(&self) -> &dyn ProcessStore {
        self.store.as_ref()
    }

    pub fn locks(&self) -> &dyn LockManager {
        self.locks.as_ref()
    }

    pub fn error_log(&self) -> Option<&dyn ErrorLog> {
        self.error_log.as_deref()
    }

    pub fn invocation_started(&self) -> Instant {
        self.invocation_started
    }

    /// Restore process `id`
    pub fn load_process(&self, id: ProcessId) -> Result<Process> {
        Process::restore(self, id)
    }

    /// Restore process `id` and run it once
    pub fn run_process(&self, id: ProcessId) -> Result<RunReport> {
        let mut process = self.load_process(id)?;
        process.run(self)
    }

    /// Run several processes one after the other.
    ///
    /// Ids that are not numbers, not stored or belong to inactive processes
    /// are skipped with a warning. Every other id gets one entry in
    /// [`BatchReport::runs`], whether its run succeeded or not.
    pub fn run_processes<S: AsRef<str>>(&self, ids: &[S]) -> BatchReport {
        let mut report = BatchReport::default();

        for raw in ids {
            let raw = raw.as_ref();
            let id = match ProcessId::from_str(raw) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(id = raw, "Skipping invalid process id");
                    report.skipped.push(raw.to_string());
                    continue;
                }
            };

            let mut process = match self.load_process(id) {
                Ok(process) => process,
                Err(AipError::NotFound(_)) => {
                    tracing::warn!(process_id = id.get(), "Skipping unknown process");
                    report.skipped.push(raw.to_string());
                    continue;
                }
                Err(e) => {
                    tracing::error!(process_id = id.get(), "Couldn't restore process: {}", e);
                    report.runs.push((id, Err(e)));
                    continue;
                }
            };

            if !process.is_active() {
                tracing::warn!(process_id = id.get(), "Skipping inactive process");
                report.skipped.push(raw.to_string());
                continue;
            }

            let result = process.run(self);
            report.runs.push((id, result));
        }

        report
    }
}

/// Results of [`ProcessEngine::run_processes`]
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One entry per process that was run (or failed to restore), in order
    pub runs: Vec<(ProcessId, Result<RunReport>)>,
    /// Ids that were not run
    pub skipped: Vec<String>,
}

impl BatchReport {
    /// Lifetime processed counts of the sources of all successful runs
    pub fn total_processed(&self) -> u64 {
        self.successful().map(|r| r.total_processed).sum()
    }

    /// Records processed by this batch
    pub fn session_processed(&self) -> u64 {
        self.successful().map(|r| r.session_processed).sum()
    }

    pub fn session_failed(&self) -> u64 {
        self.successful().map(|r| r.session_failed).sum()
    }

    /// Number of runs that ended in an error
    pub fn error_count(&self) -> usize {
        self.runs.iter().filter(|(_, result)| result.is_err()).count()
    }

    fn successful(&self) -> impl Iterator<Item = &RunReport> {
        self.runs.iter().filter_map(|(_, result)| result.as_ref().ok())
    }
}

/// Create an engine storing everything below `base_dir`
pub fn create_default_engine<P: AsRef<Path>>(base_dir: P) -> Result<ProcessEngine> {
    create_engine_from_config(EngineConfig::with_store_dir(base_dir.as_ref()))
}

/// Create an engine from configuration
pub fn create_engine_from_config(config: EngineConfig) -> Result<ProcessEngine> {
    config.validate()?;

    let store = FileProcessStore::with_compression(&config.store_dir, config.compress)?;

    let lock_dir = config.lock_dir();
    std::fs::create_dir_all(&lock_dir).map_err(|e| {
        AipError::storage(format!(
            "Failed to create lock directory {}: {}",
            lock_dir.display(),
            e
        ))
    })?;
    let mut locks = FileLockManager::new(&lock_dir);
    if let Some(secs) = config.stale_lock_after_secs {
        locks = locks.with_stale_after(Duration::from_secs(secs));
    }

    let mut engine = ProcessEngine::new(Box::new(store), Box::new(locks));
    if let Some(path) = &config.error_log {
        engine = engine.with_error_log(Box::new(JsonLinesErrorLog::new(path)));
    }

    tracing::debug!(
        store_dir = %config.store_dir.display(),
        lock_dir = %lock_dir.display(),
        compress = config.compress,
        "Engine created"
    );
    Ok(engine)
}
