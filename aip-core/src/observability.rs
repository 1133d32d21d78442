/*!
Logging and metrics.

The host installs one global `tracing` subscriber ([`init_default_logging`]).
A process may additionally name its own level and log file; [`LogSink`] turns
that into a dispatcher that is the thread default only while the process runs.
With the `metrics` feature, run and record counters are kept in a Prometheus
registry.
*/

use std::fs::{self, OpenOptions};
use std::sync::Mutex;

#[cfg(feature = "metrics")]
use prometheus::{Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Duration;
use tracing::dispatcher::{self, DefaultGuard};
use tracing::{Dispatch, Level};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::{AipError, Result};

/// Map a configured level name to a tracing level
///
/// Accepts `debug`, `info`, `warning` (or `warn`) and `error`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warning" | "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// A process's own log destination
pub struct LogSink {
    dispatch: Dispatch,
    level: Level,
}

impl LogSink {
    /// Build a sink from `log/level` and `log/file`; `None` when neither is set.
    pub fn from_config(config: &LogConfig) -> Result<Option<LogSink>> {
        if !config.is_configured() {
            return Ok(None);
        }

        let level = match config.level.as_deref() {
            None => Level::INFO,
            Some(name) => parse_level(name).unwrap_or_else(|| {
                tracing::warn!(level = name, "Unknown log level, using info");
                Level::INFO
            }),
        };

        let dispatch = match &config.file {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        AipError::configuration(format!(
                            "Cannot open log file '{}': {}",
                            path.display(),
                            e
                        ))
                    })?;
                Dispatch::new(
                    tracing_subscriber::fmt()
                        .with_max_level(level)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file))
                        .finish(),
                )
            }
            None => Dispatch::new(
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_writer(std::io::stderr)
                    .finish(),
            ),
        };

        Ok(Some(LogSink { dispatch, level }))
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Make this sink the current thread's default until the guard drops
    pub fn enter(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }
}

/// Install the host's global subscriber
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` when `verbose`.
pub fn init_default_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AipError::configuration(format!("Failed to set global tracing subscriber: {e}")))
}

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<AipMetrics>> = OnceLock::new();

/// Metrics collection for process runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct AipMetrics {
    pub records_processed_total: Counter,
    pub records_failed_total: Counter,
    pub runs_total: CounterVec,
    pub run_duration_seconds: Histogram,
    pub lock_timeouts_total: Counter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl AipMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let records_processed_total = Counter::new(
            "aip_records_processed_total",
            "Records processed successfully",
        )
        .map_err(|e| metric_error("records_processed_total", e))?;

        let records_failed_total = Counter::new("aip_records_failed_total", "Records that failed")
            .map_err(|e| metric_error("records_failed_total", e))?;

        let runs_total = CounterVec::new(
            Opts::new("aip_runs_total", "Process runs by outcome"),
            &["outcome"],
        )
        .map_err(|e| metric_error("runs_total", e))?;

        let run_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "aip_run_duration_seconds",
            "Duration of process runs in seconds",
        ))
        .map_err(|e| metric_error("run_duration_seconds", e))?;

        let lock_timeouts_total = Counter::new(
            "aip_lock_timeouts_total",
            "Runs that could not acquire their process lock",
        )
        .map_err(|e| metric_error("lock_timeouts_total", e))?;

        registry
            .register(Box::new(records_processed_total.clone()))
            .map_err(|e| metric_error("records_processed_total", e))?;
        registry
            .register(Box::new(records_failed_total.clone()))
            .map_err(|e| metric_error("records_failed_total", e))?;
        registry
            .register(Box::new(runs_total.clone()))
            .map_err(|e| metric_error("runs_total", e))?;
        registry
            .register(Box::new(run_duration_seconds.clone()))
            .map_err(|e| metric_error("run_duration_seconds", e))?;
        registry
            .register(Box::new(lock_timeouts_total.clone()))
            .map_err(|e| metric_error("lock_timeouts_total", e))?;

        Ok(Self {
            records_processed_total,
            records_failed_total,
            runs_total,
            run_duration_seconds,
            lock_timeouts_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static AipMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!("Metrics disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    pub fn record_processed(&self) {
        self.records_processed_total.inc();
    }

    pub fn record_failed(&self) {
        self.records_failed_total.inc();
    }

    pub fn record_run(&self, outcome: &str, duration: Duration) {
        self.runs_total.with_label_values(&[outcome]).inc();
        self.run_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AipError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| AipError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> AipError {
    AipError::storage(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("Warning"), Some(Level::WARN));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn test_no_sink_without_config() {
        assert!(LogSink::from_config(&LogConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LogConfig {
            level: Some("chatty".to_string()),
            file: None,
        };
        let sink = LogSink::from_config(&config).unwrap().unwrap();
        assert_eq!(sink.level(), Level::INFO);
    }

    #[test]
    fn test_file_sink_receives_scoped_events() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs/process.log");
        let config = LogConfig {
            level: Some("warning".to_string()),
            file: Some(path.clone()),
        };
        let sink = LogSink::from_config(&config).unwrap().unwrap();
        {
            let _guard = sink.enter();
            tracing::info!("below the threshold");
            tracing::warn!("inside the run");
        }
        tracing::warn!("after the run");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("inside the run"));
        assert!(!content.contains("below the threshold"));
        assert!(!content.contains("after the run"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let metrics = AipMetrics::global().unwrap();
        metrics.record_processed();
        metrics.record_failed();
        metrics.record_run("completed", Duration::from_millis(10));
        metrics.record_lock_timeout();

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("aip_records_processed_total"));
        assert!(text.contains("aip_runs_total"));
    }
}
