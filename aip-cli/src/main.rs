/*!
AIP CLI - run and inspect resumable processing pipelines.

`aip run` is meant to be called repeatedly by a scheduler; every call continues
each process where the previous call stopped.
*/

use aip_core::observability::{init_default_logging, AipMetrics};
use aip_core::{
    create_engine_from_config, EngineConfig, Process, ProcessEngine, ProcessEnvelope, ProcessId,
};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "aip")]
#[command(about = "Run and inspect resumable AIP processes")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the stored processes
    #[arg(long, global = true, env = "AIP_STORE_DIR", default_value = "./aip")]
    store_dir: PathBuf,

    /// Directory for lock files (default: <store-dir>/locks)
    #[arg(long, global = true, env = "AIP_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    /// JSON lines file receiving failed records
    #[arg(long, global = true, env = "AIP_ERROR_LOG")]
    error_log: Option<PathBuf>,

    /// Store processes as plain JSON instead of gzip
    #[arg(long, global = true)]
    no_compression: bool,

    /// Take over lock files older than this many seconds
    #[arg(long, global = true, env = "AIP_STALE_LOCK_AFTER")]
    stale_lock_after: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more processes by id
    Run {
        /// Process ids
        #[arg(required = true)]
        ids: Vec<String>,
        /// Print Prometheus metrics after the batch
        #[arg(long)]
        metrics: bool,
    },
    /// Store a new process from a JSON definition
    Create {
        /// Definition file with finder, reader, processor and process sections
        #[arg(short, long)]
        definition: PathBuf,
        /// Process name (overrides the definition)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        documentation: Option<String>,
        /// Store the process as inactive
        #[arg(long)]
        inactive: bool,
    },
    /// Show configuration and state of a process
    Show {
        /// Process id
        id: String,
    },
    /// List all stored processes
    List,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Processed")]
    session_processed: u64,
    #[tabled(rename = "Failed")]
    session_failed: u64,
    #[tabled(rename = "Total processed")]
    total_processed: u64,
}

#[derive(Tabled)]
struct ProcessRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Active")]
    active: bool,
    #[tabled(rename = "Finder")]
    finder: String,
    #[tabled(rename = "Reader")]
    reader: String,
    #[tabled(rename = "Processor")]
    processor: String,
    #[tabled(rename = "Last run")]
    last_run: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_default_logging(cli.verbose)?;

    let engine = create_engine(&cli)?;

    match cli.command {
        Commands::Run { ids, metrics } => run_processes(&engine, &ids, metrics)?,
        Commands::Create {
            definition,
            name,
            documentation,
            inactive,
        } => create_process(&engine, &definition, name, documentation, inactive)?,
        Commands::Show { id } => show_process(&engine, &id)?,
        Commands::List => list_processes(&engine)?,
    }

    Ok(())
}

fn create_engine(cli: &Cli) -> Result<ProcessEngine, anyhow::Error> {
    let mut config = EngineConfig::with_store_dir(&cli.store_dir);
    config.lock_dir = cli.lock_dir.clone();
    config.error_log = cli.error_log.clone();
    config.compress = !cli.no_compression;
    config.stale_lock_after_secs = cli.stale_lock_after;

    create_engine_from_config(config)
        .with_context(|| format!("Cannot open process store at {}", cli.store_dir.display()))
}

fn run_processes(engine: &ProcessEngine, ids: &[String], metrics: bool) -> Result<(), anyhow::Error> {
    info!("Running {} process(es)", ids.len());
    let batch = engine.run_processes(ids);

    let mut rows = Vec::new();
    for (id, result) in &batch.runs {
        match result {
            Ok(report) => rows.push(RunRow {
                id: id.to_string(),
                outcome: report.outcome.to_string(),
                source: report.source.clone().unwrap_or_default(),
                session_processed: report.session_processed,
                session_failed: report.session_failed,
                total_processed: report.total_processed,
            }),
            Err(e) => {
                error!("Process {} failed: {}", id, e);
                rows.push(RunRow {
                    id: id.to_string(),
                    outcome: "error".to_string(),
                    source: e.to_string(),
                    session_processed: 0,
                    session_failed: 0,
                    total_processed: 0,
                });
            }
        }
    }

    if rows.is_empty() {
        println!("No processes were run");
    } else {
        println!("{}", Table::new(rows));
    }
    if !batch.skipped.is_empty() {
        println!("Skipped: {}", batch.skipped.join(", "));
    }

    if metrics {
        match AipMetrics::global() {
            Some(metrics) => print!("{}", metrics.gather_metrics()?),
            None => println!("Metrics are not available"),
        }
    }

    match batch.error_count() {
        0 => Ok(()),
        n => Err(anyhow!("{n} process run(s) failed")),
    }
}

fn create_process(
    engine: &ProcessEngine,
    definition: &Path,
    name: Option<String>,
    documentation: Option<String>,
    inactive: bool,
) -> Result<(), anyhow::Error> {
    let text = std::fs::read_to_string(definition)
        .with_context(|| format!("Cannot read {}", definition.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", definition.display()))?;
    if let (Some(name), Some(fields)) = (name, value.as_object_mut()) {
        fields.insert("name".to_string(), serde_json::Value::String(name));
    }

    let mut process = Process::from_definition(engine.registry(), &value)?;
    if let Some(documentation) = documentation {
        process.set_documentation(documentation);
    }
    process.set_active(!inactive);

    let id = process.store(engine)?;
    println!("✓ Created process {id} ({})", process.name());
    Ok(())
}

fn show_process(engine: &ProcessEngine, id: &str) -> Result<(), anyhow::Error> {
    let id: ProcessId = id.parse()?;
    let envelope = engine.store().load(id)?;

    println!("Process Details:");
    println!("  ID: {}", envelope.id);
    println!("  Name: {}", envelope.name);
    if !envelope.documentation.is_empty() {
        println!("  Documentation: {}", envelope.documentation);
    }
    println!("  Active: {}", envelope.is_active);
    println!("  Last run: {}", format_time(envelope.last_run));
    println!("  Updated: {}", format_time(Some(envelope.updated_at)));
    println!("  Format Version: {}", envelope.format_version);
    println!("  Content Hash: {}", envelope.content_hash);
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(&envelope.config)?);
    println!("State:");
    println!("{}", serde_json::to_string_pretty(&envelope.state)?);
    Ok(())
}

fn list_processes(engine: &ProcessEngine) -> Result<(), anyhow::Error> {
    let envelopes = engine.store().list()?;
    if envelopes.is_empty() {
        println!("No processes found");
        return Ok(());
    }

    let rows: Vec<ProcessRow> = envelopes
        .iter()
        .map(|envelope| ProcessRow {
            id: envelope.id.get(),
            name: envelope.name.clone(),
            active: envelope.is_active,
            finder: class_of(envelope, "finder"),
            reader: class_of(envelope, "reader"),
            processor: class_of(envelope, "processor"),
            last_run: format_time(envelope.last_run),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn class_of(envelope: &ProcessEnvelope, role: &str) -> String {
    envelope
        .component_config(role)
        .map(|(class, _)| class)
        .unwrap_or_else(|_| "?".to_string())
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}
