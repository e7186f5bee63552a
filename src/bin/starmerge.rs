//! starmerge command line driver
//!
//! Runs one full pipeline over staged batches read from JSON files against
//! a persistent warehouse directory, then prints the run report as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use starmerge::storage::persistent::{open_store, JournalAuditSink, PersistentConfig};
use starmerge::{
    FanoutAuditSink, Pipeline, StagedBatch, TracingAuditSink, Warehouse, WarehouseConfig,
};

/// Default journal file inside the data directory.
const JOURNAL_FILE: &str = "audit.journal";

/// CLI configuration
struct Cli {
    data_dir: PathBuf,
    config: Option<PathBuf>,
    journal: Option<PathBuf>,
    no_sync: bool,
    batches: Vec<PathBuf>,
}

/// A batch file holds one batch or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    One(StagedBatch),
    Many(Vec<StagedBatch>),
}

fn print_help() {
    println!("starmerge - incremental dimensional merge");
    println!();
    println!("USAGE:");
    println!("    starmerge [OPTIONS] <BATCH.json>...");
    println!();
    println!("OPTIONS:");
    println!("    -d, --data-dir <DIR>      Warehouse directory [default: ./warehouse]");
    println!("    -c, --config <FILE>       Warehouse configuration (JSON)");
    println!("    -j, --journal <FILE>      Audit journal [default: <DIR>/{JOURNAL_FILE}]");
    println!("        --no-sync             Skip fsync on commit");
    println!("    -h, --help                Print help information");
}

fn parse_args() -> Result<Cli, String> {
    let mut cli = Cli {
        data_dir: PathBuf::from("./warehouse"),
        config: None,
        journal: None,
        no_sync: false,
        batches: Vec::new(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{flag} requires a value"));
        match arg.as_str() {
            "--data-dir" | "-d" => cli.data_dir = PathBuf::from(value("--data-dir")?),
            "--config" | "-c" => cli.config = Some(PathBuf::from(value("--config")?)),
            "--journal" | "-j" => cli.journal = Some(PathBuf::from(value("--journal")?)),
            "--no-sync" => cli.no_sync = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown argument: {flag}")),
            path => cli.batches.push(PathBuf::from(path)),
        }
    }
    Ok(cli)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "starmerge=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_batches(paths: &[PathBuf]) -> Result<Vec<StagedBatch>, String> {
    let mut batches = Vec::new();
    for path in paths {
        let located = |e: &dyn std::fmt::Display| format!("{}: {e}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| located(&e))?;
        match serde_json::from_str::<BatchFile>(&text).map_err(|e| located(&e))? {
            BatchFile::One(batch) => batches.push(batch),
            BatchFile::Many(many) => batches.extend(many),
        }
    }
    Ok(batches)
}

/// Returns whether the run succeeded.
fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => WarehouseConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => WarehouseConfig::default(),
    };
    let batches = load_batches(&cli.batches)?;

    let persistent = PersistentConfig {
        sync_on_write: !cli.no_sync,
        ..PersistentConfig::default()
    };
    let store = open_store(&cli.data_dir, Some(persistent))?;
    let journal_path = cli.journal.clone().unwrap_or_else(|| cli.data_dir.join(JOURNAL_FILE));
    let journal = JournalAuditSink::open(&journal_path, config.audit_queue_capacity)?;
    let audit = FanoutAuditSink::new()
        .with(Arc::new(TracingAuditSink))
        .with(Arc::new(journal));

    let warehouse = Warehouse::builder()
        .store(Arc::new(store))
        .audit(Arc::new(audit))
        .config(config)
        .open()?;

    tracing::info!(data_dir = %cli.data_dir.display(), batches = batches.len(), "starting run");
    let report = Pipeline::new(&warehouse).run(batches);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.is_success())
}

fn main() {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::exit(2);
        }
    };
    init_tracing();

    // `run` owns the warehouse so the journal is drained before exit.
    let code = match run(&cli) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    };
    std::process::exit(code);
}
