use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subsettle::application::orchestrator::{Acknowledgement, Orchestrator};
use subsettle::config::Settings;
use subsettle::domain::ports::{OutboxHandle, StoreHandle};
use subsettle::infrastructure::in_memory::{InMemoryOutbox, InMemoryStore};
use subsettle::infrastructure::sync_target::LogSyncTarget;
use subsettle::interfaces::csv::customer_writer::CustomerWriter;
use subsettle::interfaces::journal::{JournalReader, JournalRecord};
use subsettle::telemetry;

/// How long the replay waits for the sync queue before giving up on it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input journal (JSON lines of customer, purchase and notification records)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn in_memory() -> (StoreHandle, OutboxHandle) {
    let store: StoreHandle = Arc::new(InMemoryStore::new());
    let outbox: OutboxHandle = Arc::new(InMemoryOutbox::new());
    (store, outbox)
}

#[cfg(feature = "storage-rocksdb")]
fn open_storage(db_path: Option<PathBuf>) -> Result<(StoreHandle, OutboxHandle)> {
    use subsettle::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let db = Arc::new(RocksDBStore::open(path).into_diagnostic()?);
            let store: StoreHandle = db.clone();
            let outbox: OutboxHandle = db;
            Ok((store, outbox))
        }
        None => Ok(in_memory()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_storage(db_path: Option<PathBuf>) -> Result<(StoreHandle, OutboxHandle)> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory())
}

async fn replay(orchestrator: &Orchestrator, record: JournalRecord) -> subsettle::error::Result<()> {
    match record {
        JournalRecord::Customer { id, referred_by } => {
            orchestrator.register_customer(id, referred_by).await?;
        }
        JournalRecord::Purchase(intent) => {
            orchestrator.open_purchase(intent).await?;
        }
        JournalRecord::Deactivate { id } => {
            orchestrator.deactivate_customer(&id).await?;
        }
        notification @ JournalRecord::Notification { .. } => {
            if let Some(raw) = notification.into_notification() {
                match orchestrator.handle(&raw?).await {
                    Acknowledgement::Accepted => {}
                    Acknowledgement::RetryLater => eprintln!("Notification deferred, provider would retry"),
                    Acknowledgement::Rejected(reason) => eprintln!("Notification rejected: {reason}"),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;
    let (store, outbox) = open_storage(cli.db_path)?;
    let orchestrator =
        Orchestrator::from_settings(&settings, store, outbox, Arc::new(LogSyncTarget::new()));

    // Replay the journal
    let file = File::open(cli.input).into_diagnostic()?;
    for (line, record) in JournalReader::new(BufReader::new(file)).records() {
        let result = match record {
            Ok(record) => replay(&orchestrator, record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            eprintln!("Error at line {line}: {e}");
        }
    }

    orchestrator.shutdown(DRAIN_TIMEOUT).await.into_diagnostic()?;
    for letter in orchestrator.dead_letters().await.into_diagnostic()? {
        eprintln!(
            "Dead letter {} after {} attempts: {}",
            letter.change.key(),
            letter.attempts,
            letter.last_error
        );
    }

    for event in orchestrator.unmatched().await.into_diagnostic()? {
        eprintln!(
            "Unmatched {} payment {} ({}, {} {})",
            event.provider, event.external_id, event.status, event.amount, event.currency
        );
    }

    // Output final state
    let customers = orchestrator.all_customers().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = CustomerWriter::new(stdout.lock());
    writer.write_customers(customers).into_diagnostic()?;

    Ok(())
}
