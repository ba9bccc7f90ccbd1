//! SyncBridge CLI - operator tooling for the sync database.
//!
//! Inspects sync health, transaction history and the local operation log,
//! and performs the manual maintenance operations on it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

use syncbridge_common::EntityRef;
use syncbridge_sync::{
    Database, PolicyMap, SyncConfig, SyncContext, SyncMonitor, TransactionRecord,
};

#[derive(Parser)]
#[command(name = "syncbridge")]
#[command(about = "SyncBridge - three-way entity sync administration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync statistics.
    Stats {
        /// Path to the sync database.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// List entities whose last sync ended FAILED or CONFLICT.
    Pending {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Maximum entries to show.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the transaction history of one entity.
    History {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Entity type.
        #[arg(short = 't', long = "type")]
        entity_type: String,

        /// Entity id.
        #[arg(short, long)]
        id: String,
    },

    /// Show the latest ledger rows across all entities.
    Recent {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show every row of one transaction.
    Transaction {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Transaction id.
        #[arg(long)]
        id: String,
    },

    /// Delete ledger history of transactions finished long ago.
    Archive {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Keep transactions that finished within this many days.
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// List unacknowledged local operations.
    Ops {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Restrict to one entity type (requires --id).
        #[arg(short = 't', long = "type", requires = "id")]
        entity_type: Option<String>,

        /// Restrict to one entity id (requires --type).
        #[arg(short, long, requires = "entity_type")]
        id: Option<String>,
    },

    /// Discard the unacknowledged local operations of one entity.
    Clear {
        #[arg(long)]
        db: Option<PathBuf>,

        #[arg(short = 't', long = "type")]
        entity_type: String,

        #[arg(short, long)]
        id: String,
    },

    /// Delete acknowledged operations from the log.
    Compact {
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Validate a sync configuration file.
    CheckConfig {
        /// Path to the JSON config.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Stats { db } => cmd_stats(db).await,

        Commands::Pending { db, limit } => cmd_pending(db, limit),

        Commands::History {
            db,
            entity_type,
            id,
        } => cmd_history(db, &entity_type, &id),

        Commands::Recent { db, limit } => cmd_recent(db, limit),

        Commands::Transaction { db, id } => cmd_transaction(db, &id),

        Commands::Archive { db, days } => cmd_archive(db, days),

        Commands::Ops {
            db,
            entity_type,
            id,
        } => cmd_ops(db, entity_type.zip(id)),

        Commands::Clear {
            db,
            entity_type,
            id,
        } => cmd_clear(db, &entity_type, &id),

        Commands::Compact { db } => cmd_compact(db),

        Commands::CheckConfig { config } => cmd_check_config(&config),
    }
}

/// Default database location under the user's data directory.
fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine the data directory")?;
    Ok(base.join("syncbridge").join("sync.db"))
}

fn open_context(db: Option<PathBuf>) -> Result<SyncContext> {
    let path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let database = Database::open(&path)
        .with_context(|| format!("Failed to open sync database {}", path.display()))?;
    Ok(SyncContext::new(database, PolicyMap::new()))
}

fn entity(entity_type: &str, id: &str) -> Result<EntityRef> {
    EntityRef::new(entity_type, id).context("Invalid entity reference")
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_record(record: &TransactionRecord) {
    println!(
        "  {} {:<11} {} attempt {} [{}]",
        format_time(&record.recorded_at),
        record.status.as_str(),
        record.entity,
        record.attempt_count,
        record.transaction_id
    );
    if let Some(error) = &record.error {
        println!("      error: {}", error);
    }
    if let Some(detail) = &record.detail {
        println!("      detail: {}", detail);
    }
}

/// Show sync statistics.
async fn cmd_stats(db: Option<PathBuf>) -> Result<()> {
    let monitor = SyncMonitor::detached(open_context(db)?);
    let stats = monitor
        .get_statistics()
        .await
        .context("Failed to compute statistics")?;

    println!("Sync Statistics:");
    println!(
        "  Error rate (24h): {:.1}%",
        stats.error_rate_last_24h * 100.0
    );
    match stats.average_sync_duration_ms {
        Some(ms) => println!("  Average sync duration: {:.1} ms", ms),
        None => println!("  Average sync duration: n/a"),
    }
    println!("  Pending local operations: {}", stats.pending_operations);
    println!("  Tracked entities: {}", stats.tracked_entities);

    if stats.per_entity_type.is_empty() {
        println!("  No completed transactions yet.");
    } else {
        println!("  Per entity type:");
        for (entity_type, counts) in &stats.per_entity_type {
            println!(
                "    {:<16} synced {:>5}  conflict {:>5}  failed {:>5}  ({:.1}% ok)",
                entity_type,
                counts.synced,
                counts.conflict,
                counts.failed,
                counts.success_rate() * 100.0
            );
        }
    }

    Ok(())
}

/// List FAILED and CONFLICT entities.
fn cmd_pending(db: Option<PathBuf>, limit: usize) -> Result<()> {
    let monitor = SyncMonitor::detached(open_context(db)?);
    let pending = monitor
        .get_pending(limit)
        .context("Failed to read the ledger")?;

    if pending.is_empty() {
        println!("Nothing needs attention.");
    } else {
        println!("Entities needing attention:");
        for record in &pending {
            print_record(record);
        }
    }

    Ok(())
}

/// Show one entity's history.
fn cmd_history(db: Option<PathBuf>, entity_type: &str, id: &str) -> Result<()> {
    let entity = entity(entity_type, id)?;
    let monitor = SyncMonitor::detached(open_context(db)?);
    let history = monitor
        .get_history(&entity)
        .context("Failed to read the ledger")?;

    if history.is_empty() {
        println!("No transactions recorded for {}.", entity);
    } else {
        println!("History of {}:", entity);
        for record in &history {
            print_record(record);
        }
    }

    Ok(())
}

/// Show the newest ledger rows.
fn cmd_recent(db: Option<PathBuf>, limit: usize) -> Result<()> {
    let monitor = SyncMonitor::detached(open_context(db)?);
    let recent = monitor
        .get_recent(limit)
        .context("Failed to read the ledger")?;

    if recent.is_empty() {
        println!("Ledger is empty.");
    } else {
        println!("Recent ledger rows:");
        for record in &recent {
            print_record(record);
        }
    }

    Ok(())
}

/// Show one transaction.
fn cmd_transaction(db: Option<PathBuf>, id: &str) -> Result<()> {
    let monitor = SyncMonitor::detached(open_context(db)?);
    let rows = monitor.get_transaction(id)?;

    println!("Transaction {}:", id);
    for record in &rows {
        print_record(record);
    }

    Ok(())
}

/// Trim old ledger history.
fn cmd_archive(db: Option<PathBuf>, days: u32) -> Result<()> {
    let monitor = SyncMonitor::detached(open_context(db)?);
    let removed = monitor
        .archive_older_than(days)
        .context("Failed to archive ledger history")?;
    println!(
        "Archived {} ledger rows older than {} days.",
        removed, days
    );
    Ok(())
}

/// List unacknowledged operations.
fn cmd_ops(db: Option<PathBuf>, filter: Option<(String, String)>) -> Result<()> {
    let entity = filter
        .map(|(entity_type, id)| entity(&entity_type, &id))
        .transpose()?;
    let ctx = open_context(db)?;
    let operations = ctx
        .oplog
        .list(entity.as_ref())
        .context("Failed to read the operation log")?;

    if operations.is_empty() {
        println!("Operation log is empty.");
        return Ok(());
    }

    println!("Pending operations:");
    for op in &operations {
        let payload = match &op.payload {
            Some(payload) => serde_json::to_string(payload)?,
            None => "-".to_string(),
        };
        println!(
            "  #{} {} {} {} at {} {}",
            op.operation_id,
            format_time(&op.created_at),
            op.kind.as_str(),
            op.entity,
            op.originating_vector,
            payload
        );
    }

    Ok(())
}

/// Drop an entity's pending operations.
fn cmd_clear(db: Option<PathBuf>, entity_type: &str, id: &str) -> Result<()> {
    let entity = entity(entity_type, id)?;
    let ctx = open_context(db)?;
    let removed = ctx
        .oplog
        .clear(&entity)
        .context("Failed to clear operations")?;

    info!("Cleared {} operations for {}", removed, entity);
    println!("Removed {} pending operations for {}.", removed, entity);

    Ok(())
}

/// Remove acknowledged rows.
fn cmd_compact(db: Option<PathBuf>) -> Result<()> {
    let ctx = open_context(db)?;
    let removed = ctx.oplog.compact().context("Failed to compact the log")?;
    println!("Compacted {} acknowledged operations.", removed);
    Ok(())
}

/// Validate a config file.
fn cmd_check_config(path: &Path) -> Result<()> {
    let config = SyncConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let policies = config.validate().context("Invalid configuration")?;

    println!("Configuration OK:");
    println!("  Workers: {}", config.worker_count);
    println!("  Batch size: {}", config.batch_size);
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!("  Mode: {:?}", config.mode);
    println!("  Entity types: {}", policies.len());
    for entity_type in &config.policies.entity_types {
        if let Some(policy) = policies.get(entity_type) {
            println!(
                "    {:<16} {:?}{}",
                entity_type,
                policy.strategy,
                if policy.delete_wins { "" } else { " (updates survive deletes)" }
            );
        }
    }

    Ok(())
}
