use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use store::{meta, PersistentStore, Space};
use sync_engine::{Checksum, CompactionOutcome, CompactionScheduler, OfflineQueue, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Inspect and maintain the local offline task store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (defaults to the app data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON sync config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts and sync metadata
    Status,

    /// List queued operations in replay order
    Queue,

    /// Compute the aggregate digest of confirmed tasks
    Checksum,

    /// Archive synced ledger events older than the retention window
    Compact {
        /// Override the configured retention
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Remove abandoned provisional tasks
    Cleanup {
        /// Override the configured minimum orphan age
        #[arg(long)]
        threshold_secs: Option<i64>,
    },

    /// Print this installation's node id
    NodeId,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| store::app_data_dir().join("sync.json"));
    let config = SyncConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let db_path = cli.db.clone().unwrap_or_else(store::default_db_path);
    let store = Arc::new(PersistentStore::open(&db_path));
    store
        .init()
        .await
        .with_context(|| format!("opening store at {}", db_path.display()))?;

    match cli.command {
        Commands::Status => status_command(&store).await,
        Commands::Queue => queue_command(&store).await,
        Commands::Checksum => checksum_command(&store).await,
        Commands::Compact { retention_days } => {
            let retention = retention_days.unwrap_or(config.retention_days);
            compact_command(&store, retention).await
        }
        Commands::Cleanup { threshold_secs } => {
            let config = SyncConfig {
                orphan_threshold_secs: threshold_secs.unwrap_or(config.orphan_threshold_secs),
                ..config
            };
            config.validate()?;
            cleanup_command(&store, &config).await
        }
        Commands::NodeId => {
            println!("{}", store.node_id().await?);
            Ok(())
        }
    }
}

async fn status_command(store: &PersistentStore) -> Result<()> {
    let stats = store.stats().await?;
    let node = store.node_id().await?;
    let last_checksum = store.meta(meta::LAST_CHECKSUM).await?;
    let last_compaction = store.meta(meta::LAST_COMPACTION).await?;

    if let Some(path) = store.path() {
        println!("Database:          {}", path.display());
    }
    println!("Node id:           {node}");
    println!("Confirmed tasks:   {}", stats.confirmed);
    println!("Provisional tasks: {}", stats.provisional);
    println!(
        "Ledger events:     {} ({} pending)",
        stats.ledger, stats.pending_events
    );
    println!(
        "Queued operations: {} ({} failed)",
        stats.queue, stats.failed_operations
    );
    println!("Archive summaries: {}", stats.archive);
    println!("Metadata entries:  {}", stats.metadata);
    println!("Last checksum:     {}", display_meta(last_checksum));
    println!("Last compaction:   {}", display_meta(last_compaction));
    Ok(())
}

async fn queue_command(store: &Arc<PersistentStore>) -> Result<()> {
    let node = store.node_id().await?;
    let queue = OfflineQueue::new(store.clone(), node);
    let ops = queue.dequeue_in_order().await?;
    if ops.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for op in ops {
        let clock: Vec<String> = op
            .vector_clock
            .to_canonical_form()
            .into_iter()
            .map(|(node, count)| format!("{node}:{count}"))
            .collect();
        println!(
            "#{:<5} {:<7} {:<40} prio={} clock={{{}}} retries={}{}",
            op.id.unwrap_or_default(),
            op.op_type.as_str(),
            op.entity_id,
            op.priority,
            clock.join(","),
            op.retry_count,
            if op.failed { " FAILED" } else { "" }
        );
        if let Some(error) = &op.last_error {
            println!("       last error: {error}");
        }
    }
    Ok(())
}

async fn checksum_command(store: &PersistentStore) -> Result<()> {
    let (local, count) = store
        .transaction(|tx| Ok((tx.confirmed_checksum()?, tx.count(Space::Confirmed)?)))
        .await?;
    println!("Local:  {local} ({count} tasks)");

    match store.meta(meta::LAST_CHECKSUM).await? {
        Some(serde_json::Value::String(remote)) => {
            let remote = Checksum::from_hex(remote);
            let verdict = if local.matches(&remote) {
                "in sync"
            } else {
                "drift"
            };
            println!("Remote: {remote} ({verdict})");
        }
        _ => println!("Remote: never fetched"),
    }
    Ok(())
}

async fn compact_command(store: &Arc<PersistentStore>, retention_days: u32) -> Result<()> {
    let scheduler = CompactionScheduler::new(store.clone());
    match scheduler.compact(retention_days, Utc::now()).await? {
        CompactionOutcome::Archived(summary) => {
            println!(
                "Archived {} events from {} to {}",
                summary.archived_event_count, summary.range_start, summary.range_end
            );
            for (event_type, count) in &summary.type_counts {
                println!("  {event_type}: {count}");
            }
        }
        CompactionOutcome::NothingToArchive => {
            println!("No synced events older than {retention_days} days")
        }
        CompactionOutcome::NotDue { next_due } => println!("Not due until {next_due}"),
    }
    Ok(())
}

async fn cleanup_command(store: &PersistentStore, config: &SyncConfig) -> Result<()> {
    let removed = store
        .cleanup_orphans(Utc::now(), config.orphan_threshold())
        .await?;
    info!(removed = removed.len(), "orphan cleanup finished");
    if removed.is_empty() {
        println!("No orphaned provisional tasks");
    }
    for id in removed {
        println!("Removed {id}");
    }
    Ok(())
}

fn display_meta(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => "never".to_string(),
    }
}
