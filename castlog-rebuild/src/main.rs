//! castlog-rebuild - Session Reconstruction CLI
//!
//! Rebuilds broadcast sessions and rollups from the raw event log. Exit code
//! 0 on success; non-zero when the rebuild aborts (lock contention, invariant
//! violation, database failure).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use castlog_common::config::resolve_database_path;
use castlog_common::db::init_database_pool;
use castlog_rebuild::{RebuildOptions, RebuildOrchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "castlog-rebuild",
    about = "Rebuild broadcast sessions and rollups from the event log"
)]
struct Cli {
    /// SQLite database path (overrides CASTLOG_DATABASE and the config file)
    #[arg(long, env = "CASTLOG_DATABASE")]
    database: Option<String>,

    /// Rebuild only from this point in time (RFC 3339 or YYYY-MM-DD, UTC)
    #[arg(long)]
    from: Option<String>,

    /// Report what a rebuild would touch without modifying anything
    #[arg(long)]
    dry_run: bool,

    /// Override the stored session merge gap, in minutes, for this run
    #[arg(long)]
    merge_gap: Option<i64>,
}

/// Accepts a full RFC 3339 timestamp or a bare date (UTC midnight)
fn parse_from_timestamp(value: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid --from value: {}", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid --from date")?;
    Ok(midnight.and_utc().timestamp_millis())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let from_ms = cli.from.as_deref().map(parse_from_timestamp).transpose()?;

    let db_path = resolve_database_path(cli.database.as_deref());
    tracing::info!(database = %db_path.display(), "Opening database");
    let pool = init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing the current step then stopping");
            shutdown.cancel();
        }
    });

    let orchestrator = RebuildOrchestrator::new(pool, cancel);
    let report = orchestrator
        .run(&RebuildOptions {
            from_ms,
            dry_run: cli.dry_run,
            merge_gap_minutes_override: cli.merge_gap,
        })
        .await?;

    println!("{}", report);
    Ok(())
}
