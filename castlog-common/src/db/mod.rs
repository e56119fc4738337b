//! Database access for castlog
//!
//! Shared SQLite database holding the raw event log plus the derived
//! segment/session artifacts rebuilt from it.

pub mod models;
pub mod settings;

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to the shared castlog.db, creating it (and its parent
/// directory) if missing, then ensures the schema exists.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Initialize castlog tables
///
/// Creates events, segments, stream_sessions and settings tables if they
/// don't exist. Events are appended by the live listener; segments and
/// stream_sessions are derived artifacts owned by the rebuild engine.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            amount INTEGER,
            viewers INTEGER,
            visitor TEXT,
            payload TEXT,
            segment_id TEXT,
            session_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp_ms, id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_segment ON events (segment_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            guid TEXT PRIMARY KEY,
            started_at_ms INTEGER NOT NULL,
            ended_at_ms INTEGER,
            kind TEXT NOT NULL DEFAULT 'explicit',
            session_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_sessions (
            guid TEXT PRIMARY KEY,
            started_at_ms INTEGER NOT NULL,
            ended_at_ms INTEGER,
            status TEXT NOT NULL DEFAULT 'ended',
            total_tokens INTEGER NOT NULL DEFAULT 0,
            followers_gained INTEGER NOT NULL DEFAULT 0,
            peak_viewers INTEGER NOT NULL DEFAULT 0,
            avg_viewers REAL NOT NULL DEFAULT 0.0,
            unique_visitors INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Database tables initialized (events, segments, stream_sessions, settings)");

    Ok(())
}
