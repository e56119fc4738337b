//! Rebuild mutual exclusion
//!
//! Coarse single-rebuild-at-a-time lock scoped to the broadcaster, stored as
//! a `rebuild_lock` row in the settings table. The live ingester may keep
//! appending raw events while the lock is held; it must not write
//! segment/session linkage.

use sqlx::SqlitePool;

use castlog_common::time::{minutes_to_ms, now_ms};
use castlog_common::{Error, Result};

const LOCK_KEY: &str = "rebuild_lock";

/// A lock held longer than this is assumed to belong to a crashed run
pub const LOCK_STALE_MINUTES: i64 = 60;

/// Acquire the rebuild lock, stealing a stale one from a crashed run
///
/// Fails with `Error::Invariant` if another rebuild holds a fresh lock.
pub async fn acquire(pool: &SqlitePool) -> Result<()> {
    let now = now_ms();

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(LOCK_KEY)
            .fetch_optional(pool)
            .await?;

    if let Some((value,)) = existing {
        let held_since = value
            .parse::<i64>()
            .map_err(|e| Error::Internal(format!("Corrupt rebuild_lock value: {}", e)))?;

        if now - held_since < minutes_to_ms(LOCK_STALE_MINUTES) {
            return Err(Error::Invariant(format!(
                "another rebuild is already running (lock held for {} ms)",
                now - held_since
            )));
        }

        tracing::warn!(
            held_since,
            "Stealing stale rebuild lock from a crashed run"
        );
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(now.to_string())
            .bind(LOCK_KEY)
            .execute(pool)
            .await?;
        return Ok(());
    }

    let result = sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO NOTHING",
    )
    .bind(LOCK_KEY)
    .bind(now.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        // Lost the race to a concurrent acquirer
        return Err(Error::Invariant(
            "another rebuild is already running".to_string(),
        ));
    }

    Ok(())
}

/// Release the rebuild lock
pub async fn release(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(LOCK_KEY)
        .execute(pool)
        .await?;
    Ok(())
}
