//! Settings database operations
//!
//! Provides get/set accessors for the settings table following the
//! key-value pattern. Tunables are read once per rebuild and passed into
//! the pipeline as explicit values; changes take effect on the next run.

use sqlx::{Pool, Sqlite};

use crate::{Error, Result};

/// Default merge gap between segments of one session, in minutes
pub const DEFAULT_MERGE_GAP_MINUTES: i64 = 30;

/// Get the session merge gap in minutes
///
/// **Default:** 30 minutes. Negative stored values are rejected.
pub async fn get_merge_gap_minutes(db: &Pool<Sqlite>) -> Result<i64> {
    let value: i64 = get_setting(db, "merge_gap_minutes")
        .await?
        .unwrap_or(DEFAULT_MERGE_GAP_MINUTES);
    if value < 0 {
        return Err(Error::Config(format!(
            "merge_gap_minutes must be >= 0, got {}",
            value
        )));
    }
    Ok(value)
}

/// Set the session merge gap in minutes
pub async fn set_merge_gap_minutes(db: &Pool<Sqlite>, minutes: i64) -> Result<()> {
    if minutes < 0 {
        return Err(Error::InvalidInput(format!(
            "merge_gap_minutes must be >= 0, got {}",
            minutes
        )));
    }
    set_setting(db, "merge_gap_minutes", minutes).await
}

/// Get the optional AI summary delay override in minutes
///
/// Read-only passthrough for the downstream summary generator; the rebuild
/// engine only reports it.
pub async fn get_ai_summary_delay_minutes(db: &Pool<Sqlite>) -> Result<Option<i64>> {
    get_setting(db, "ai_summary_delay_minutes").await
}

/// Generic setting getter (internal)
async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (internal)
async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// Setup in-memory test database with settings table
    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }

    #[tokio::test]
    async fn test_merge_gap_default() {
        let pool = setup_test_db().await;
        assert_eq!(get_merge_gap_minutes(&pool).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_merge_gap_set_and_get() {
        let pool = setup_test_db().await;
        set_merge_gap_minutes(&pool, 15).await.unwrap();
        assert_eq!(get_merge_gap_minutes(&pool).await.unwrap(), 15);

        // Upsert, no duplicate rows
        set_merge_gap_minutes(&pool, 45).await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM settings WHERE key = 'merge_gap_minutes'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
        assert_eq!(get_merge_gap_minutes(&pool).await.unwrap(), 45);
    }

    #[tokio::test]
    async fn test_merge_gap_rejects_negative() {
        let pool = setup_test_db().await;
        assert!(set_merge_gap_minutes(&pool, -1).await.is_err());

        sqlx::query("INSERT INTO settings (key, value) VALUES ('merge_gap_minutes', '-5')")
            .execute(&pool)
            .await
            .unwrap();
        assert!(get_merge_gap_minutes(&pool).await.is_err());
    }

    #[tokio::test]
    async fn test_ai_summary_delay_absent_and_present() {
        let pool = setup_test_db().await;
        assert_eq!(get_ai_summary_delay_minutes(&pool).await.unwrap(), None);

        sqlx::query("INSERT INTO settings (key, value) VALUES ('ai_summary_delay_minutes', '10')")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(
            get_ai_summary_delay_minutes(&pool).await.unwrap(),
            Some(10)
        );
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO settings (key, value) VALUES ('merge_gap_minutes', 'soon')")
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            get_merge_gap_minutes(&pool).await,
            Err(Error::Config(_))
        ));
    }
}
