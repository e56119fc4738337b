//! Segment persistence
//!
//! Segments are derived, recomputable artifacts: deleted and regenerated on
//! a full rebuild, otherwise only appended to or closed.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use castlog_common::db::models::{Segment, SegmentKind};
use castlog_common::{Error, Result};

fn segment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Segment> {
    let guid: String = row.get("guid");
    let kind: String = row.get("kind");
    let session_id: Option<String> = row.get("session_id");

    Ok(Segment {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Failed to parse segment guid: {}", e)))?,
        started_at_ms: row.get("started_at_ms"),
        ended_at_ms: row.get("ended_at_ms"),
        kind: kind.parse::<SegmentKind>()?,
        session_id: session_id
            .map(|s| {
                Uuid::parse_str(&s)
                    .map_err(|e| Error::Internal(format!("Failed to parse session_id: {}", e)))
            })
            .transpose()?,
    })
}

/// Insert segments in one transaction
pub async fn insert_segments(pool: &SqlitePool, segments: &[Segment]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;

    for segment in segments {
        let result = sqlx::query(
            "INSERT INTO segments (guid, started_at_ms, ended_at_ms, kind, session_id)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(segment.guid.to_string())
        .bind(segment.started_at_ms)
        .bind(segment.ended_at_ms)
        .bind(segment.kind.as_str())
        .bind(segment.session_id.map(|s| s.to_string()))
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Load segments in ascending start order, optionally from a cursor
pub async fn load_segments(pool: &SqlitePool, from_ms: Option<i64>) -> Result<Vec<Segment>> {
    let rows = match from_ms {
        Some(from) => {
            sqlx::query(
                "SELECT guid, started_at_ms, ended_at_ms, kind, session_id
                 FROM segments
                 WHERE started_at_ms >= ?
                 ORDER BY started_at_ms, guid",
            )
            .bind(from)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT guid, started_at_ms, ended_at_ms, kind, session_id
                 FROM segments
                 ORDER BY started_at_ms, guid",
            )
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(segment_from_row).collect()
}

/// Delete all segments (full rebuild only); does not touch events
pub async fn clear_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM segments").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Delete segments starting at or after a cursor timestamp
pub async fn clear_from(pool: &SqlitePool, from_ms: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM segments WHERE started_at_ms >= ?")
        .bind(from_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Earliest start among segments that begin before `at_ms` but are still
/// running at it (open, or ending at/after the cursor)
pub async fn earliest_start_overlapping(pool: &SqlitePool, at_ms: i64) -> Result<Option<i64>> {
    let earliest: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(started_at_ms) FROM segments
         WHERE started_at_ms < ? AND (ended_at_ms IS NULL OR ended_at_ms >= ?)",
    )
    .bind(at_ms)
    .bind(at_ms)
    .fetch_one(pool)
    .await?;
    Ok(earliest)
}

/// Count stored segments
pub async fn count_segments(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
