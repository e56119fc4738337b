//! Event log access
//!
//! Time-ordered, read-only access to the raw event log, plus the linkage
//! writes (segment_id/session_id) owned by the rebuild pipeline. Ordering
//! never relies on storage order: every read sorts by
//! `(timestamp_ms, id)`, with `id` as the insertion-sequence tie-break.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use castlog_common::db::models::{Event, EventKind};
use castlog_common::{Error, Result};

fn parse_optional_guid(value: Option<String>, column: &str) -> Result<Option<Uuid>> {
    value
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
        })
        .transpose()
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let kind: String = row.get("kind");
    Ok(Event {
        id: row.get("id"),
        kind: kind.parse::<EventKind>()?,
        timestamp_ms: row.get("timestamp_ms"),
        amount: row.get("amount"),
        viewers: row.get("viewers"),
        visitor: row.get("visitor"),
        payload: row.get("payload"),
        segment_id: parse_optional_guid(row.get("segment_id"), "segment_id")?,
        session_id: parse_optional_guid(row.get("session_id"), "session_id")?,
    })
}

/// Load events in ascending time order, optionally from a cursor timestamp
pub async fn load_events(pool: &SqlitePool, from_ms: Option<i64>) -> Result<Vec<Event>> {
    let rows = match from_ms {
        Some(from) => {
            sqlx::query(
                "SELECT id, kind, timestamp_ms, amount, viewers, visitor, payload,
                        segment_id, session_id
                 FROM events
                 WHERE timestamp_ms >= ?
                 ORDER BY timestamp_ms, id",
            )
            .bind(from)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, kind, timestamp_ms, amount, viewers, visitor, payload,
                        segment_id, session_id
                 FROM events
                 ORDER BY timestamp_ms, id",
            )
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(event_from_row).collect()
}

/// Load events without a segment assignment, in ascending time order
pub async fn load_unassigned_events(
    pool: &SqlitePool,
    from_ms: Option<i64>,
) -> Result<Vec<Event>> {
    let rows = match from_ms {
        Some(from) => {
            sqlx::query(
                "SELECT id, kind, timestamp_ms, amount, viewers, visitor, payload,
                        segment_id, session_id
                 FROM events
                 WHERE segment_id IS NULL AND timestamp_ms >= ?
                 ORDER BY timestamp_ms, id",
            )
            .bind(from)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, kind, timestamp_ms, amount, viewers, visitor, payload,
                        segment_id, session_id
                 FROM events
                 WHERE segment_id IS NULL
                 ORDER BY timestamp_ms, id",
            )
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(event_from_row).collect()
}

/// Load all events linked to one session, in ascending time order
pub async fn load_session_events(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT id, kind, timestamp_ms, amount, viewers, visitor, payload,
                segment_id, session_id
         FROM events
         WHERE session_id = ?
         ORDER BY timestamp_ms, id",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

/// Persist event→segment assignments in one transaction
pub async fn assign_segments(pool: &SqlitePool, assignments: &[(i64, Uuid)]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut updated = 0u64;

    for (event_id, segment_id) in assignments {
        let result = sqlx::query("UPDATE events SET segment_id = ? WHERE id = ?")
            .bind(segment_id.to_string())
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        updated += result.rows_affected();
    }

    tx.commit().await?;
    Ok(updated)
}

/// Clear segment/session linkage, optionally only at or after a cursor
///
/// Does not touch the event facts themselves.
pub async fn clear_linkage(pool: &SqlitePool, from_ms: Option<i64>) -> Result<u64> {
    let result = match from_ms {
        Some(from) => {
            sqlx::query(
                "UPDATE events SET segment_id = NULL, session_id = NULL
                 WHERE timestamp_ms >= ? AND (segment_id IS NOT NULL OR session_id IS NOT NULL)",
            )
            .bind(from)
            .execute(pool)
            .await?
        }
        None => {
            sqlx::query(
                "UPDATE events SET segment_id = NULL, session_id = NULL
                 WHERE segment_id IS NOT NULL OR session_id IS NOT NULL",
            )
            .execute(pool)
            .await?
        }
    };

    Ok(result.rows_affected())
}

/// Copy session_id from each event's segment onto the event row
///
/// Enables direct event→session queries without a join. Re-run after every
/// stitch.
pub async fn propagate_session_ids(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE events
         SET session_id = (SELECT session_id FROM segments WHERE segments.guid = events.segment_id)
         WHERE segment_id IS NOT NULL
           AND EXISTS (
               SELECT 1 FROM segments
               WHERE segments.guid = events.segment_id
                 AND segments.session_id IS NOT NULL
           )",
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Count events, optionally from a cursor timestamp
pub async fn count_events(pool: &SqlitePool, from_ms: Option<i64>) -> Result<i64> {
    let count: i64 = match from_ms {
        Some(from) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE timestamp_ms >= ?")
                .bind(from)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM events")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

/// Append a raw event row (ingestion tooling and tests)
///
/// Returns the assigned insertion-sequence id.
pub async fn append_event(
    pool: &SqlitePool,
    kind: EventKind,
    timestamp_ms: i64,
    amount: Option<i64>,
    viewers: Option<i64>,
    visitor: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO events (kind, timestamp_ms, amount, viewers, visitor)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(kind.as_str())
    .bind(timestamp_ms)
    .bind(amount)
    .bind(viewers)
    .bind(visitor)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}
