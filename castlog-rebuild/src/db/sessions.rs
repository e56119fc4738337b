//! Stream session persistence
//!
//! Sessions are derived artifacts like segments. `persist_session_with_segments`
//! is the atomic unit of stitching persistence: one transaction per session so
//! an interrupted run never leaves a session with partially-linked segments.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use castlog_common::db::models::{Rollup, SessionStatus, StreamSession};
use castlog_common::{Error, Result};

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StreamSession> {
    let guid: String = row.get("guid");
    let status: String = row.get("status");

    Ok(StreamSession {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Failed to parse session guid: {}", e)))?,
        started_at_ms: row.get("started_at_ms"),
        ended_at_ms: row.get("ended_at_ms"),
        status: status.parse::<SessionStatus>()?,
        rollup: Rollup {
            total_tokens: row.get("total_tokens"),
            followers_gained: row.get("followers_gained"),
            peak_viewers: row.get("peak_viewers"),
            avg_viewers: row.get("avg_viewers"),
            unique_visitors: row.get("unique_visitors"),
        },
    })
}

/// Insert one session and link its segments, all-or-nothing
pub async fn persist_session_with_segments(
    pool: &SqlitePool,
    session: &StreamSession,
    segment_ids: &[Uuid],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO stream_sessions (guid, started_at_ms, ended_at_ms, status)
         VALUES (?, ?, ?, ?)",
    )
    .bind(session.guid.to_string())
    .bind(session.started_at_ms)
    .bind(session.ended_at_ms)
    .bind(session.status.as_str())
    .execute(&mut *tx)
    .await?;

    for segment_id in segment_ids {
        sqlx::query("UPDATE segments SET session_id = ? WHERE guid = ?")
            .bind(session.guid.to_string())
            .bind(segment_id.to_string())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Load sessions in ascending start order
pub async fn load_sessions(pool: &SqlitePool) -> Result<Vec<StreamSession>> {
    let rows = sqlx::query(
        "SELECT guid, started_at_ms, ended_at_ms, status,
                total_tokens, followers_gained, peak_viewers, avg_viewers, unique_visitors
         FROM stream_sessions
         ORDER BY started_at_ms, guid",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(session_from_row).collect()
}

/// Load one session by guid
pub async fn load_session(pool: &SqlitePool, guid: Uuid) -> Result<Option<StreamSession>> {
    let row = sqlx::query(
        "SELECT guid, started_at_ms, ended_at_ms, status,
                total_tokens, followers_gained, peak_viewers, avg_viewers, unique_visitors
         FROM stream_sessions
         WHERE guid = ?",
    )
    .bind(guid.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// Write computed rollup fields back to the session row
pub async fn update_rollup(pool: &SqlitePool, guid: Uuid, rollup: &Rollup) -> Result<()> {
    let result = sqlx::query(
        "UPDATE stream_sessions
         SET total_tokens = ?, followers_gained = ?, peak_viewers = ?,
             avg_viewers = ?, unique_visitors = ?
         WHERE guid = ?",
    )
    .bind(rollup.total_tokens)
    .bind(rollup.followers_gained)
    .bind(rollup.peak_viewers)
    .bind(rollup.avg_viewers)
    .bind(rollup.unique_visitors)
    .bind(guid.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("session {}", guid)));
    }
    Ok(())
}

/// Delete all sessions (full rebuild only)
pub async fn clear_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM stream_sessions")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Delete sessions starting at or after a cursor timestamp
pub async fn clear_from(pool: &SqlitePool, from_ms: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM stream_sessions WHERE started_at_ms >= ?")
        .bind(from_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Earliest start among sessions that begin before `at_ms` but are still
/// running at it (active, or ending at/after the cursor)
pub async fn earliest_start_overlapping(pool: &SqlitePool, at_ms: i64) -> Result<Option<i64>> {
    let earliest: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(started_at_ms) FROM stream_sessions
         WHERE started_at_ms < ? AND (ended_at_ms IS NULL OR ended_at_ms >= ?)",
    )
    .bind(at_ms)
    .bind(at_ms)
    .fetch_one(pool)
    .await?;
    Ok(earliest)
}

/// Count stored sessions
pub async fn count_sessions(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stream_sessions")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use castlog_common::db::init_tables;
    use castlog_common::db::models::{Segment, SegmentKind};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        init_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_persist_session_links_segments_atomically() {
        let pool = setup_test_db().await;

        let segments = vec![
            Segment::new(0, Some(1_000), SegmentKind::Explicit),
            Segment::new(2_000, Some(3_000), SegmentKind::Explicit),
        ];
        crate::db::segments::insert_segments(&pool, &segments)
            .await
            .unwrap();

        let session = StreamSession::new(0, Some(3_000));
        persist_session_with_segments(
            &pool,
            &session,
            &[segments[0].guid, segments[1].guid],
        )
        .await
        .unwrap();

        let stored = crate::db::segments::load_segments(&pool, None).await.unwrap();
        assert!(stored.iter().all(|s| s.session_id == Some(session.guid)));

        let sessions = load_sessions(&pool).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_update_rollup_roundtrip() {
        let pool = setup_test_db().await;
        let session = StreamSession::new(0, Some(60_000));
        persist_session_with_segments(&pool, &session, &[]).await.unwrap();

        let rollup = Rollup {
            total_tokens: 15,
            followers_gained: 1,
            peak_viewers: 340,
            avg_viewers: 210.5,
            unique_visitors: 89,
        };
        update_rollup(&pool, session.guid, &rollup).await.unwrap();

        let stored = load_session(&pool, session.guid).await.unwrap().unwrap();
        assert_eq!(stored.rollup, rollup);
    }

    #[tokio::test]
    async fn test_update_rollup_missing_session_is_not_found() {
        let pool = setup_test_db().await;
        let err = update_rollup(&pool, Uuid::new_v4(), &Rollup::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_earliest_start_overlapping() {
        let pool = setup_test_db().await;
        persist_session_with_segments(&pool, &StreamSession::new(0, Some(1_000)), &[])
            .await
            .unwrap();
        persist_session_with_segments(&pool, &StreamSession::new(2_000, Some(8_000)), &[])
            .await
            .unwrap();
        persist_session_with_segments(&pool, &StreamSession::new(9_000, None), &[])
            .await
            .unwrap();

        assert_eq!(
            earliest_start_overlapping(&pool, 5_000).await.unwrap(),
            Some(2_000)
        );
        // The active session straddles every later cursor
        assert_eq!(
            earliest_start_overlapping(&pool, 50_000).await.unwrap(),
            Some(9_000)
        );
        assert_eq!(earliest_start_overlapping(&pool, 1_500).await.unwrap(), None);
    }
}
