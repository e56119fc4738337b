//! Rollup computation
//!
//! Derives per-session statistics from the events linked to a session and
//! writes them back to the session row, plus broadcaster-wide aggregates.
//! All duration math is integer milliseconds; minutes with one decimal are a
//! display concern only.

use std::collections::HashSet;

use sqlx::SqlitePool;
use uuid::Uuid;

use castlog_common::db::models::{
    AggregateStats, Event, EventKind, Rollup, StreamSession,
};
use castlog_common::time::{now_ms, MS_PER_MINUTE};
use castlog_common::{Error, Result};

use crate::db::{events, sessions};

/// Cap on a viewer sample's weight in the time-weighted average. Samples are
/// roughly periodic; without the cap a stale sample before an outage would
/// dominate the mean.
pub const MAX_SAMPLE_GAP_MS: i64 = 5 * MS_PER_MINUTE;

/// Compute a session's rollup from its events.
///
/// - `total_tokens`: sum of tip amounts
/// - `followers_gained`: count(follow) − count(unfollow), may be negative
/// - `peak_viewers`: max viewer sample
/// - `avg_viewers`: time-weighted mean; each sample weighted by the interval
///   to the next sample (the last to session end, or now for active
///   sessions), capped at [`MAX_SAMPLE_GAP_MS`]; falls back to the
///   arithmetic mean when total weight is zero
/// - `unique_visitors`: distinct visitor ids across visitor_seen/tip/follow
pub fn compute_rollup(session: &StreamSession, session_events: &[Event], now: i64) -> Result<Rollup> {
    let session_end = session.ended_at_ms.unwrap_or(now);
    if session_end < session.started_at_ms {
        return Err(Error::Invariant(format!(
            "session {} has negative duration ({} > {})",
            session.guid, session.started_at_ms, session_end
        )));
    }

    let mut sorted: Vec<&Event> = session_events.iter().collect();
    sorted.sort_by_key(|e| (e.timestamp_ms, e.id));

    let mut total_tokens = 0i64;
    let mut followers_gained = 0i64;
    let mut peak_viewers = 0i64;
    let mut visitors: HashSet<&str> = HashSet::new();
    let mut samples: Vec<(i64, i64)> = Vec::new();

    for event in &sorted {
        match event.kind {
            EventKind::Tip => {
                total_tokens += event.amount.unwrap_or(0);
                if let Some(visitor) = event.visitor.as_deref() {
                    visitors.insert(visitor);
                }
            }
            EventKind::Follow => {
                followers_gained += 1;
                if let Some(visitor) = event.visitor.as_deref() {
                    visitors.insert(visitor);
                }
            }
            EventKind::Unfollow => followers_gained -= 1,
            EventKind::ViewerSample => {
                let viewers = event.viewers.unwrap_or(0);
                peak_viewers = peak_viewers.max(viewers);
                samples.push((event.timestamp_ms, viewers));
            }
            EventKind::VisitorSeen => {
                if let Some(visitor) = event.visitor.as_deref() {
                    visitors.insert(visitor);
                }
            }
            EventKind::StreamStart | EventKind::StreamStop => {}
        }
    }

    let avg_viewers = time_weighted_average(&samples, session_end);

    Ok(Rollup {
        total_tokens,
        followers_gained,
        peak_viewers,
        avg_viewers,
        unique_visitors: visitors.len() as i64,
    })
}

fn time_weighted_average(samples: &[(i64, i64)], session_end_ms: i64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for (i, &(timestamp, viewers)) in samples.iter().enumerate() {
        let next = match samples.get(i + 1) {
            Some(&(next_ts, _)) => next_ts,
            None => session_end_ms.max(timestamp),
        };
        let weight = (next - timestamp).clamp(0, MAX_SAMPLE_GAP_MS) as f64;
        weighted_sum += viewers as f64 * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        // All-zero weights (e.g. one sample at the exact session end)
        samples.iter().map(|&(_, v)| v as f64).sum::<f64>() / samples.len() as f64
    }
}

/// Rollup Computer
pub struct RollupComputer {
    db: SqlitePool,
}

impl RollupComputer {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Compute one session's rollup and write it back to the session row
    pub async fn compute_and_update_session(&self, session_id: Uuid) -> Result<Rollup> {
        let session = sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

        let session_events = events::load_session_events(&self.db, session_id).await?;
        let rollup = compute_rollup(&session, &session_events, now_ms())?;

        sessions::update_rollup(&self.db, session_id, &rollup).await?;

        tracing::debug!(
            session_id = %session_id,
            total_tokens = rollup.total_tokens,
            followers_gained = rollup.followers_gained,
            peak_viewers = rollup.peak_viewers,
            unique_visitors = rollup.unique_visitors,
            "Session rollup updated"
        );

        Ok(rollup)
    }

    /// Broadcaster-wide statistics across all sessions; active sessions
    /// count toward total time up to now
    pub async fn aggregate_stats(&self) -> Result<AggregateStats> {
        let all_sessions = sessions::load_sessions(&self.db).await?;
        let now = now_ms();

        let mut stats = AggregateStats::default();
        let mut weighted_viewers = 0.0;

        for session in &all_sessions {
            let duration = session.duration_ms(now);
            stats.total_tokens += session.rollup.total_tokens;
            stats.total_followers += session.rollup.followers_gained;
            stats.peak_viewers = stats.peak_viewers.max(session.rollup.peak_viewers);
            stats.total_ms += duration;
            weighted_viewers += session.rollup.avg_viewers * duration as f64;
        }

        stats.avg_viewers = if stats.total_ms > 0 {
            weighted_viewers / stats.total_ms as f64
        } else {
            0.0
        };

        Ok(stats)
    }
}
