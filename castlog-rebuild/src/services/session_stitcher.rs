//! Session stitching
//!
//! Merges segments that represent the same broadcast session under a single
//! tunable: the merge gap. A broadcaster who drops and reconnects within the
//! gap stays in one session.
//!
//! Given the same segment set and merge gap, stitching is deterministic and
//! produces an identical session partition regardless of input ordering;
//! segments are always re-sorted internally.

use std::collections::HashMap;

use sqlx::SqlitePool;
use uuid::Uuid;

use castlog_common::db::models::{Segment, SegmentAssignment, StreamSession};
use castlog_common::Result;

use crate::db::{events, segments, sessions};

/// Output of one stitching pass: sessions plus the segment→session
/// assignments staged for persistence
#[derive(Debug, Clone)]
pub struct StitchResult {
    pub sessions: Vec<StreamSession>,
    pub assignments: Vec<SegmentAssignment>,
}

struct SessionAccumulator {
    started_at_ms: i64,
    /// None once any member segment is open
    ended_at_ms: Option<i64>,
    members: Vec<Uuid>,
}

impl SessionAccumulator {
    fn open_with(segment: &Segment) -> Self {
        Self {
            started_at_ms: segment.started_at_ms,
            ended_at_ms: segment.ended_at_ms,
            members: vec![segment.guid],
        }
    }

    fn absorb(&mut self, segment: &Segment) {
        self.members.push(segment.guid);
        self.ended_at_ms = match (self.ended_at_ms, segment.ended_at_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
    }

    fn flush(self, result: &mut StitchResult) {
        let session = StreamSession::new(self.started_at_ms, self.ended_at_ms);
        for segment_id in self.members {
            result.assignments.push(SegmentAssignment {
                segment_id,
                session_id: session.guid,
            });
        }
        result.sessions.push(session);
    }
}

/// Stitch segments into sessions under the merge-gap rule.
///
/// A segment whose start is exactly `merge_gap_ms` after the running end of
/// the current session is still stitched (closed-interval comparison, chosen
/// for determinism). A session containing an open segment has no end and is
/// Active.
pub fn stitch_segments(segments: &[Segment], merge_gap_ms: i64) -> StitchResult {
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| (s.started_at_ms, s.guid));

    let mut result = StitchResult {
        sessions: Vec::new(),
        assignments: Vec::new(),
    };

    let mut current: Option<SessionAccumulator> = None;

    for segment in sorted {
        match current.as_mut() {
            None => current = Some(SessionAccumulator::open_with(segment)),
            Some(acc) => {
                let joins = match acc.ended_at_ms {
                    // Session still running (open member segment): anything
                    // later is part of it
                    None => true,
                    Some(end) => segment.started_at_ms - end <= merge_gap_ms,
                };
                if joins {
                    acc.absorb(segment);
                } else {
                    let finished =
                        std::mem::replace(acc, SessionAccumulator::open_with(segment));
                    finished.flush(&mut result);
                }
            }
        }
    }

    if let Some(acc) = current {
        acc.flush(&mut result);
    }

    result
}

/// Session Stitcher
pub struct SessionStitcher {
    db: SqlitePool,
}

impl SessionStitcher {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Stitch the unassigned segments in the rebuild window
    pub async fn stitch(&self, from_ms: Option<i64>, merge_gap_ms: i64) -> Result<StitchResult> {
        let loaded = segments::load_segments(&self.db, from_ms).await?;
        let unassigned: Vec<Segment> = loaded
            .into_iter()
            .filter(|s| s.session_id.is_none())
            .collect();

        let result = stitch_segments(&unassigned, merge_gap_ms);
        tracing::info!(
            segment_count = unassigned.len(),
            session_count = result.sessions.len(),
            merge_gap_ms,
            "Stitched segments into sessions"
        );
        Ok(result)
    }

    /// Persist the staged assignments, atomically per session
    pub async fn apply_assignments(&self, result: &StitchResult) -> Result<usize> {
        let mut members: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for assignment in &result.assignments {
            members
                .entry(assignment.session_id)
                .or_default()
                .push(assignment.segment_id);
        }

        for session in &result.sessions {
            let segment_ids = members.remove(&session.guid).unwrap_or_default();
            sessions::persist_session_with_segments(&self.db, session, &segment_ids).await?;
        }

        Ok(result.sessions.len())
    }

    /// Copy session ids from segments onto their events; re-run after every
    /// stitch
    pub async fn propagate_session_ids_to_events(&self) -> Result<u64> {
        events::propagate_session_ids(&self.db).await
    }

    /// Delete all sessions (full rebuild only)
    pub async fn clear_all(&self) -> Result<u64> {
        sessions::clear_all(&self.db).await
    }
}
