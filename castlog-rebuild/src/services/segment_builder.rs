//! Segment extraction
//!
//! Partitions the event timeline into non-overlapping segments of broadcast
//! activity and assigns every event to its covering segment. Explicit
//! segments come from stream_start/stream_stop pairs; implicit segments are
//! inferred from clusters of orphaned events.
//!
//! Construction is idempotent: re-running on an unchanged event log yields
//! identical segment boundaries.

use sqlx::SqlitePool;
use uuid::Uuid;

use castlog_common::db::models::{Event, EventKind, Segment, SegmentKind};
use castlog_common::time::{format_minutes, MS_PER_MINUTE};
use castlog_common::{Error, Result};

use crate::db::{events, segments};

/// Offset used when a second stream_start forces an implicit close of the
/// segment already open
pub const IMPLICIT_CLOSE_EPSILON_MS: i64 = 1;

/// Maximum gap between consecutive orphaned events for them to share one
/// implicit segment. Deliberately smaller than the default session merge gap
/// so an inferred segment never spans what stitching would treat as two
/// sessions.
pub const ORPHAN_CLUSTER_GAP_MS: i64 = 10 * MS_PER_MINUTE;

/// Data anomaly handled by policy during segment construction.
///
/// Accumulated and reported in the final rebuild summary rather than
/// surfaced per occurrence; never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// A second stream_start arrived while a segment was still open; the
    /// open segment was closed just before the new start
    ImplicitClose {
        open_started_ms: i64,
        closed_at_ms: i64,
        next_start_ms: i64,
    },
    /// A stream_stop with no prior open stream_start was discarded as noise
    DiscardedStop { event_id: i64, at_ms: i64 },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::ImplicitClose {
                open_started_ms,
                closed_at_ms,
                next_start_ms,
            } => write!(
                f,
                "stream_start at {} arrived before the segment open since {} was stopped; \
                 implicitly closed at {}",
                next_start_ms, open_started_ms, closed_at_ms
            ),
            Anomaly::DiscardedStop { event_id, at_ms } => write!(
                f,
                "stream_stop event {} at {} had no open segment; discarded as noise",
                event_id, at_ms
            ),
        }
    }
}

/// Derive explicit segments from stream_start/stream_stop events.
///
/// Events are re-sorted internally by `(timestamp_ms, id)`; other kinds are
/// ignored. A trailing unmatched stream_start yields the open "live"
/// segment.
pub fn derive_segments(events: &[Event]) -> (Vec<Segment>, Vec<Anomaly>) {
    let mut markers: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StreamStart | EventKind::StreamStop))
        .collect();
    markers.sort_by_key(|e| (e.timestamp_ms, e.id));

    let mut segments = Vec::new();
    let mut anomalies = Vec::new();
    let mut open: Option<i64> = None;

    for event in markers {
        match event.kind {
            EventKind::StreamStart => {
                if let Some(started) = open {
                    // Clamped so started_at <= ended_at even for same-ms starts
                    let closed_at =
                        (event.timestamp_ms - IMPLICIT_CLOSE_EPSILON_MS).max(started);
                    tracing::warn!(
                        open_started_ms = started,
                        next_start_ms = event.timestamp_ms,
                        closed_at_ms = closed_at,
                        "stream_start before stream_stop; implicitly closing open segment"
                    );
                    anomalies.push(Anomaly::ImplicitClose {
                        open_started_ms: started,
                        closed_at_ms: closed_at,
                        next_start_ms: event.timestamp_ms,
                    });
                    segments.push(Segment::new(started, Some(closed_at), SegmentKind::Explicit));
                }
                open = Some(event.timestamp_ms);
            }
            EventKind::StreamStop => match open.take() {
                Some(started) => {
                    segments.push(Segment::new(
                        started,
                        Some(event.timestamp_ms.max(started)),
                        SegmentKind::Explicit,
                    ));
                }
                None => {
                    tracing::warn!(
                        event_id = event.id,
                        at_ms = event.timestamp_ms,
                        "stream_stop with no open segment; discarding"
                    );
                    anomalies.push(Anomaly::DiscardedStop {
                        event_id: event.id,
                        at_ms: event.timestamp_ms,
                    });
                }
            },
            _ => {}
        }
    }

    if let Some(started) = open {
        segments.push(Segment::new(started, None, SegmentKind::Explicit));
    }

    (segments, anomalies)
}

/// Match events to their covering segments.
///
/// Containment is the closed interval `[started_at, ended_at]` (open end =
/// +inf); where a segment ends at the exact millisecond the next starts, the
/// earlier segment wins. Returns `(event_id, segment_guid)` assignments plus
/// the events no segment covers (orphans).
pub fn match_events(events: &[Event], segments: &[Segment]) -> (Vec<(i64, Uuid)>, Vec<Event>) {
    let mut segs: Vec<&Segment> = segments.iter().collect();
    segs.sort_by_key(|s| (s.started_at_ms, s.guid));

    let mut evs: Vec<&Event> = events.iter().collect();
    evs.sort_by_key(|e| (e.timestamp_ms, e.id));

    let mut assignments = Vec::new();
    let mut orphans = Vec::new();
    let mut i = 0;

    for event in evs {
        while i < segs.len()
            && segs[i]
                .ended_at_ms
                .map_or(false, |end| end < event.timestamp_ms)
        {
            i += 1;
        }
        if i < segs.len() && segs[i].contains(event.timestamp_ms) {
            assignments.push((event.id, segs[i].guid));
        } else {
            orphans.push(event.clone());
        }
    }

    (assignments, orphans)
}

/// Cluster orphaned events into implicit segments by temporal proximity.
///
/// Consecutive orphans share a cluster while the gap between their
/// timestamps stays below [`ORPHAN_CLUSTER_GAP_MS`]; a cluster also breaks
/// where an existing segment starts inside the gap, so implicit segments
/// never straddle explicit ones. Bounds are the cluster's min/max timestamp.
pub fn cluster_orphans(orphans: &[Event], existing: &[Segment]) -> Vec<Segment> {
    let mut sorted: Vec<&Event> = orphans.iter().collect();
    sorted.sort_by_key(|e| (e.timestamp_ms, e.id));

    let mut clusters = Vec::new();
    let mut current: Option<(i64, i64)> = None;

    for event in sorted {
        let ts = event.timestamp_ms;
        match current {
            None => current = Some((ts, ts)),
            Some((start, end)) => {
                let gap_ok = ts - end < ORPHAN_CLUSTER_GAP_MS;
                let crossed = existing
                    .iter()
                    .any(|s| s.started_at_ms > end && s.started_at_ms < ts);
                if gap_ok && !crossed {
                    current = Some((start, ts));
                } else {
                    clusters.push(Segment::new(start, Some(end), SegmentKind::Implicit));
                    current = Some((ts, ts));
                }
            }
        }
    }

    if let Some((start, end)) = current {
        clusters.push(Segment::new(start, Some(end), SegmentKind::Implicit));
    }

    clusters
}

/// Defensive post-construction validation over the combined segment set.
///
/// Fatal on overlap, negative duration, or more than one open segment; the
/// single open segment must be the last in time order. Continuing past any
/// of these would silently corrupt rollups.
pub fn validate_segments(new: &[Segment], existing: &[Segment]) -> Result<()> {
    let mut all: Vec<&Segment> = new.iter().chain(existing.iter()).collect();
    all.sort_by_key(|s| (s.started_at_ms, s.guid));

    for segment in &all {
        if let Some(end) = segment.ended_at_ms {
            if end < segment.started_at_ms {
                return Err(Error::Invariant(format!(
                    "segment {} has negative duration ({} > {})",
                    segment.guid, segment.started_at_ms, end
                )));
            }
        }
    }

    for pair in all.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        match prev.ended_at_ms {
            None => {
                return Err(Error::Invariant(format!(
                    "open segment {} is followed by segment {} starting at {}",
                    prev.guid, next.guid, next.started_at_ms
                )));
            }
            Some(end) if end > next.started_at_ms => {
                return Err(Error::Invariant(format!(
                    "segments {} and {} overlap ({} > {})",
                    prev.guid, next.guid, end, next.started_at_ms
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Segment Builder
///
/// Holds the pool and sequences load → derive → validate → persist for each
/// operation; the boundary math itself is in the pure functions above.
pub struct SegmentBuilder {
    db: SqlitePool,
}

impl SegmentBuilder {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Build explicit segments from the event log, optionally from a cursor
    pub async fn build_segments(
        &self,
        from_ms: Option<i64>,
    ) -> Result<(Vec<Segment>, Vec<Anomaly>)> {
        let events = events::load_events(&self.db, from_ms).await?;
        let (new_segments, anomalies) = derive_segments(&events);

        let existing = segments::load_segments(&self.db, None).await?;
        validate_segments(&new_segments, &existing)?;

        segments::insert_segments(&self.db, &new_segments).await?;

        tracing::info!(
            segment_count = new_segments.len(),
            anomaly_count = anomalies.len(),
            "Built explicit segments"
        );

        Ok((new_segments, anomalies))
    }

    /// Assign every unassigned event to its covering segment.
    ///
    /// Returns `(assigned, orphaned)` counts; orphans are left for
    /// [`Self::build_implicit_segments`].
    pub async fn assign_all_events_to_segments(
        &self,
        from_ms: Option<i64>,
    ) -> Result<(u64, u64)> {
        let unassigned = events::load_unassigned_events(&self.db, from_ms).await?;
        let all_segments = segments::load_segments(&self.db, None).await?;

        let (assignments, orphans) = match_events(&unassigned, &all_segments);
        let assigned = events::assign_segments(&self.db, &assignments).await?;

        tracing::info!(
            assigned,
            orphaned = orphans.len(),
            "Assigned events to segments"
        );

        Ok((assigned, orphans.len() as u64))
    }

    /// Infer implicit segments from the remaining orphaned events
    pub async fn build_implicit_segments(&self, from_ms: Option<i64>) -> Result<Vec<Segment>> {
        let orphans = events::load_unassigned_events(&self.db, from_ms).await?;
        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let existing = segments::load_segments(&self.db, None).await?;
        let clusters = cluster_orphans(&orphans, &existing);
        validate_segments(&clusters, &existing)?;

        segments::insert_segments(&self.db, &clusters).await?;

        for cluster in &clusters {
            tracing::debug!(
                segment_id = %cluster.guid,
                started_at_ms = cluster.started_at_ms,
                ended_at_ms = ?cluster.ended_at_ms,
                span_minutes = %format_minutes(
                    cluster.ended_at_ms.unwrap_or(cluster.started_at_ms) - cluster.started_at_ms
                ),
                "Inferred implicit segment from orphan cluster"
            );
        }

        Ok(clusters)
    }

    /// Delete all segments (full rebuild only); does not touch events
    pub async fn clear_all(&self) -> Result<u64> {
        segments::clear_all(&self.db).await
    }
}
