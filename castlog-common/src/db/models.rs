//! Database models
//!
//! Plain row mirrors; guid columns are TEXT in SQLite and parsed at the
//! accessor layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Broadcast-platform event kind as recorded by the live listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StreamStart,
    StreamStop,
    ViewerSample,
    Tip,
    Follow,
    Unfollow,
    VisitorSeen,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StreamStart => "stream_start",
            EventKind::StreamStop => "stream_stop",
            EventKind::ViewerSample => "viewer_sample",
            EventKind::Tip => "tip",
            EventKind::Follow => "follow",
            EventKind::Unfollow => "unfollow",
            EventKind::VisitorSeen => "visitor_seen",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stream_start" => Ok(EventKind::StreamStart),
            "stream_stop" => Ok(EventKind::StreamStop),
            "viewer_sample" => Ok(EventKind::ViewerSample),
            "tip" => Ok(EventKind::Tip),
            "follow" => Ok(EventKind::Follow),
            "unfollow" => Ok(EventKind::Unfollow),
            "visitor_seen" => Ok(EventKind::VisitorSeen),
            other => Err(Error::InvalidInput(format!("Unknown event kind: {}", other))),
        }
    }
}

/// Raw event row. Events are immutable facts; only segment/session linkage
/// mutates, and only during a rebuild cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub kind: EventKind,
    pub timestamp_ms: i64,
    /// Tip amount in tokens (tip events)
    pub amount: Option<i64>,
    /// Sampled concurrent viewer count (viewer_sample events)
    pub viewers: Option<i64>,
    /// Visitor identifier (visitor_seen / tip / follow events)
    pub visitor: Option<String>,
    /// Extra payload as JSON text, kind-dependent
    pub payload: Option<String>,
    pub segment_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
}

/// How a segment's bounds were established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Bounded by a stream_start/stream_stop pair
    Explicit,
    /// Inferred from a cluster of orphaned events
    Implicit,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Explicit => "explicit",
            SegmentKind::Implicit => "implicit",
        }
    }
}

impl std::str::FromStr for SegmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "explicit" => Ok(SegmentKind::Explicit),
            "implicit" => Ok(SegmentKind::Implicit),
            other => Err(Error::InvalidInput(format!("Unknown segment kind: {}", other))),
        }
    }
}

/// A maximal contiguous interval of confirmed or inferred broadcast activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub guid: Uuid,
    pub started_at_ms: i64,
    /// None = still open (the live segment)
    pub ended_at_ms: Option<i64>,
    pub kind: SegmentKind,
    pub session_id: Option<Uuid>,
}

impl Segment {
    pub fn new(started_at_ms: i64, ended_at_ms: Option<i64>, kind: SegmentKind) -> Self {
        Self {
            guid: Uuid::new_v4(),
            started_at_ms,
            ended_at_ms,
            kind,
            session_id: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at_ms.is_none()
    }

    /// Closed-interval containment: `[started_at, ended_at]`, open end = +inf
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.started_at_ms
            && self.ended_at_ms.map_or(true, |end| timestamp_ms <= end)
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(Error::InvalidInput(format!("Unknown session status: {}", other))),
        }
    }
}

/// Aggregated statistics for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub total_tokens: i64,
    /// count(follow) - count(unfollow); can go negative
    pub followers_gained: i64,
    pub peak_viewers: i64,
    pub avg_viewers: f64,
    pub unique_visitors: i64,
}

/// One or more segments stitched together under the merge-gap rule;
/// the user-facing unit of "one stream"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub guid: Uuid,
    pub started_at_ms: i64,
    /// None while any constituent segment is still open
    pub ended_at_ms: Option<i64>,
    pub status: SessionStatus,
    pub rollup: Rollup,
}

impl StreamSession {
    pub fn new(started_at_ms: i64, ended_at_ms: Option<i64>) -> Self {
        let status = if ended_at_ms.is_none() {
            SessionStatus::Active
        } else {
            SessionStatus::Ended
        };
        Self {
            guid: Uuid::new_v4(),
            started_at_ms,
            ended_at_ms,
            status,
            rollup: Rollup::default(),
        }
    }

    /// Session duration in milliseconds; active sessions count up to `now_ms`
    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        (self.ended_at_ms.unwrap_or(now_ms) - self.started_at_ms).max(0)
    }
}

/// Staging artifact between stitching and persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub segment_id: Uuid,
    pub session_id: Uuid,
}

/// Broadcaster-wide statistics across all sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_tokens: i64,
    pub total_followers: i64,
    pub peak_viewers: i64,
    /// Duration-weighted mean of per-session averages
    pub avg_viewers: f64,
    /// Sum of session durations; active sessions counted up to "now"
    pub total_ms: i64,
}

impl AggregateStats {
    /// Total broadcast time as minutes with one decimal
    pub fn total_minutes_display(&self) -> String {
        crate::time::format_minutes(self.total_ms)
    }
}
