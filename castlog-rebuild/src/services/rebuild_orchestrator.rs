//! Rebuild Orchestrator
//!
//! Sequences the full session-reconstruction pipeline as an explicit state
//! machine:
//!
//! ```text
//! Idle → ClearingOldData → BuildingExplicitSegments → AssigningEvents
//!      → BuildingImplicitSegments → ReassigningEvents → Stitching
//!      → ApplyingAssignments → PropagatingSessionIds → ComputingRollups → Done
//! ```
//!
//! The whole cycle is idempotent: re-running over an unchanged event log
//! converges to the same sessions and rollups. Data anomalies are accumulated
//! into the final report and never abort the run; invariant violations abort
//! immediately.

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use castlog_common::db::models::{AggregateStats, StreamSession};
use castlog_common::db::settings;
use castlog_common::time::minutes_to_ms;
use castlog_common::{Error, Result};

use crate::db::{events, lock, segments, sessions};
use crate::services::rollup_computer::RollupComputer;
use crate::services::segment_builder::{Anomaly, SegmentBuilder};
use crate::services::session_stitcher::SessionStitcher;

/// Pipeline state, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
    Idle,
    ClearingOldData,
    BuildingExplicitSegments,
    AssigningEvents,
    BuildingImplicitSegments,
    ReassigningEvents,
    Stitching,
    ApplyingAssignments,
    PropagatingSessionIds,
    ComputingRollups,
    Done,
}

impl std::fmt::Display for RebuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RebuildStep::Idle => "idle",
            RebuildStep::ClearingOldData => "clearing_old_data",
            RebuildStep::BuildingExplicitSegments => "building_explicit_segments",
            RebuildStep::AssigningEvents => "assigning_events",
            RebuildStep::BuildingImplicitSegments => "building_implicit_segments",
            RebuildStep::ReassigningEvents => "reassigning_events",
            RebuildStep::Stitching => "stitching",
            RebuildStep::ApplyingAssignments => "applying_assignments",
            RebuildStep::PropagatingSessionIds => "propagating_session_ids",
            RebuildStep::ComputingRollups => "computing_rollups",
            RebuildStep::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// One rebuild invocation's parameters
#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    /// Rebuild only artifacts starting at or after this timestamp; None
    /// rebuilds everything
    pub from_ms: Option<i64>,
    /// Report what a rebuild would touch without mutating anything
    pub dry_run: bool,
    /// Override the stored merge gap for this run only
    pub merge_gap_minutes_override: Option<i64>,
}

/// Completed step with a one-line summary of what it did
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: RebuildStep,
    pub detail: String,
}

/// Final rebuild summary returned to the caller
#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub dry_run: bool,
    pub merge_gap_minutes: i64,
    pub ai_summary_delay_minutes: Option<i64>,
    pub steps: Vec<StepReport>,
    pub anomalies: Vec<Anomaly>,
    pub sessions: Vec<StreamSession>,
    pub aggregate: Option<AggregateStats>,
}

impl std::fmt::Display for RebuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dry_run {
            writeln!(f, "Rebuild (dry run)")?;
        } else {
            writeln!(f, "Rebuild complete")?;
        }
        writeln!(f, "  merge gap: {} minutes", self.merge_gap_minutes)?;
        if let Some(delay) = self.ai_summary_delay_minutes {
            writeln!(f, "  ai summary delay: {} minutes", delay)?;
        }

        for step in &self.steps {
            writeln!(f, "  [{}] {}", step.step, step.detail)?;
        }

        if !self.anomalies.is_empty() {
            writeln!(f, "Anomalies ({}):", self.anomalies.len())?;
            for anomaly in &self.anomalies {
                writeln!(f, "  - {}", anomaly)?;
            }
        }

        if !self.sessions.is_empty() {
            writeln!(f, "Sessions ({}):", self.sessions.len())?;
            for session in &self.sessions {
                writeln!(
                    f,
                    "  {} [{}] start={} end={:?} tokens={} followers={} peak={} avg={:.1} visitors={}",
                    session.guid,
                    session.status.as_str(),
                    session.started_at_ms,
                    session.ended_at_ms,
                    session.rollup.total_tokens,
                    session.rollup.followers_gained,
                    session.rollup.peak_viewers,
                    session.rollup.avg_viewers,
                    session.rollup.unique_visitors,
                )?;
            }
        }

        if let Some(aggregate) = &self.aggregate {
            writeln!(
                f,
                "Totals: {} tokens, {} followers, peak {} viewers, avg {:.1} viewers, {} minutes live",
                aggregate.total_tokens,
                aggregate.total_followers,
                aggregate.peak_viewers,
                aggregate.avg_viewers,
                aggregate.total_minutes_display(),
            )?;
        }

        Ok(())
    }
}

/// Rebuild Orchestrator
///
/// Holds the pool and a cancellation token; checks the token between steps so
/// shutdown never interrupts a step mid-transaction.
pub struct RebuildOrchestrator {
    db: SqlitePool,
    cancel: CancellationToken,
}

impl RebuildOrchestrator {
    pub fn new(db: SqlitePool, cancel: CancellationToken) -> Self {
        Self { db, cancel }
    }

    /// Run one full rebuild cycle and return the report.
    ///
    /// Holds the rebuild lock from ClearingOldData through
    /// PropagatingSessionIds; rollup computation reads committed linkage and
    /// runs unlocked.
    pub async fn run(&self, options: &RebuildOptions) -> Result<RebuildReport> {
        let merge_gap_minutes = match options.merge_gap_minutes_override {
            Some(minutes) if minutes >= 0 => minutes,
            Some(minutes) => {
                return Err(Error::InvalidInput(format!(
                    "merge gap must be >= 0, got {}",
                    minutes
                )));
            }
            None => settings::get_merge_gap_minutes(&self.db).await?,
        };
        let ai_summary_delay_minutes =
            settings::get_ai_summary_delay_minutes(&self.db).await?;

        let mut report = RebuildReport {
            dry_run: options.dry_run,
            merge_gap_minutes,
            ai_summary_delay_minutes,
            steps: Vec::new(),
            anomalies: Vec::new(),
            sessions: Vec::new(),
            aggregate: None,
        };

        if options.dry_run {
            self.dry_run_report(options, &mut report).await?;
            return Ok(report);
        }

        tracing::info!(
            from_ms = ?options.from_ms,
            merge_gap_minutes,
            "Starting rebuild"
        );

        lock::acquire(&self.db).await?;
        let locked = self
            .run_locked_phases(options, minutes_to_ms(merge_gap_minutes), &mut report)
            .await;
        // The lock must come off on every path; rollups run unlocked
        lock::release(&self.db).await?;
        locked?;

        self.check_cancelled()?;
        self.compute_rollups(&mut report).await?;

        report.steps.push(StepReport {
            step: RebuildStep::Done,
            detail: format!(
                "{} sessions, {} anomalies",
                report.sessions.len(),
                report.anomalies.len()
            ),
        });
        tracing::info!(
            session_count = report.sessions.len(),
            anomaly_count = report.anomalies.len(),
            "Rebuild complete"
        );

        Ok(report)
    }

    /// ClearingOldData through PropagatingSessionIds, under the rebuild lock
    async fn run_locked_phases(
        &self,
        options: &RebuildOptions,
        merge_gap_ms: i64,
        report: &mut RebuildReport,
    ) -> Result<()> {
        let builder = SegmentBuilder::new(self.db.clone());
        let stitcher = SessionStitcher::new(self.db.clone());

        // ClearingOldData. A segment or session that starts before the cursor
        // but is still running at it must be rebuilt whole, so the cursor is
        // clamped back to the earliest such start before anything is deleted.
        // Otherwise a straddling session would survive with an end past its
        // remaining segments, or a stale open segment would trip validation.
        self.check_cancelled()?;
        let window = match options.from_ms {
            None => None,
            Some(from) => Some(self.clamp_cursor(from).await?),
        };
        let (cleared_segments, cleared_sessions, cleared_links) = match window {
            None => {
                let segments = segments::clear_all(&self.db).await?;
                let sessions = sessions::clear_all(&self.db).await?;
                let links = events::clear_linkage(&self.db, None).await?;
                (segments, sessions, links)
            }
            Some(from) => {
                let segments = segments::clear_from(&self.db, from).await?;
                let sessions = sessions::clear_from(&self.db, from).await?;
                let links = events::clear_linkage(&self.db, Some(from)).await?;
                (segments, sessions, links)
            }
        };
        report.steps.push(StepReport {
            step: RebuildStep::ClearingOldData,
            detail: format!(
                "cleared {} segments, {} sessions, {} event links",
                cleared_segments, cleared_sessions, cleared_links
            ),
        });

        // BuildingExplicitSegments
        self.check_cancelled()?;
        let (explicit, anomalies) = builder.build_segments(window).await?;
        report.anomalies.extend(anomalies);
        report.steps.push(StepReport {
            step: RebuildStep::BuildingExplicitSegments,
            detail: format!("built {} explicit segments", explicit.len()),
        });

        // AssigningEvents
        self.check_cancelled()?;
        let (assigned, orphaned) = builder
            .assign_all_events_to_segments(window)
            .await?;
        report.steps.push(StepReport {
            step: RebuildStep::AssigningEvents,
            detail: format!("assigned {} events, {} orphaned", assigned, orphaned),
        });

        // BuildingImplicitSegments
        self.check_cancelled()?;
        let implicit = builder.build_implicit_segments(window).await?;
        report.steps.push(StepReport {
            step: RebuildStep::BuildingImplicitSegments,
            detail: format!("inferred {} implicit segments", implicit.len()),
        });

        // ReassigningEvents: after implicit construction every event in the
        // window must have a covering segment
        self.check_cancelled()?;
        let (reassigned, still_orphaned) = builder
            .assign_all_events_to_segments(window)
            .await?;
        if still_orphaned > 0 {
            return Err(Error::Invariant(format!(
                "{} events remain orphaned after implicit segment construction",
                still_orphaned
            )));
        }
        report.steps.push(StepReport {
            step: RebuildStep::ReassigningEvents,
            detail: format!("assigned {} remaining events", reassigned),
        });

        // Stitching
        self.check_cancelled()?;
        let stitched = stitcher.stitch(window, merge_gap_ms).await?;
        report.steps.push(StepReport {
            step: RebuildStep::Stitching,
            detail: format!(
                "stitched {} segments into {} sessions",
                stitched.assignments.len(),
                stitched.sessions.len()
            ),
        });

        // ApplyingAssignments
        self.check_cancelled()?;
        let applied = stitcher.apply_assignments(&stitched).await?;
        report.steps.push(StepReport {
            step: RebuildStep::ApplyingAssignments,
            detail: format!("persisted {} sessions", applied),
        });

        // PropagatingSessionIds
        self.check_cancelled()?;
        let propagated = stitcher.propagate_session_ids_to_events().await?;
        report.steps.push(StepReport {
            step: RebuildStep::PropagatingSessionIds,
            detail: format!("propagated session ids onto {} events", propagated),
        });

        Ok(())
    }

    /// Pull the rebuild cursor back to the start of the earliest stored
    /// session or segment still running at it, so straddling artifacts are
    /// deleted whole and rebuilt rather than truncated in place
    async fn clamp_cursor(&self, from_ms: i64) -> Result<i64> {
        let mut clamped = from_ms;
        if let Some(start) = sessions::earliest_start_overlapping(&self.db, from_ms).await? {
            clamped = clamped.min(start);
        }
        if let Some(start) = segments::earliest_start_overlapping(&self.db, from_ms).await? {
            clamped = clamped.min(start);
        }
        if clamped < from_ms {
            tracing::info!(
                from_ms,
                clamped_ms = clamped,
                "Cursor falls inside a stored session; rebuilding it whole"
            );
        }
        Ok(clamped)
    }

    /// ComputingRollups plus the aggregate; loads every session so partial
    /// rebuilds still report the full picture
    async fn compute_rollups(&self, report: &mut RebuildReport) -> Result<()> {
        let computer = RollupComputer::new(self.db.clone());

        let mut rolled = Vec::new();
        for session in sessions::load_sessions(&self.db).await? {
            let rollup = computer.compute_and_update_session(session.guid).await?;
            rolled.push(StreamSession { rollup, ..session });
        }
        report.steps.push(StepReport {
            step: RebuildStep::ComputingRollups,
            detail: format!("computed rollups for {} sessions", rolled.len()),
        });

        report.sessions = rolled;
        report.aggregate = Some(computer.aggregate_stats().await?);
        Ok(())
    }

    /// Dry run: read-only counts of what a real run would touch
    async fn dry_run_report(
        &self,
        options: &RebuildOptions,
        report: &mut RebuildReport,
    ) -> Result<()> {
        let event_count = events::count_events(&self.db, options.from_ms).await?;
        let segment_count = segments::count_segments(&self.db).await?;
        let session_count = sessions::count_sessions(&self.db).await?;

        report.steps.push(StepReport {
            step: RebuildStep::Idle,
            detail: format!(
                "would rebuild from {} events ({} segments and {} sessions stored)",
                event_count, segment_count, session_count
            ),
        });
        report.sessions = sessions::load_sessions(&self.db).await?;

        tracing::info!(
            event_count,
            segment_count,
            session_count,
            "Dry run; no data modified"
        );
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Internal("rebuild cancelled".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castlog_common::db::init_tables;
    use castlog_common::db::models::{EventKind, SessionStatus};
    use castlog_common::time::MS_PER_MINUTE;
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

    async fn append(
        pool: &SqlitePool,
        kind: EventKind,
        minute: i64,
        amount: Option<i64>,
        viewers: Option<i64>,
        visitor: Option<&str>,
    ) {
        events::append_event(pool, kind, minute * MS_PER_MINUTE, amount, viewers, visitor)
            .await
            .unwrap();
    }

    fn orchestrator(pool: &SqlitePool) -> RebuildOrchestrator {
        RebuildOrchestrator::new(pool.clone(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_full_rebuild_two_segments_one_session() {
        let pool = setup_test_db().await;
        // 09:00-09:30 and 09:50-10:10, 20-minute gap: one session at the
        // default 30-minute merge gap
        append(&pool, EventKind::StreamStart, 540, None, None, None).await;
        append(&pool, EventKind::ViewerSample, 550, None, Some(12), None).await;
        append(&pool, EventKind::Tip, 560, Some(25), None, Some("v1")).await;
        append(&pool, EventKind::StreamStop, 570, None, None, None).await;
        append(&pool, EventKind::StreamStart, 590, None, None, None).await;
        append(&pool, EventKind::Follow, 595, None, None, Some("v2")).await;
        append(&pool, EventKind::StreamStop, 610, None, None, None).await;

        let report = orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap();

        assert_eq!(report.sessions.len(), 1);
        let session = &report.sessions[0];
        assert_eq!(session.started_at_ms, 540 * MS_PER_MINUTE);
        assert_eq!(session.ended_at_ms, Some(610 * MS_PER_MINUTE));
        assert_eq!(session.rollup.total_tokens, 25);
        assert_eq!(session.rollup.followers_gained, 1);
        assert_eq!(session.rollup.peak_viewers, 12);
        assert_eq!(session.rollup.unique_visitors, 2);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.steps.last().unwrap().step, RebuildStep::Done);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::Tip, 10, Some(5), None, Some("v1")).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;
        append(&pool, EventKind::ViewerSample, 120, None, Some(7), None).await;

        let orch = orchestrator(&pool);
        let first = orch.run(&RebuildOptions::default()).await.unwrap();
        let second = orch.run(&RebuildOptions::default()).await.unwrap();

        let shape = |r: &RebuildReport| {
            r.sessions
                .iter()
                .map(|s| (s.started_at_ms, s.ended_at_ms, s.rollup.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(sessions::count_sessions(&pool).await.unwrap(), second.sessions.len() as i64);
    }

    #[tokio::test]
    async fn test_orphan_cluster_becomes_implicit_session() {
        let pool = setup_test_db().await;
        // No start/stop markers at all, just activity around noon
        append(&pool, EventKind::ViewerSample, 720, None, Some(3), None).await;
        append(&pool, EventKind::Tip, 722, Some(10), None, Some("v1")).await;
        append(&pool, EventKind::ViewerSample, 725, None, Some(5), None).await;

        let report = orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap();

        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].started_at_ms, 720 * MS_PER_MINUTE);
        assert_eq!(report.sessions[0].ended_at_ms, Some(725 * MS_PER_MINUTE));
        assert_eq!(report.sessions[0].rollup.total_tokens, 10);
    }

    #[tokio::test]
    async fn test_trailing_start_yields_active_session() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 480, None, None, None).await;
        append(&pool, EventKind::ViewerSample, 490, None, Some(50), None).await;

        let report = orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap();

        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].status, SessionStatus::Active);
        assert_eq!(report.sessions[0].ended_at_ms, None);
    }

    #[tokio::test]
    async fn test_anomalies_reported_not_fatal() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStop, 10, None, None, None).await;
        append(&pool, EventKind::StreamStart, 20, None, None, None).await;
        append(&pool, EventKind::StreamStart, 40, None, None, None).await;
        append(&pool, EventKind::StreamStop, 60, None, None, None).await;

        let report = orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap();

        assert_eq!(report.anomalies.len(), 2);
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::DiscardedStop { .. })));
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::ImplicitClose { .. })));
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;

        let report = orchestrator(&pool)
            .run(&RebuildOptions {
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(segments::count_segments(&pool).await.unwrap(), 0);
        assert_eq!(sessions::count_sessions(&pool).await.unwrap(), 0);
        // Lock never taken
        lock::acquire(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_gap_override_splits_sessions() {
        let pool = setup_test_db().await;
        // 20-minute gap between segments
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;
        append(&pool, EventKind::StreamStart, 50, None, None, None).await;
        append(&pool, EventKind::StreamStop, 70, None, None, None).await;

        let orch = orchestrator(&pool);
        let merged = orch.run(&RebuildOptions::default()).await.unwrap();
        assert_eq!(merged.sessions.len(), 1);

        let split = orch
            .run(&RebuildOptions {
                merge_gap_minutes_override: Some(15),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(split.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;

        orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap();
        lock::acquire(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_held_lock_rejects_rebuild() {
        let pool = setup_test_db().await;
        lock::acquire(&pool).await.unwrap();

        let err = orchestrator(&pool)
            .run(&RebuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_mutation() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;

        let token = CancellationToken::new();
        token.cancel();
        let orch = RebuildOrchestrator::new(pool.clone(), token);

        assert!(orch.run(&RebuildOptions::default()).await.is_err());
        assert_eq!(segments::count_segments(&pool).await.unwrap(), 0);
        // Lock was released on the error path
        lock::acquire(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_inside_session_rebuilds_it_whole() {
        let pool = setup_test_db().await;
        // 00:00-00:30 and 00:50-01:10, stitched into one session 0-70
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;
        append(&pool, EventKind::StreamStart, 50, None, None, None).await;
        append(&pool, EventKind::StreamStop, 70, None, None, None).await;

        let orch = orchestrator(&pool);
        orch.run(&RebuildOptions::default()).await.unwrap();

        // Cursor lands in the merge gap between the session's two segments
        let report = orch
            .run(&RebuildOptions {
                from_ms: Some(40 * MS_PER_MINUTE),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].started_at_ms, 0);
        assert_eq!(report.sessions[0].ended_at_ms, Some(70 * MS_PER_MINUTE));

        // Each session's end is the max end over its own segments
        let stored = segments::load_segments(&pool, None).await.unwrap();
        for session in &report.sessions {
            let member_max_end = stored
                .iter()
                .filter(|s| s.session_id == Some(session.guid))
                .map(|s| s.ended_at_ms)
                .max()
                .unwrap();
            assert_eq!(session.ended_at_ms, member_max_end);
        }

        // No overlap double-counted in the aggregate
        let aggregate = report.aggregate.unwrap();
        assert_eq!(aggregate.total_ms, 70 * MS_PER_MINUTE);
    }

    #[tokio::test]
    async fn test_incremental_rebuild_past_live_segment_closes_it() {
        let pool = setup_test_db().await;
        // Broadcast still live at the first rebuild
        append(&pool, EventKind::StreamStart, 10, None, None, None).await;

        let orch = orchestrator(&pool);
        let live = orch.run(&RebuildOptions::default()).await.unwrap();
        assert_eq!(live.sessions[0].status, SessionStatus::Active);

        // The stop arrives, plus a later broadcast; cursor past the live start
        append(&pool, EventKind::StreamStop, 45, None, None, None).await;
        append(&pool, EventKind::StreamStart, 100, None, None, None).await;
        append(&pool, EventKind::StreamStop, 120, None, None, None).await;

        let report = orch
            .run(&RebuildOptions {
                from_ms: Some(50 * MS_PER_MINUTE),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.sessions.len(), 2);
        assert_eq!(report.sessions[0].started_at_ms, 10 * MS_PER_MINUTE);
        assert_eq!(report.sessions[0].ended_at_ms, Some(45 * MS_PER_MINUTE));
        assert_eq!(report.sessions[1].started_at_ms, 100 * MS_PER_MINUTE);
        assert!(report
            .sessions
            .iter()
            .all(|s| s.status == SessionStatus::Ended));
    }

    #[tokio::test]
    async fn test_incremental_rebuild_preserves_earlier_sessions() {
        let pool = setup_test_db().await;
        append(&pool, EventKind::StreamStart, 0, None, None, None).await;
        append(&pool, EventKind::StreamStop, 30, None, None, None).await;

        let orch = orchestrator(&pool);
        let first = orch.run(&RebuildOptions::default()).await.unwrap();
        let early_guid = first.sessions[0].guid;

        // New activity well past the merge gap
        append(&pool, EventKind::StreamStart, 600, None, None, None).await;
        append(&pool, EventKind::StreamStop, 630, None, None, None).await;

        let second = orch
            .run(&RebuildOptions {
                from_ms: Some(500 * MS_PER_MINUTE),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(second.sessions.len(), 2);
        // The earlier session survived untouched
        assert!(second.sessions.iter().any(|s| s.guid == early_guid));
    }
}
