//! castlog-rebuild - Session Reconstruction Engine
//!
//! Rebuilds clean, queryable broadcast sessions from the raw event log:
//! segment extraction (explicit and implicit), session stitching under the
//! merge-gap rule, event linkage, and per-session/aggregate rollups, driven
//! by an idempotent rebuild orchestrator with a dry-run mode.

pub mod db;
pub mod services;

pub use services::rebuild_orchestrator::{
    RebuildOptions, RebuildOrchestrator, RebuildReport, RebuildStep,
};
