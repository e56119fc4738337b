//! Session-reconstruction services
//!
//! Pipeline order: segment builder → session stitcher → rollup computer,
//! sequenced end-to-end by the rebuild orchestrator.

pub mod rebuild_orchestrator;
pub mod rollup_computer;
pub mod segment_builder;
pub mod session_stitcher;

pub use rebuild_orchestrator::RebuildOrchestrator;
pub use rollup_computer::RollupComputer;
pub use segment_builder::SegmentBuilder;
pub use session_stitcher::SessionStitcher;
