//! Database access for the rebuild engine
//!
//! Events are read-only facts except for their segment/session linkage;
//! segments and stream_sessions are derived artifacts this crate owns.

pub mod events;
pub mod lock;
pub mod segments;
pub mod sessions;
