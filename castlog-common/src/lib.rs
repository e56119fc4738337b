//! # Castlog Common Library
//!
//! Shared code for the castlog tools:
//! - Database pool initialization and schema
//! - Row models (events, segments, sessions)
//! - Settings accessors
//! - Error types
//! - Time helpers (epoch milliseconds, minute rendering)

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
