//! # Ronin Common
//!
//! Common utilities and logging configuration shared by the Ronin offline
//! cache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Wall-clock timestamps for cache entries and history records

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 yields `0` instead of failing.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
