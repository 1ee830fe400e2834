//! Ronin Core Library
//!
//! This crate provides shared types, errors, configuration and the
//! generation history store for the Ronin client.

pub mod config;
pub mod error;
pub mod history;
pub mod types;

pub use config::AppConfig;
pub use error::{RoninError, RoninResult};
pub use history::{HistoryStore, LocalStorage};
pub use types::HistoryItem;
