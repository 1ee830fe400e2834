//! # Ronin Offline Cache
//!
//! Offline cache orchestration for the Ronin client: keeps serving previously
//! loaded assets when the network is gone, picks up new deploys without
//! serving stale application code forever, and never deletes the only
//! generation a client can read from.
//!
//! ## Features
//!
//! - **Cache Store**: generation-scoped request/response storage, in memory
//!   or on disk
//! - **Generation Registry**: which generation is current, install commits,
//!   promotion and reaping of superseded generations
//! - **Fetch Router**: network-first, cache-first-refresh (stale while
//!   revalidate) and bypass policies
//! - **Lifecycle Controller**: install → waiting → activating → active, with a
//!   manual `SKIP_WAITING` override
//!
//! ## Architecture
//!
//! ```text
//! LifecycleController
//!     │
//!     ├── GenerationRegistry ── current / installing / installed
//!     │       └── CacheStorage (Memory | Disk)
//!     │               └── Generation
//!     │                       └── RequestKey → CacheEntry
//!     │
//!     └── FetchRouter
//!             ├── RoutingRules::classify
//!             └── Fetcher (network)
//! ```

use thiserror::Error;

pub mod config;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod store;

pub use config::{AssetManifest, Release, SwConfig, DEFAULT_CACHE_VERSION, FONT_STYLESHEET_URL};
pub use lifecycle::{ClientId, ControllerMessage, LifecycleController, LifecycleEvent, WorkerState};
pub use registry::GenerationRegistry;
pub use router::{
    offline_response, FetchRouter, ResponseSource, Routed, RoutingPolicy, RoutingRules,
    OFFLINE_DOCUMENT,
};
pub use store::{
    CacheEntry, CacheHandle, CacheStorage, DiskCacheStorage, GenerationId, MemoryCacheStorage,
    RequestKey,
};

use ronin_net::NetError;

// ==================== Errors ====================

/// Errors that can occur in offline cache operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Generation absent: {0}")]
    GenerationAbsent(GenerationId),

    #[error("Generation {0} is current and cannot be replaced")]
    GenerationInUse(GenerationId),

    #[error("Generation {0} has no committed install")]
    NotInstalled(GenerationId),

    #[error("Generation {0} is not current")]
    NotCurrent(GenerationId),

    #[error("Install of {generation} failed on {asset}: {reason}")]
    InstallFailed {
        generation: GenerationId,
        asset: String,
        reason: String,
    },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
