//! courier — a client-side HTTP request-dispatch engine.
//!
//! The engine accepts submitted units of work from arbitrary producers,
//! unifies duplicate submissions by request fingerprint, consults a
//! pluggable response cache, dispatches permitted work to the network with
//! bounded concurrency, and interprets responses for cache, retry, and
//! redirect directives before releasing all waiters.

pub mod cache;
pub mod config;
pub mod core;
pub mod logging;
pub mod scheduler;
pub mod transport;

// Re-export the surface most embedders need.
pub use crate::cache::{CacheProvider, MemoryCacheProvider, SqliteCacheProvider};
pub use crate::config::EngineConfig;
pub use crate::core::{CommsError, CommsResult, Request, Response, StartingPriority};
pub use crate::scheduler::{
    CacheBehavior, CommsManager, CommsManagerBuilder, Submission, Work, WorkState,
};
pub use crate::transport::HttpExecutor;
