//! Core abstractions for the dispatch engine.
//!
//! This module provides the foundational types and capability traits the
//! scheduler, cache, and transport layers are built on.

pub mod error;
pub mod priority;
pub mod request;
pub mod response;
pub mod traits;

// Re-export commonly used types
pub use error::{CommsError, CommsResult, TransportError, TransportErrorKind};
pub use priority::{IntervalPromotionPolicy, Priority, StartingPriority};
pub use request::Request;
pub use response::Response;
pub use traits::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the epoch.
///
/// All engine timestamps (cache entries, retry deadlines, promotion ages)
/// share this clock so `created_at <= used_at` comparisons stay coherent.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
