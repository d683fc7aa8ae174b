//! Cache integration layer: entry model, directive parsing, and the
//! pluggable provider contract with its two reference implementations.

pub mod directives;
pub mod entry;
pub mod memory;
pub mod sqlite;

pub use directives::ResponseDirectives;
pub use entry::{CacheEntry, CachePriority, CacheValue};
pub use memory::MemoryCacheProvider;
pub use sqlite::SqliteCacheProvider;

use crate::core::error::CommsResult;

/// Pluggable cache store consumed by the scheduler.
///
/// Implementations do their own locking and must be safe under concurrent
/// readers and writers. Freshness is always evaluated at query time.
pub trait CacheProvider: Send + Sync {
    /// Upsert an entry. An insert stamps `created_at = modified_at =
    /// used_at = now`; an update refreshes `modified_at` and `used_at` but
    /// preserves `created_at`.
    #[allow(clippy::too_many_arguments)]
    fn add(
        &self,
        key: &str,
        value: CacheValue,
        ttl: Option<u64>,
        max_stale: Option<u64>,
        etag: Option<&str>,
        source_uri: Option<&str>,
        priority: CachePriority,
    ) -> CommsResult<()>;

    /// Fetch an entry. An expired entry is only returned when
    /// `allow_expired` is set; a returned entry always has its `used_at`
    /// refreshed to now.
    fn get(&self, key: &str, allow_expired: bool) -> CommsResult<Option<CacheEntry>>;

    /// Number of stored entries, optionally counting expired ones.
    fn size(&self, allow_expired: bool) -> CommsResult<usize>;

    /// Whether `key` is present, subject to the same expiry filter as
    /// [`get`](Self::get). Does not refresh `used_at`.
    fn contains(&self, key: &str, allow_expired: bool) -> CommsResult<bool>;

    /// Remove one entry; returns whether it existed.
    fn remove(&self, key: &str) -> CommsResult<bool>;

    /// Remove every entry.
    fn remove_all(&self) -> CommsResult<()>;

    /// Force an entry to read as expired without removing it; returns
    /// whether it existed.
    fn invalidate(&self, key: &str) -> CommsResult<bool>;

    /// Evict down to the configured capacity using the eviction score
    /// `(priority desc, used_at desc, modified_at desc)`.
    fn trim_lru(&self) -> CommsResult<()>;
}
