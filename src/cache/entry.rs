//! Cache entry model: values, priorities, and freshness predicates.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Retention priority of a cache entry. HIGH entries survive LRU trims
/// over NORMAL and LOW even when older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CachePriority {
    Low,
    Normal,
    High,
}

impl CachePriority {
    /// Retention rank; higher ranks are kept longer.
    pub fn rank(self) -> u8 {
        match self {
            CachePriority::Low => 0,
            CachePriority::Normal => 1,
            CachePriority::High => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CachePriority::Low => "LOW",
            CachePriority::Normal => "NORMAL",
            CachePriority::High => "HIGH",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "LOW" => Some(CachePriority::Low),
            "NORMAL" => Some(CachePriority::Normal),
            "HIGH" => Some(CachePriority::High),
            _ => None,
        }
    }
}

/// Stored payload. Exactly one representation is populated per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl CacheValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CacheValue::Text(text) => text.as_bytes(),
            CacheValue::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// One cached record with its freshness metadata.
///
/// Invariant: `created_at <= modified_at <= used_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    /// Milliseconds of freshness from `created_at`; `None` never expires.
    pub ttl: Option<u64>,
    /// Milliseconds past expiry during which the entry may still be served.
    pub max_stale: Option<u64>,
    pub etag: Option<String>,
    pub source_uri: Option<String>,
    pub priority: CachePriority,
    pub created_at: u64,
    pub modified_at: u64,
    pub used_at: u64,
}

impl CacheEntry {
    /// Whether the entry's TTL has elapsed at `now`. Additions saturate so
    /// a `u64::MAX` TTL reads as "never expires".
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => self.created_at.saturating_add(ttl) < now,
        }
    }

    /// Whether the entry is past the stale-use window at `now`. An entry
    /// that is not expired is never stale-exceeded; an expired entry with no
    /// max-stale grant is immediately so.
    pub fn stale_use_exceeded(&self, now: u64) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        match (self.ttl, self.max_stale) {
            (_, None) => true,
            (Some(ttl), Some(max_stale)) => {
                self.created_at
                    .saturating_add(ttl)
                    .saturating_add(max_stale)
                    < now
            }
            // Unreachable in practice: expired implies ttl is set.
            (None, Some(_)) => false,
        }
    }

    /// Whether the entry may still be returned to a caller at `now`:
    /// fresh, or expired but within the stale-use window.
    pub fn is_usable(&self, now: u64) -> bool {
        !self.is_expired(now) || !self.stale_use_exceeded(now)
    }

    /// Eviction ordering: entries sorting *later* are evicted first.
    /// Priority dominates, then recency of use, then recency of write.
    pub fn eviction_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .rank()
            .cmp(&self.priority.rank())
            .then(other.used_at.cmp(&self.used_at))
            .then(other.modified_at.cmp(&self.modified_at))
    }
}
