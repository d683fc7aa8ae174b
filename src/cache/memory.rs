//! Volatile in-memory cache provider.

use dashmap::DashMap;

use crate::core::error::CommsResult;

use super::entry::{CacheEntry, CachePriority, CacheValue};
use super::CacheProvider;

/// Hash-map backed provider keyed `namespace:key`. Suitable for tests and
/// short-lived processes; nothing survives a restart.
pub struct MemoryCacheProvider {
    namespace: String,
    capacity: usize,
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheProvider {
    pub fn new(namespace: impl Into<String>, capacity: usize) -> Self {
        Self {
            namespace: namespace.into(),
            capacity,
            entries: DashMap::new(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn add(
        &self,
        key: &str,
        value: CacheValue,
        ttl: Option<u64>,
        max_stale: Option<u64>,
        etag: Option<&str>,
        source_uri: Option<&str>,
        priority: CachePriority,
    ) -> CommsResult<()> {
        let now = crate::core::epoch_ms();
        match self.entries.get_mut(&self.storage_key(key)) {
            Some(mut existing) => {
                let entry = existing.value_mut();
                entry.value = value;
                entry.ttl = ttl;
                entry.max_stale = max_stale;
                entry.etag = etag.map(str::to_string);
                entry.source_uri = source_uri.map(str::to_string);
                entry.priority = priority;
                entry.modified_at = now;
                entry.used_at = now;
            }
            None => {
                self.entries.insert(
                    self.storage_key(key),
                    CacheEntry {
                        key: key.to_string(),
                        value,
                        ttl,
                        max_stale,
                        etag: etag.map(str::to_string),
                        source_uri: source_uri.map(str::to_string),
                        priority,
                        created_at: now,
                        modified_at: now,
                        used_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    fn get(&self, key: &str, allow_expired: bool) -> CommsResult<Option<CacheEntry>> {
        let now = crate::core::epoch_ms();
        match self.entries.get_mut(&self.storage_key(key)) {
            Some(mut guard) => {
                let entry = guard.value_mut();
                if entry.is_expired(now) && !allow_expired {
                    return Ok(None);
                }
                entry.used_at = now;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    fn size(&self, allow_expired: bool) -> CommsResult<usize> {
        if allow_expired {
            return Ok(self.entries.len());
        }
        let now = crate::core::epoch_ms();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count())
    }

    fn contains(&self, key: &str, allow_expired: bool) -> CommsResult<bool> {
        let now = crate::core::epoch_ms();
        Ok(self
            .entries
            .get(&self.storage_key(key))
            .map(|entry| allow_expired || !entry.is_expired(now))
            .unwrap_or(false))
    }

    fn remove(&self, key: &str) -> CommsResult<bool> {
        Ok(self.entries.remove(&self.storage_key(key)).is_some())
    }

    fn remove_all(&self) -> CommsResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn invalidate(&self, key: &str) -> CommsResult<bool> {
        let now = crate::core::epoch_ms();
        match self.entries.get_mut(&self.storage_key(key)) {
            Some(mut guard) => {
                let entry = guard.value_mut();
                let ttl = entry.ttl.unwrap_or(0);
                entry.ttl = Some(ttl);
                entry.created_at = now.saturating_sub(ttl).saturating_sub(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn trim_lru(&self) -> CommsResult<()> {
        if self.entries.len() <= self.capacity {
            return Ok(());
        }
        let mut snapshot: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        snapshot.sort_by(|a, b| a.eviction_cmp(b));

        let evict: Vec<String> = snapshot
            .iter()
            .skip(self.capacity)
            .map(|entry| self.storage_key(&entry.key))
            .collect();
        for storage_key in evict {
            self.entries.remove(&storage_key);
        }
        log::debug!(
            "Trimmed memory cache to {} entries (cap {})",
            self.entries.len(),
            self.capacity
        );
        Ok(())
    }
}
