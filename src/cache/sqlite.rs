//! Durable cache provider backed by SQLite.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::error::{CommsError, CommsResult};

use super::entry::{CacheEntry, CachePriority, CacheValue};
use super::CacheProvider;

/// Tabular store surviving process restarts. Freshness predicates are
/// evaluated in Rust after the row fetch, so a present-but-expired row
/// reads as a plain miss when expired entries are not allowed.
pub struct SqliteCacheProvider {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl SqliteCacheProvider {
    /// Open (or create) the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> CommsResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn, capacity)
    }

    /// Fully in-memory database; used by tests and useful for tooling.
    pub fn open_in_memory(capacity: usize) -> CommsResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, capacity)
    }

    fn with_connection(conn: Connection, capacity: usize) -> CommsResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )
        .map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                key          TEXT NOT NULL UNIQUE,
                value_string TEXT,
                value_bytes  BLOB,
                created_at   INTEGER NOT NULL,
                modified_at  INTEGER NOT NULL,
                used_at      INTEGER NOT NULL,
                ttl          INTEGER,
                max_stale    INTEGER,
                source_uri   TEXT,
                etag         TEXT,
                priority     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_used ON cache(used_at);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            capacity,
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
        let key: String = row.get("key")?;
        let value_string: Option<String> = row.get("value_string")?;
        let value_bytes: Option<Vec<u8>> = row.get("value_bytes")?;
        let value = match (value_string, value_bytes) {
            (Some(text), _) => CacheValue::Text(text),
            (None, Some(bytes)) => CacheValue::Bytes(bytes),
            (None, None) => CacheValue::Bytes(Vec::new()),
        };
        let priority: String = row.get("priority")?;
        Ok(CacheEntry {
            key,
            value,
            ttl: row.get::<_, Option<i64>>("ttl")?.map(|v| v as u64),
            max_stale: row.get::<_, Option<i64>>("max_stale")?.map(|v| v as u64),
            etag: row.get("etag")?,
            source_uri: row.get("source_uri")?,
            priority: CachePriority::from_str(&priority).unwrap_or(CachePriority::Normal),
            created_at: row.get::<_, i64>("created_at")? as u64,
            modified_at: row.get::<_, i64>("modified_at")? as u64,
            used_at: row.get::<_, i64>("used_at")? as u64,
        })
    }
}

fn db_err(err: rusqlite::Error) -> CommsError {
    CommsError::Cache(err.to_string())
}

// Expiry filter usable inside WHERE clauses; mirrors CacheEntry::is_expired.
const FRESH_PREDICATE: &str = "(ttl IS NULL OR created_at + ttl >= ?1)";

impl CacheProvider for SqliteCacheProvider {
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
        let now = crate::core::epoch_ms() as i64;
        let (value_string, value_bytes) = match value {
            CacheValue::Text(text) => (Some(text), None),
            CacheValue::Bytes(bytes) => (None, Some(bytes)),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache
               (key, value_string, value_bytes, created_at, modified_at, used_at,
                ttl, max_stale, source_uri, etag, priority)
             VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
               value_string = excluded.value_string,
               value_bytes  = excluded.value_bytes,
               modified_at  = excluded.modified_at,
               used_at      = excluded.used_at,
               ttl          = excluded.ttl,
               max_stale    = excluded.max_stale,
               source_uri   = excluded.source_uri,
               etag         = excluded.etag,
               priority     = excluded.priority",
            params![
                key,
                value_string,
                value_bytes,
                now,
                ttl.map(|v| v as i64),
                max_stale.map(|v| v as i64),
                source_uri,
                etag,
                priority.as_str(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get(&self, key: &str, allow_expired: bool) -> CommsResult<Option<CacheEntry>> {
        let now = crate::core::epoch_ms();
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT * FROM cache WHERE key = ?1",
                params![key],
                Self::row_to_entry,
            )
            .optional()
            .map_err(db_err)?;

        let Some(mut entry) = entry else {
            return Ok(None);
        };
        if entry.is_expired(now) && !allow_expired {
            return Ok(None);
        }
        conn.execute(
            "UPDATE cache SET used_at = ?1 WHERE key = ?2",
            params![now as i64, key],
        )
        .map_err(db_err)?;
        entry.used_at = now;
        Ok(Some(entry))
    }

    fn size(&self, allow_expired: bool) -> CommsResult<usize> {
        let now = crate::core::epoch_ms() as i64;
        let conn = self.conn.lock();
        let count: i64 = if allow_expired {
            conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
        } else {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM cache WHERE {FRESH_PREDICATE}"),
                params![now],
                |row| row.get(0),
            )
        }
        .map_err(db_err)?;
        Ok(count as usize)
    }

    fn contains(&self, key: &str, allow_expired: bool) -> CommsResult<bool> {
        let now = crate::core::epoch_ms() as i64;
        let conn = self.conn.lock();
        let found: Option<i64> = if allow_expired {
            conn.query_row(
                "SELECT 1 FROM cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
        } else {
            conn.query_row(
                &format!("SELECT 1 FROM cache WHERE key = ?2 AND {FRESH_PREDICATE}"),
                params![now, key],
                |row| row.get(0),
            )
        }
        .optional()
        .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn remove(&self, key: &str) -> CommsResult<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM cache WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    fn remove_all(&self) -> CommsResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache", []).map_err(db_err)?;
        Ok(())
    }

    fn invalidate(&self, key: &str) -> CommsResult<bool> {
        let now = crate::core::epoch_ms() as i64;
        let conn = self.conn.lock();
        // Both expressions read the pre-update ttl.
        let affected = conn
            .execute(
                "UPDATE cache SET
                   created_at = MAX(0, ?1 - COALESCE(ttl, 0) - 1),
                   ttl        = COALESCE(ttl, 0)
                 WHERE key = ?2",
                params![now, key],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    fn trim_lru(&self) -> CommsResult<()> {
        let conn = self.conn.lock();
        let evicted = conn
            .execute(
                "DELETE FROM cache WHERE key IN (
                    SELECT key FROM cache
                    ORDER BY
                      CASE priority WHEN 'HIGH' THEN 2 WHEN 'NORMAL' THEN 1 ELSE 0 END DESC,
                      used_at DESC,
                      modified_at DESC
                    LIMIT -1 OFFSET ?1
                )",
                params![self.capacity as i64],
            )
            .map_err(db_err)?;
        if evicted > 0 {
            log::debug!("Trimmed sqlite cache: evicted {evicted} entries (cap {})", self.capacity);
        }
        Ok(())
    }
}
