//! Key/value cache persistence.
//!
//! Values are JSON documents stored under string keys, partitioned by
//! tenant. An entry written with a TTL reads as absent once it expires.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// String-keyed cache of JSON documents.
pub trait CacheStore: Send + Sync {
    /// Read the raw document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a raw document. `ttl = None` never expires.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop expired entries, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store fails.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Typed access on top of [`CacheStore`].
pub trait CacheStoreExt: CacheStore {
    /// Read and decode `key`, or build a default when absent.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or the document does not decode.
    fn get_or<T, F>(&self, key: &str, default: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Encoding {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default()),
        }
    }

    /// Encode and store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the store fails.
    fn put_value<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Encoding {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.put(key, &raw, ttl)
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// `SQLite`-backed cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    tenant: String,
}

impl SqliteCache {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path, tenant: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, tenant.into())
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    #[cfg(test)]
    pub fn in_memory(tenant: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, tenant.into())
    }

    fn with_connection(conn: Connection, tenant: String) -> Result<Self, StoreError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS cache_items (
                tenant TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant, key)
            );

            CREATE INDEX IF NOT EXISTS idx_cache_items_expires ON cache_items(expires_at);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            tenant,
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                r"
                SELECT value FROM cache_items
                WHERE tenant = ?1 AND key = ?2
                  AND (expires_at IS NULL OR expires_at > ?3)
                ",
                (&self.tenant, key, now_ms()),
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = now_ms();
        let expires_at = ttl.map(|ttl| now.saturating_add(duration_ms(ttl)));

        self.conn()?.execute(
            r"
            INSERT OR REPLACE INTO cache_items (tenant, key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (&self.tenant, key, value, expires_at, now),
        )?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM cache_items WHERE tenant = ?1 AND key = ?2",
            (&self.tenant, key),
        )?;

        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let deleted = self.conn()?.execute(
            r"
            DELETE FROM cache_items
            WHERE tenant = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2
            ",
            (&self.tenant, now_ms()),
        )?;

        Ok(deleted)
    }
}

/// In-process cache, for running without a database file.
#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<HashMap<String, (String, Option<i64>)>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn items(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Option<i64>)>>, StoreError> {
        self.items.lock().map_err(|_| StoreError::Lock)
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = now_ms();
        let items = self.items()?;
        Ok(items
            .get(key)
            .filter(|(_, expires_at)| expires_at.map_or(true, |at| at > now))
            .map(|(value, _)| value.clone()))
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| now_ms().saturating_add(duration_ms(ttl)));
        self.items()?
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.items()?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let mut items = self.items()?;
        let before = items.len();
        items.retain(|_, (_, expires_at)| expires_at.map_or(true, |at| at > now));
        Ok(before - items.len())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Errors for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Cache lock was poisoned by a panicking holder
    #[error("cache lock poisoned")]
    Lock,
    /// Stored document does not match the expected shape
    #[error("encoding error for key {key}: {message}")]
    Encoding {
        /// Key being read or written
        key: String,
        /// Encoder message
        message: String,
    },
}
