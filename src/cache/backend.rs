//! Key/value cache backend contract.
//!
//! Shaped after a Redis-like server: string values with optional TTL, atomic
//! integer increments and a scored sorted set. Every operation is atomic for
//! a single key.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache value at `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl CacheError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), CacheError>;

    /// Stores `value` only when `key` is absent. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Replaces the string at `key` only while it still equals `expected`
    /// (`None` meaning absent). Returns whether the value was written.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining time to live; `None` when the key is absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Sets a TTL on an existing key (string or sorted set).
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically adds `delta` to the integer at `key` (absent counts as 0).
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.incr_by(key, -delta).await
    }

    /// Adds `by` to `member`'s score in the sorted set at `key`.
    async fn zincr(&self, key: &str, member: &str, by: f64) -> Result<f64, CacheError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError>;

    /// Highest-scored members first.
    async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, CacheError>;

    /// Drops the lowest-ranked members so that at most `keep` remain.
    /// Returns the number of members removed.
    async fn ztrim(&self, key: &str, keep: usize) -> Result<usize, CacheError>;
}
