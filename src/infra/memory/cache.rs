//! In-process [`CacheBackend`] for single-instance deployments and tests.
//!
//! Entries live in a bounded LRU map. Expired entries are removed lazily on
//! access; capacity evictions drop the least recently used key.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{CacheBackend, CacheError};

const SOURCE: &str = "infra::memory::cache";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryCacheBackend {
    entries: RwLock<LruCache<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryCacheBackend {
    /// Creates a backend holding at most `capacity` keys (clamped to 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent operation fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::backend("memory cache marked unavailable"));
        }
        Ok(())
    }

    fn insert(entries: &mut LruCache<String, Entry>, key: &str, entry: Entry) {
        if let Some((evicted, _)) = entries.push(key.to_string(), entry)
            && evicted != key
        {
            debug!(evicted_key = %evicted, "Memory cache evicted entry due to capacity");
        }
    }
}

/// Returns the live entry at `key`, dropping it first when expired.
fn live_entry<'a>(entries: &'a mut LruCache<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .peek(key)
        .is_some_and(|entry| entry.is_expired(Instant::now()));
    if expired {
        entries.pop(key);
        return None;
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::corrupt(key, "operation against a key holding the wrong kind of value")
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        Self::insert(&mut entries, key, Entry::new(Value::Text(value), ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "set_if_absent");
        if live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        Self::insert(&mut entries, key, Entry::new(Value::Text(value), ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "compare_and_set");
        let current = match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Some(text.as_str()),
            Some(_) => return Err(wrong_type(key)),
            None => None,
        };
        if current != expected {
            return Ok(false);
        }
        Self::insert(&mut entries, key, Entry::new(Value::Text(value), ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        let live = live_entry(&mut entries, key).is_some();
        entries.pop(key);
        Ok(live)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "exists");
        Ok(live_entry(&mut entries, key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "ttl");
        Ok(live_entry(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "expire");
        match live_entry(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "incr_by");
        let Some(entry) = live_entry(&mut entries, key) else {
            Self::insert(
                &mut entries,
                key,
                Entry::new(Value::Text(delta.to_string()), None),
            );
            return Ok(delta);
        };

        let Value::Text(text) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let current = text
            .parse::<i64>()
            .map_err(|err| CacheError::corrupt(key, err.to_string()))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::corrupt(key, "increment would overflow"))?;
        *text = next.to_string();
        Ok(next)
    }

    async fn zincr(&self, key: &str, member: &str, by: f64) -> Result<f64, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "zincr");
        let Some(entry) = live_entry(&mut entries, key) else {
            let members = HashMap::from([(member.to_string(), by)]);
            Self::insert(&mut entries, key, Entry::new(Value::Sorted(members), None));
            return Ok(by);
        };

        let Value::Sorted(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let score = members.entry(member.to_string()).or_insert(0.0);
        *score += by;
        Ok(*score)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "zscore");
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "ztop");
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => {
                let mut ranked = ranked_members(members);
                ranked.truncate(limit);
                Ok(ranked)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn ztrim(&self, key: &str, keep: usize) -> Result<usize, CacheError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, SOURCE, "ztrim");
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => {
                if members.len() <= keep {
                    return Ok(0);
                }
                let ranked = ranked_members(members);
                let removed = ranked.len() - keep;
                for (member, _) in ranked.into_iter().skip(keep) {
                    members.remove(&member);
                }
                Ok(removed)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }
}

/// Highest score first; ties broken by member name for stable output.
fn ranked_members(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = members
        .iter()
        .map(|(member, score)| (member.clone(), *score))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_existing_values() {
        let backend = MemoryCacheBackend::new(16);
        assert!(backend.set_if_absent("k", "a".into(), None).await.unwrap());
        assert!(!backend.set_if_absent("k", "b".into(), None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let backend = MemoryCacheBackend::new(16);
        backend
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(
            backend.ttl("k").await.unwrap(),
            Some(Duration::from_secs(10))
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!backend.exists("k").await.unwrap());
        assert!(
            backend
                .set_if_absent("k", "again".into(), None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn incr_by_starts_from_zero_and_rejects_text() {
        let backend = MemoryCacheBackend::new(16);
        assert_eq!(backend.incr_by("n", 5).await.unwrap(), 5);
        assert_eq!(backend.decr_by("n", 2).await.unwrap(), 3);

        backend.set("t", "abc".into(), None).await.unwrap();
        assert!(backend.incr_by("t", 1).await.is_err());
    }

    #[tokio::test]
    async fn sorted_set_ranks_and_trims() {
        let backend = MemoryCacheBackend::new(16);
        backend.zincr("z", "a", 1.0).await.unwrap();
        backend.zincr("z", "b", 3.0).await.unwrap();
        backend.zincr("z", "c", 2.0).await.unwrap();
        assert_eq!(backend.zincr("z", "a", 4.0).await.unwrap(), 5.0);

        let top = backend.ztop("z", 2).await.unwrap();
        assert_eq!(top, vec![("a".to_string(), 5.0), ("b".to_string(), 3.0)]);

        assert_eq!(backend.ztrim("z", 2).await.unwrap(), 1);
        assert_eq!(backend.zscore("z", "c").await.unwrap(), None);
        assert!(backend.get("z").await.is_err());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let backend = MemoryCacheBackend::new(2);
        backend.set("a", "1".into(), None).await.unwrap();
        backend.set("b", "2".into(), None).await.unwrap();
        backend.get("a").await.unwrap();
        backend.set("c", "3".into(), None).await.unwrap();

        assert!(backend.exists("a").await.unwrap());
        assert!(!backend.exists("b").await.unwrap());
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let backend = MemoryCacheBackend::new(2);
        backend.set_unavailable(true);
        assert!(backend.get("a").await.is_err());
        backend.set_unavailable(false);
        assert!(backend.get("a").await.unwrap().is_none());
    }
}
