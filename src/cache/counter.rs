//! Counter cache: the fast read path for soft counters and like relations.
//!
//! Only handler chains (fast path) and the repair service (corrective path)
//! write through this type. Every counter mutation is a single atomic backend
//! operation; concurrent writers of one aggregate are serialized by the
//! aggregate lock, not here.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::application::error::EngineError;
use crate::application::repos::CountStore;
use crate::domain::types::{TargetRef, UserId};

use super::backend::{CacheBackend, CacheError};
use super::keys::{CounterKey, RelationKey, view_marker_key};

const RELATION_PRESENT: &str = "1";
const RELATION_ABSENT: &str = "0";

pub struct CounterCache {
    backend: Arc<dyn CacheBackend>,
}

impl CounterCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub async fn increment(&self, key: CounterKey, delta: i64) -> Result<i64, CacheError> {
        self.backend.incr_by(&key.to_string(), delta).await
    }

    pub async fn decrement(&self, key: CounterKey, delta: i64) -> Result<i64, CacheError> {
        self.backend.decr_by(&key.to_string(), delta).await
    }

    pub async fn get(&self, key: CounterKey) -> Result<Option<i64>, CacheError> {
        let rendered = key.to_string();
        match self.backend.get(&rendered).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|err| CacheError::corrupt(rendered, err.to_string())),
            None => Ok(None),
        }
    }

    /// Overwrites the cached count. Reserved for the repair path.
    pub async fn set(&self, key: CounterKey, value: i64) -> Result<(), CacheError> {
        self.backend.set(&key.to_string(), value.to_string(), None).await
    }

    /// Stores `value` unless a count is already cached. Returns whether it was stored.
    pub async fn seed(&self, key: CounterKey, value: i64) -> Result<bool, CacheError> {
        self.backend
            .set_if_absent(&key.to_string(), value.to_string(), None)
            .await
    }

    /// Returns the cached count, seeding it when absent with the store value
    /// plus `pending`, the caller's unflushed delta for this key.
    pub async fn load_or_seed(
        &self,
        key: CounterKey,
        store: &dyn CountStore,
        pending: i64,
    ) -> Result<i64, EngineError> {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let authoritative = store
            .find_authoritative_count(key.target, key.counter)
            .await?;
        let seeded = authoritative + pending;
        if self.seed(key, seeded).await? {
            debug!(key = %key, value = seeded, pending, "Seeded counter from store");
            return Ok(seeded);
        }

        // Another writer seeded first; its value wins.
        Ok(self.get(key).await?.unwrap_or(seeded))
    }

    pub async fn set_relation(
        &self,
        user: UserId,
        target: TargetRef,
        present: bool,
    ) -> Result<(), CacheError> {
        self.backend
            .set(
                &RelationKey::new(user, target).to_string(),
                relation_flag(present).to_string(),
                None,
            )
            .await
    }

    /// Writes `present` only while the cached flag still reads `expected`.
    pub async fn replace_relation(
        &self,
        user: UserId,
        target: TargetRef,
        expected: Option<bool>,
        present: bool,
    ) -> Result<bool, CacheError> {
        self.backend
            .compare_and_set(
                &RelationKey::new(user, target).to_string(),
                expected.map(relation_flag),
                relation_flag(present).to_string(),
                None,
            )
            .await
    }

    /// Cached relation flag; `None` when the cache knows nothing about it.
    pub async fn relation(
        &self,
        user: UserId,
        target: TargetRef,
    ) -> Result<Option<bool>, CacheError> {
        let key = RelationKey::new(user, target).to_string();
        match self.backend.get(&key).await?.as_deref() {
            Some(RELATION_PRESENT) => Ok(Some(true)),
            Some(RELATION_ABSENT) => Ok(Some(false)),
            Some(other) => Err(CacheError::corrupt(
                key,
                format!("unexpected relation flag `{other}`"),
            )),
            None => Ok(None),
        }
    }

    pub async fn has_relation(&self, user: UserId, target: TargetRef) -> Result<bool, CacheError> {
        Ok(self.relation(user, target).await?.unwrap_or(false))
    }

    /// Returns the relation flag, seeding the cache from `store` when unknown.
    pub async fn load_or_seed_relation(
        &self,
        user: UserId,
        target: TargetRef,
        store: &dyn CountStore,
    ) -> Result<bool, EngineError> {
        if let Some(present) = self.relation(user, target).await? {
            return Ok(present);
        }
        let present = store.find_relation(user, target).await?;
        self.set_relation(user, target, present).await?;
        Ok(present)
    }

    /// Records a view marker. Returns false when one already exists in the window.
    pub async fn mark_view(
        &self,
        user: UserId,
        target: TargetRef,
        window: Duration,
    ) -> Result<bool, CacheError> {
        self.backend
            .set_if_absent(
                &view_marker_key(user, target),
                RELATION_PRESENT.to_string(),
                Some(window),
            )
            .await
    }
}

fn relation_flag(present: bool) -> &'static str {
    if present {
        RELATION_PRESENT
    } else {
        RELATION_ABSENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CounterName;
    use crate::infra::memory::{MemoryCacheBackend, MemoryCountStore};

    fn cache() -> (CounterCache, Arc<MemoryCacheBackend>) {
        let backend = Arc::new(MemoryCacheBackend::new(1024));
        (CounterCache::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn increment_and_decrement_are_relative() {
        let (cache, _) = cache();
        let key = CounterKey::new(TargetRef::post(1), CounterName::Likes);

        assert_eq!(cache.get(key).await.unwrap(), None);
        assert_eq!(cache.increment(key, 3).await.unwrap(), 3);
        assert_eq!(cache.decrement(key, 1).await.unwrap(), 2);
        assert_eq!(cache.get(key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn load_or_seed_reads_through_once() {
        let (cache, _) = cache();
        let store = MemoryCountStore::new();
        let target = TargetRef::post(42);
        store.set_count(target, CounterName::Likes, 10);
        let key = CounterKey::new(target, CounterName::Likes);

        assert_eq!(cache.load_or_seed(key, &store, 2).await.unwrap(), 12);
        store.set_count(target, CounterName::Likes, 99);
        // Seeded value stays until repaired.
        assert_eq!(cache.load_or_seed(key, &store, 0).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn relation_flags_distinguish_unknown_from_absent() {
        let (cache, _) = cache();
        let target = TargetRef::post(5);

        assert_eq!(cache.relation(1, target).await.unwrap(), None);
        cache.set_relation(1, target, false).await.unwrap();
        assert_eq!(cache.relation(1, target).await.unwrap(), Some(false));
        cache.set_relation(1, target, true).await.unwrap();
        assert!(cache.has_relation(1, target).await.unwrap());
        assert!(!cache.has_relation(2, target).await.unwrap());
    }

    #[tokio::test]
    async fn relation_replacement_requires_the_expected_flag() {
        let (cache, _) = cache();
        let target = TargetRef::post(6);

        assert!(cache.replace_relation(1, target, None, false).await.unwrap());
        assert!(!cache.replace_relation(1, target, None, true).await.unwrap());
        assert!(!cache.replace_relation(1, target, Some(true), true).await.unwrap());
        assert_eq!(cache.relation(1, target).await.unwrap(), Some(false));

        assert!(cache.replace_relation(1, target, Some(false), true).await.unwrap());
        assert_eq!(cache.relation(1, target).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn corrupt_counter_is_reported() {
        let (cache, backend) = cache();
        let key = CounterKey::new(TargetRef::post(1), CounterName::Views);
        backend
            .set(&key.to_string(), "not-a-number".to_string(), None)
            .await
            .unwrap();

        assert!(matches!(
            cache.get(key).await,
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn view_marker_is_set_once_per_window() {
        let (cache, _) = cache();
        let target = TargetRef::post(3);
        let window = Duration::from_secs(60);

        assert!(cache.mark_view(9, target, window).await.unwrap());
        assert!(!cache.mark_view(9, target, window).await.unwrap());
        assert!(cache.mark_view(10, target, window).await.unwrap());
    }
}
