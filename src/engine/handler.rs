//! Counter handlers: the fast path from a mutation event to the cache.
//!
//! One [`CounterHandler`] serves each handler chain. For every event it takes
//! the aggregate lock, mutates the counter cache and records the delta in its
//! batch. Any failure marks the touched entries suspect so that the repair
//! service reconciles them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::application::error::EngineError;
use crate::application::repos::{CountStore, RepoError};
use crate::cache::keys::aggregate_lock_key;
use crate::cache::{CacheError, CounterCache, CounterKey};
use crate::domain::events::{MutationEvent, MutationKind};
use crate::domain::types::{CounterName, TargetRef, UserId};

use super::aggregate_lock::{AggregateLock, LockError, LockHandle};
use super::batch::{BatchAccumulator, FlushReason};
use super::config::EngineConfig;
use super::pipeline::HandlerChain;
use super::repair::ConsistencyRepairService;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("lease on `{key}` expired before the mutation was applied")]
    LeaseLost { key: String },
    #[error("`{kind}` event routed to the `{counter}` chain")]
    Misrouted {
        kind: &'static str,
        counter: CounterName,
    },
}

impl From<CacheError> for HandlerError {
    fn from(err: CacheError) -> Self {
        Self::Engine(err.into())
    }
}

impl From<RepoError> for HandlerError {
    fn from(err: RepoError) -> Self {
        Self::Engine(err.into())
    }
}

impl HandlerError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Lock(LockError::Timeout { .. }) => "lock_timeout",
            Self::Lock(LockError::Backend(_)) => "lock_backend",
            Self::Engine(EngineError::Cache(_)) => "cache",
            Self::Engine(EngineError::Repo(_)) => "store",
            Self::Engine(_) => "engine",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Misrouted { .. } => "misrouted",
        }
    }
}

/// Consumer of one handler chain.
#[async_trait]
pub trait EventHandler: Send {
    fn chain(&self) -> HandlerChain;

    /// Applies `event`; `is_last_in_batch` marks the batch boundary.
    async fn on_event(
        &mut self,
        event: MutationEvent,
        is_last_in_batch: bool,
    ) -> Result<(), HandlerError>;

    /// A boundary reached without events (idle tick).
    async fn on_idle(&mut self);

    /// The chain is closed and drained.
    async fn on_shutdown(&mut self);
}

/// Shared collaborators of every counter handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub cache: Arc<CounterCache>,
    pub store: Arc<dyn CountStore>,
    pub locks: AggregateLock,
    pub repair: Arc<ConsistencyRepairService>,
}

pub struct CounterHandler {
    counter: CounterName,
    ctx: HandlerContext,
    batch: BatchAccumulator,
    lock_wait: Duration,
    lock_lease: Duration,
    view_dedup_window: Option<Duration>,
}

impl CounterHandler {
    pub fn new(ctx: HandlerContext, batch: BatchAccumulator, config: &EngineConfig) -> Self {
        Self {
            counter: batch.counter(),
            ctx,
            batch,
            lock_wait: config.locks.wait_timeout(),
            lock_lease: config.locks.lease_timeout(),
            view_dedup_window: config.batch.view_dedup_window(),
        }
    }

    pub fn batch(&self) -> &BatchAccumulator {
        &self.batch
    }

    async fn apply(&mut self, event: &MutationEvent) -> Result<(), HandlerError> {
        if event.counter() != self.counter {
            return Err(HandlerError::Misrouted {
                kind: event.kind.as_str(),
                counter: self.counter,
            });
        }

        let lock_key = aggregate_lock_key(event.target);
        let pending = self.batch.pending_delta(event.target);
        let applied = self
            .ctx
            .locks
            .with_lock(&lock_key, self.lock_wait, self.lock_lease, |handle| {
                self.apply_locked(event, handle, pending)
            })
            .await?;

        if let Some(delta) = applied {
            self.batch.add(event.target, delta);
            self.ctx.repair.watch(event.target, self.counter);
        }
        Ok(())
    }

    /// Returns the delta to accumulate, or `None` when the event changed nothing.
    async fn apply_locked(
        &self,
        event: &MutationEvent,
        handle: LockHandle,
        pending: i64,
    ) -> Result<Option<i64>, HandlerError> {
        let key = CounterKey::new(event.target, self.counter);
        match event.kind {
            MutationKind::Like | MutationKind::Unlike => {
                self.apply_like(event, key, &handle, pending).await
            }
            MutationKind::CommentDelta => {
                self.ctx
                    .cache
                    .load_or_seed(key, &*self.ctx.store, pending)
                    .await?;
                self.ensure_held(&handle).await?;
                self.ctx.cache.increment(key, event.delta).await?;
                Ok(Some(event.delta))
            }
            MutationKind::View => {
                if let Some(window) = self.view_dedup_window {
                    let first = self
                        .ctx
                        .cache
                        .mark_view(event.actor_id, event.target, window)
                        .await?;
                    if !first {
                        debug!(
                            event_id = %event.id,
                            target = %event.target,
                            actor = event.actor_id,
                            "Repeat view inside de-duplication window ignored"
                        );
                        return Ok(None);
                    }
                }
                self.ctx
                    .cache
                    .load_or_seed(key, &*self.ctx.store, pending)
                    .await?;
                self.ensure_held(&handle).await?;
                self.ctx.cache.increment(key, 1).await?;
                Ok(Some(1))
            }
        }
    }

    async fn apply_like(
        &self,
        event: &MutationEvent,
        key: CounterKey,
        handle: &LockHandle,
        pending: i64,
    ) -> Result<Option<i64>, HandlerError> {
        let liked = event.kind == MutationKind::Like;
        let (actor, target) = (event.actor_id, event.target);

        let current = self
            .ctx
            .cache
            .load_or_seed_relation(actor, target, &*self.ctx.store)
            .await?;
        if current == liked {
            debug!(
                event_id = %event.id,
                target = %target,
                actor,
                liked,
                "Like state unchanged; event ignored"
            );
            return Ok(None);
        }

        self.ctx
            .cache
            .load_or_seed(key, &*self.ctx.store, pending)
            .await?;
        self.ensure_held(handle).await?;

        let delta = if liked { 1 } else { -1 };
        self.ctx.cache.increment(key, delta).await?;
        if let Err(err) = self.persist_relation(actor, target, liked).await {
            self.compensate(key, delta, actor, target, liked).await;
            return Err(err);
        }

        self.ctx.repair.watch_relation(actor, target);
        Ok(Some(delta))
    }

    async fn persist_relation(
        &self,
        actor: UserId,
        target: TargetRef,
        liked: bool,
    ) -> Result<(), HandlerError> {
        // Store before cache; relation repair relies on this order.
        self.ctx.store.save_relation(actor, target, liked).await?;
        if let Err(err) = self.ctx.cache.set_relation(actor, target, liked).await {
            if let Err(revert) = self.ctx.store.save_relation(actor, target, !liked).await {
                error!(
                    target = %target,
                    actor,
                    error = %revert,
                    "Failed to revert stored like relation"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Reverts a counter increment and relation flag after a failed step.
    async fn compensate(
        &self,
        key: CounterKey,
        delta: i64,
        actor: UserId,
        target: TargetRef,
        liked: bool,
    ) {
        if let Err(err) = self.ctx.cache.increment(key, -delta).await {
            error!(key = %key, delta = -delta, error = %err, "Failed to revert counter");
        }
        if let Err(err) = self.ctx.cache.set_relation(actor, target, !liked).await {
            error!(
                target = %target,
                actor,
                error = %err,
                "Failed to revert like relation"
            );
        }
    }

    async fn ensure_held(&self, handle: &LockHandle) -> Result<(), HandlerError> {
        if self.ctx.locks.still_held(handle).await {
            return Ok(());
        }
        Err(HandlerError::LeaseLost {
            key: handle.key.clone(),
        })
    }

    async fn at_boundary(&mut self) {
        if let Err(err) = self.batch.maybe_flush(true).await {
            debug!(
                counter = self.counter.code(),
                pending = self.batch.pending_len(),
                error = %err,
                "Boundary flush failed; deltas retained for the next boundary"
            );
        }
        self.report_recovered();
    }

    fn report_recovered(&mut self) {
        for target in self.batch.take_recovered() {
            self.ctx.repair.mark_suspect(target, self.counter);
        }
    }
}

#[async_trait]
impl EventHandler for CounterHandler {
    fn chain(&self) -> HandlerChain {
        HandlerChain::for_counter(self.counter)
    }

    async fn on_event(
        &mut self,
        event: MutationEvent,
        is_last_in_batch: bool,
    ) -> Result<(), HandlerError> {
        let result = self.apply(&event).await;
        if result.is_err() {
            self.ctx.repair.mark_suspect(event.target, self.counter);
            if matches!(event.kind, MutationKind::Like | MutationKind::Unlike) {
                self.ctx
                    .repair
                    .mark_relation_suspect(event.actor_id, event.target);
            }
        }
        if is_last_in_batch {
            self.at_boundary().await;
        }
        result
    }

    async fn on_idle(&mut self) {
        self.at_boundary().await;
    }

    async fn on_shutdown(&mut self) {
        if let Err(err) = self.batch.flush_now(FlushReason::Shutdown).await {
            warn!(
                counter = self.counter.code(),
                pending = self.batch.pending_len(),
                error = %err,
                "Final flush failed; pending deltas are lost"
            );
        }
        self.report_recovered();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::engine::batch::PendingLedger;
    use crate::engine::repair::{RepairOutcome, RepairSubject};
    use crate::engine::config::{BatchConfig, LockConfig};
    use crate::infra::memory::{MemoryCacheBackend, MemoryCountStore, MemoryLockBackend};

    struct Fixture {
        cache: Arc<CounterCache>,
        store: Arc<MemoryCountStore>,
        repair: Arc<ConsistencyRepairService>,
        handler: CounterHandler,
    }

    fn fixture(counter: CounterName, config: EngineConfig) -> Fixture {
        let cache = Arc::new(CounterCache::new(Arc::new(MemoryCacheBackend::new(1024))));
        let store = Arc::new(MemoryCountStore::new());
        let ledger = Arc::new(PendingLedger::new());
        let repair = Arc::new(ConsistencyRepairService::new(
            cache.clone(),
            store.clone(),
            ledger.clone(),
            &config.repair,
        ));
        let ctx = HandlerContext {
            cache: cache.clone(),
            store: store.clone(),
            locks: AggregateLock::new(Arc::new(MemoryLockBackend::new()), &config.locks),
            repair: repair.clone(),
        };
        let batch = BatchAccumulator::new(counter, store.clone(), ledger, &config.batch);
        Fixture {
            cache,
            store,
            repair,
            handler: CounterHandler::new(ctx, batch, &config),
        }
    }

    const POST: TargetRef = TargetRef::post(42);

    #[tokio::test]
    async fn like_seeds_from_store_and_persists_relation() {
        let mut f = fixture(CounterName::Likes, EngineConfig::default());
        f.store.set_count(POST, CounterName::Likes, 10);

        f.handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap();

        let key = CounterKey::new(POST, CounterName::Likes);
        assert_eq!(f.cache.get(key).await.unwrap(), Some(11));
        assert!(f.cache.has_relation(1, POST).await.unwrap());
        assert!(f.store.relation(1, POST));
        assert_eq!(f.handler.batch().pending_delta(POST), 1);
    }

    #[tokio::test]
    async fn like_unlike_like_nets_one() {
        let mut f = fixture(CounterName::Likes, EngineConfig::default());
        for event in [
            MutationEvent::like(1, POST),
            MutationEvent::unlike(1, POST),
            MutationEvent::like(1, POST),
        ] {
            f.handler.on_event(event, false).await.unwrap();
        }

        assert!(f.cache.has_relation(1, POST).await.unwrap());
        assert_eq!(f.handler.batch().pending_delta(POST), 1);
    }

    #[tokio::test]
    async fn repeated_like_and_stray_unlike_are_ignored() {
        let mut f = fixture(CounterName::Likes, EngineConfig::default());
        f.handler
            .on_event(MutationEvent::unlike(1, POST), false)
            .await
            .unwrap();
        f.handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap();
        f.handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap();

        let key = CounterKey::new(POST, CounterName::Likes);
        assert_eq!(f.cache.get(key).await.unwrap(), Some(1));
        assert_eq!(f.handler.batch().pending_delta(POST), 1);
    }

    #[tokio::test]
    async fn failed_relation_write_is_compensated() {
        let mut f = fixture(CounterName::Likes, EngineConfig::default());
        f.store.set_count(POST, CounterName::Likes, 5);
        f.store.set_relation_writes_failing(true);

        let err = f
            .handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "store");

        let key = CounterKey::new(POST, CounterName::Likes);
        assert_eq!(f.cache.get(key).await.unwrap(), Some(5));
        assert_eq!(f.cache.relation(1, POST).await.unwrap(), Some(false));
        assert_eq!(f.handler.batch().pending_delta(POST), 0);
        assert!(f.repair.is_suspect(&RepairSubject::Counter(key)));
    }

    #[tokio::test]
    async fn repeat_views_inside_window_count_once() {
        let mut f = fixture(CounterName::Views, EngineConfig::default());
        for _ in 0..3 {
            f.handler
                .on_event(MutationEvent::view(9, POST), false)
                .await
                .unwrap();
        }
        f.handler
            .on_event(MutationEvent::view(10, POST), false)
            .await
            .unwrap();

        let key = CounterKey::new(POST, CounterName::Views);
        assert_eq!(f.cache.get(key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn zero_window_counts_every_view() {
        let mut config = EngineConfig::default();
        config.batch = BatchConfig {
            view_dedup_window_secs: 0,
            ..BatchConfig::default()
        };
        let mut f = fixture(CounterName::Views, config);
        for _ in 0..3 {
            f.handler
                .on_event(MutationEvent::view(9, POST), false)
                .await
                .unwrap();
        }
        assert_eq!(f.handler.batch().pending_delta(POST), 3);
    }

    #[tokio::test]
    async fn boundary_flushes_when_threshold_is_met() {
        let mut config = EngineConfig::default();
        config.batch.size_threshold = 2;
        let mut f = fixture(CounterName::Comments, config);

        let a = MutationEvent::comment_delta(1, TargetRef::post(1), 1).unwrap();
        let b = MutationEvent::comment_delta(1, TargetRef::post(2), 2).unwrap();
        f.handler.on_event(a, false).await.unwrap();
        f.handler.on_event(b, true).await.unwrap();

        assert_eq!(f.store.flushes().len(), 1);
        assert_eq!(f.store.count(TargetRef::post(2), CounterName::Comments), 2);
        assert_eq!(f.handler.batch().pending_len(), 0);
    }

    #[tokio::test]
    async fn failed_boundary_flush_keeps_deltas_until_recovery() {
        let mut config = EngineConfig::default();
        config.batch.size_threshold = 1;
        let mut f = fixture(CounterName::Comments, config);
        f.store.fail_next_flushes(1);

        let event = MutationEvent::comment_delta(1, POST, 2).unwrap();
        f.handler.on_event(event, true).await.unwrap();
        assert_eq!(f.handler.batch().pending_delta(POST), 2);
        assert!(f.store.flushes().is_empty());

        f.handler.on_idle().await;
        assert_eq!(f.handler.batch().pending_len(), 0);
        assert_eq!(f.store.count(POST, CounterName::Comments), 2);
        let key = CounterKey::new(POST, CounterName::Comments);
        assert!(f.repair.is_suspect(&RepairSubject::Counter(key)));
    }

    #[tokio::test]
    async fn misrouted_events_are_rejected() {
        let mut f = fixture(CounterName::Views, EngineConfig::default());
        let err = f
            .handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "misrouted");
    }

    #[tokio::test]
    async fn lock_timeout_skips_the_event_and_marks_it_suspect() {
        let mut config = EngineConfig::default();
        config.locks = LockConfig {
            wait_timeout_ms: 20,
            retry_interval_ms: 5,
            ..LockConfig::default()
        };
        let mut f = fixture(CounterName::Views, config.clone());
        let blocker = f
            .handler
            .ctx
            .locks
            .acquire(
                &aggregate_lock_key(POST),
                config.locks.wait_timeout(),
                config.locks.lease_timeout(),
            )
            .await
            .unwrap();

        let err = f
            .handler
            .on_event(MutationEvent::view(1, POST), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "lock_timeout");
        assert_eq!(f.handler.batch().pending_delta(POST), 0);
        let key = CounterKey::new(POST, CounterName::Views);
        assert!(f.repair.is_suspect(&RepairSubject::Counter(key)));

        f.handler.ctx.locks.release(&blocker).await;
    }

    /// Commits a like (store, then cache) right after serving the first
    /// armed relation read, as a concurrent handler on another chain would.
    struct LikeCommitsAfterRead {
        inner: Arc<MemoryCountStore>,
        cache: Arc<CounterCache>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl CountStore for LikeCommitsAfterRead {
        async fn find_authoritative_count(
            &self,
            target: TargetRef,
            counter: CounterName,
        ) -> Result<i64, RepoError> {
            self.inner.find_authoritative_count(target, counter).await
        }

        async fn batch_update_counts(
            &self,
            counter: CounterName,
            deltas: &HashMap<TargetRef, i64>,
        ) -> Result<(), RepoError> {
            self.inner.batch_update_counts(counter, deltas).await
        }

        async fn find_relation(&self, user: UserId, target: TargetRef) -> Result<bool, RepoError> {
            let seen = self.inner.find_relation(user, target).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.set_relation(user, target, true);
                self.cache
                    .set_relation(user, target, true)
                    .await
                    .map_err(RepoError::from_persistence)?;
            }
            Ok(seen)
        }

        async fn save_relation(
            &self,
            user: UserId,
            target: TargetRef,
            present: bool,
        ) -> Result<(), RepoError> {
            self.inner.save_relation(user, target, present).await
        }
    }

    #[tokio::test]
    async fn relation_repair_racing_a_like_does_not_recount_it() {
        let config = EngineConfig::default();
        let cache = Arc::new(CounterCache::new(Arc::new(MemoryCacheBackend::new(1024))));
        let inner = Arc::new(MemoryCountStore::new());
        inner.set_count(POST, CounterName::Likes, 1);
        let store = Arc::new(LikeCommitsAfterRead {
            inner: inner.clone(),
            cache: cache.clone(),
            armed: AtomicBool::new(true),
        });
        let ledger = Arc::new(PendingLedger::new());
        let repair = Arc::new(ConsistencyRepairService::new(
            cache.clone(),
            store.clone(),
            ledger.clone(),
            &config.repair,
        ));
        let ctx = HandlerContext {
            cache: cache.clone(),
            store: store.clone(),
            locks: AggregateLock::new(Arc::new(MemoryLockBackend::new()), &config.locks),
            repair: repair.clone(),
        };
        let batch = BatchAccumulator::new(CounterName::Likes, store, ledger, &config.batch);
        let mut handler = CounterHandler::new(ctx, batch, &config);

        let outcome = repair.repair_relation(1, POST).await.unwrap();
        assert_eq!(outcome, RepairOutcome::InSync);
        assert!(inner.relation(1, POST));
        assert_eq!(cache.relation(1, POST).await.unwrap(), Some(true));

        handler
            .on_event(MutationEvent::like(1, POST), false)
            .await
            .unwrap();
        assert_eq!(handler.batch().pending_delta(POST), 0);
        assert_eq!(repair.repair_relation(1, POST).await.unwrap(), RepairOutcome::InSync);
    }
}
