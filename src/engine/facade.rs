//! Engine facade.
//!
//! Wires the pipeline, handler chains, repair service and search cache
//! together and exposes the operations request code calls.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::error::EngineError;
use crate::application::pagination::Page;
use crate::application::repos::{CountStore, SearchBackend};
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheBackend, CacheError, CounterCache, CounterKey, RelationKey};
use crate::domain::events::MutationEvent;
use crate::domain::types::{CounterName, TargetRef, UserId};
use crate::infra::memory::{
    MemoryCacheBackend, MemoryCountStore, MemoryLockBackend, MemorySearchBackend,
};
use crate::search::{HotKeywordScore, SearchCache, SearchFilter};

use super::aggregate_lock::{AggregateLock, LockBackend};
use super::batch::{BatchAccumulator, PendingLedger};
use super::chain::ChainRunner;
use super::config::EngineConfig;
use super::handler::{CounterHandler, HandlerContext};
use super::pipeline::{EventPipeline, HandlerChain, PipelineError};
use super::repair::{ConsistencyRepairService, RepairOutcome, RepairSubject, RepairSummary};

const SOURCE: &str = "engine::facade";

/// External collaborators the engine runs against.
#[derive(Clone)]
pub struct EngineBackends {
    pub cache: Arc<dyn CacheBackend>,
    pub locks: Arc<dyn LockBackend>,
    pub store: Arc<dyn CountStore>,
    pub search: Arc<dyn SearchBackend>,
}

impl EngineBackends {
    /// Single-process backends with an empty store and search index.
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self {
            cache: Arc::new(MemoryCacheBackend::new(config.cache_capacity())),
            locks: Arc::new(MemoryLockBackend::new()),
            store: Arc::new(MemoryCountStore::new()),
            search: Arc::new(MemorySearchBackend::new()),
        }
    }
}

pub struct CounterEngine {
    pipeline: EventPipeline,
    counters: Arc<CounterCache>,
    repair: Arc<ConsistencyRepairService>,
    search: SearchCache,
    chains: Mutex<Vec<(HandlerChain, JoinHandle<()>)>>,
    repair_task: Mutex<Option<JoinHandle<()>>>,
}

impl CounterEngine {
    /// Opens the pipeline and spawns one task per handler chain, plus the
    /// scheduled repair loop when enabled. Must be called inside a runtime.
    pub fn start(config: &EngineConfig, backends: EngineBackends) -> Self {
        let counters = Arc::new(CounterCache::new(backends.cache.clone()));
        let ledger = Arc::new(PendingLedger::new());
        let repair = Arc::new(ConsistencyRepairService::new(
            counters.clone(),
            backends.store.clone(),
            ledger.clone(),
            &config.repair,
        ));
        let ctx = HandlerContext {
            cache: counters.clone(),
            store: backends.store.clone(),
            locks: AggregateLock::new(backends.locks.clone(), &config.locks),
            repair: repair.clone(),
        };

        let (pipeline, receivers) = EventPipeline::open(&config.pipeline);
        let chains: Vec<_> = [
            (HandlerChain::Likes, receivers.likes),
            (HandlerChain::Comments, receivers.comments),
            (HandlerChain::Views, receivers.views),
        ]
        .into_iter()
        .map(|(chain, receiver)| {
            let batch = BatchAccumulator::new(
                chain.counter(),
                backends.store.clone(),
                ledger.clone(),
                &config.batch,
            );
            let handler = CounterHandler::new(ctx.clone(), batch, config);
            let runner = ChainRunner::new(
                receiver,
                handler,
                &config.pipeline,
                config.batch.flush_interval(),
            );
            let task = tokio::spawn(async move {
                runner.run().await;
            });
            (chain, task)
        })
        .collect();

        let repair_task = config
            .repair
            .enabled
            .then(|| repair.clone().spawn(&config.repair));

        info!(
            channel_capacity = config.pipeline.channel_capacity(),
            flush_threshold = config.batch.size_threshold,
            flush_interval_ms = config.batch.flush_interval_ms,
            repair_enabled = config.repair.enabled,
            search_backend = backends.search.name(),
            "Counter engine started"
        );

        Self {
            pipeline,
            search: SearchCache::new(backends.cache, backends.search, &config.search),
            counters,
            repair,
            chains: Mutex::new(chains),
            repair_task: Mutex::new(repair_task),
        }
    }

    /// Records a like (`liked`) or unlike of `target` by `actor`.
    ///
    /// Returns `Ok(false)` when the event was dropped because its chain is
    /// full; the repair service reconciles the counter later.
    pub async fn publish_like_event(
        &self,
        actor: UserId,
        target: TargetRef,
        liked: bool,
    ) -> Result<bool, EngineError> {
        let event = if liked {
            MutationEvent::like(actor, target)
        } else {
            MutationEvent::unlike(actor, target)
        };
        self.publish(event).await
    }

    pub async fn publish_comment_count_event(
        &self,
        actor: UserId,
        target: TargetRef,
        delta: i64,
    ) -> Result<bool, EngineError> {
        self.publish(MutationEvent::comment_delta(actor, target, delta)?)
            .await
    }

    pub async fn publish_view_event(
        &self,
        actor: UserId,
        target: TargetRef,
    ) -> Result<bool, EngineError> {
        self.publish(MutationEvent::view(actor, target)).await
    }

    /// Current count from the cache, seeding it from the store on a miss.
    /// Suspect counters are repaired before they are read.
    pub async fn get_cached_count(
        &self,
        target: TargetRef,
        counter: CounterName,
    ) -> Result<i64, EngineError> {
        let key = CounterKey::new(target, counter);
        if let Err(err) = self
            .repair
            .repair_if_suspect(RepairSubject::Counter(key))
            .await
        {
            warn!(key = %key, error = %err, "Repair of suspect counter failed; serving cached value");
        }

        match self.counters.get(key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(CacheError::Corrupt { .. }) => {
                self.repair.repair(target, counter).await?;
                Ok(self.counters.get(key).await?.unwrap_or(0))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether `user` likes `target`, seeding the flag from the store on a miss.
    pub async fn has_relation(&self, user: UserId, target: TargetRef) -> Result<bool, EngineError> {
        let key = RelationKey::new(user, target);
        if let Err(err) = self
            .repair
            .repair_if_suspect(RepairSubject::Relation(key))
            .await
        {
            warn!(key = %key, error = %err, "Repair of suspect relation failed; serving cached value");
        }

        match self.counters.relation(user, target).await {
            Ok(Some(present)) => Ok(present),
            Ok(None) | Err(CacheError::Corrupt { .. }) => {
                self.repair.repair_relation(user, target).await?;
                Ok(self.counters.has_relation(user, target).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn search(
        &self,
        keyword: &str,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<TargetRef>, EngineError> {
        Ok(self.search.search(keyword, filter, page, size).await?)
    }

    pub async fn hot_keywords(&self, limit: usize) -> Result<Vec<HotKeywordScore>, EngineError> {
        Ok(self.search.hot_keywords(limit).await?)
    }

    /// Reconciles one cached counter with the store right away.
    pub async fn trigger_repair(
        &self,
        target: TargetRef,
        counter: CounterName,
    ) -> Result<RepairOutcome, EngineError> {
        self.repair.repair(target, counter).await
    }

    pub async fn trigger_relation_repair(
        &self,
        user: UserId,
        target: TargetRef,
    ) -> Result<RepairOutcome, EngineError> {
        self.repair.repair_relation(user, target).await
    }

    /// Runs one scheduled repair cycle on the caller's task.
    pub async fn run_repair_cycle(&self) -> RepairSummary {
        self.repair.run_cycle().await
    }

    /// Events waiting on `chain`.
    pub fn queued(&self, chain: HandlerChain) -> usize {
        self.pipeline.queued(chain)
    }

    /// Stops accepting events, waits for every chain to drain and flush, then
    /// stops the repair loop. Later calls return immediately.
    pub async fn shutdown(&self) {
        if !self.pipeline.close() {
            debug!("Counter engine already shut down");
            return;
        }
        info!("Counter engine shutting down");

        let chains = std::mem::take(&mut *mutex_lock(&self.chains, SOURCE, "shutdown"));
        for (chain, task) in chains {
            if let Err(err) = task.await {
                error!(chain = chain.as_str(), error = %err, "Handler chain task failed");
            }
        }

        let repair_task = mutex_lock(&self.repair_task, SOURCE, "shutdown").take();
        if let Some(task) = repair_task {
            task.abort();
        }
        info!("Counter engine stopped");
    }

    async fn publish(&self, event: MutationEvent) -> Result<bool, EngineError> {
        let target = event.target;
        match self.pipeline.publish(event).await {
            Ok(_) => Ok(true),
            Err(PipelineError::Overflow { chain, event_id }) => {
                warn!(
                    chain = chain.as_str(),
                    event_id = %event_id,
                    target = %target,
                    "Handler chain full; event dropped"
                );
                self.repair.mark_suspect(target, chain.counter());
                Ok(false)
            }
            Err(PipelineError::Closed) => Err(EngineError::ShutDown),
        }
    }
}
