//! Batch boundaries and flush triggers through a real handler chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tally::cache::CounterCache;
use tally::domain::events::MutationEvent;
use tally::domain::types::{CounterName, TargetRef};
use tally::engine::chain::ChainRunner;
use tally::engine::handler::{CounterHandler, HandlerContext};
use tally::engine::{
    AggregateLock, BatchAccumulator, ConsistencyRepairService, EngineConfig, PendingLedger,
};
use tally::infra::memory::{MemoryCacheBackend, MemoryCountStore, MemoryLockBackend};

fn views_runner(
    config: &EngineConfig,
    store: Arc<MemoryCountStore>,
) -> (
    mpsc::Sender<MutationEvent>,
    ChainRunner<CounterHandler>,
) {
    let cache = Arc::new(CounterCache::new(Arc::new(MemoryCacheBackend::new(4096))));
    let ledger = Arc::new(PendingLedger::new());
    let repair = Arc::new(ConsistencyRepairService::new(
        cache.clone(),
        store.clone(),
        ledger.clone(),
        &config.repair,
    ));
    let ctx = HandlerContext {
        cache,
        store: store.clone(),
        locks: AggregateLock::new(Arc::new(MemoryLockBackend::new()), &config.locks),
        repair,
    };
    let batch = BatchAccumulator::new(CounterName::Views, store, ledger, &config.batch);
    let handler = CounterHandler::new(ctx, batch, config);

    let (tx, rx) = mpsc::channel(config.pipeline.channel_capacity());
    let runner = ChainRunner::new(rx, handler, &config.pipeline, config.batch.flush_interval());
    (tx, runner)
}

async fn publish_views(tx: &mpsc::Sender<MutationEvent>, targets: std::ops::Range<u64>) {
    for id in targets {
        tx.send(MutationEvent::view(1, TargetRef::post(id)))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn threshold_flushes_only_at_the_boundary() {
    let config = EngineConfig::default();
    let store = Arc::new(MemoryCountStore::new());
    let (tx, mut runner) = views_runner(&config, store.clone());

    publish_views(&tx, 0..150).await;

    assert_eq!(runner.drain_once().await, 100);
    assert_eq!(runner.drain_once().await, 50);

    let flushes = store.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].counter, CounterName::Views);
    assert_eq!(flushes[0].deltas.len(), 100);
    assert_eq!(runner.handler().batch().pending_len(), 50);

    drop(tx);
    let handler = runner.finish().await;
    assert_eq!(handler.batch().pending_len(), 0);
    assert_eq!(store.flushes().len(), 2);
    assert_eq!(store.count(TargetRef::post(149), CounterName::Views), 1);
}

#[tokio::test(start_paused = true)]
async fn elapsed_interval_flushes_a_small_batch() {
    let config = EngineConfig::default();
    let store = Arc::new(MemoryCountStore::new());
    let (tx, mut runner) = views_runner(&config, store.clone());

    publish_views(&tx, 0..3).await;
    assert_eq!(runner.drain_once().await, 3);
    assert!(store.flushes().is_empty());

    tokio::time::advance(config.batch.flush_interval() + Duration::from_millis(1)).await;
    publish_views(&tx, 3..4).await;
    assert_eq!(runner.drain_once().await, 1);

    let flushes = store.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].deltas.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn idle_chain_flushes_on_the_interval() {
    let config = EngineConfig::default();
    let store = Arc::new(MemoryCountStore::new());
    let (tx, runner) = views_runner(&config, store.clone());

    publish_views(&tx, 0..5).await;
    let task = tokio::spawn(runner.run());

    tokio::time::sleep(config.batch.flush_interval() * 2 + Duration::from_millis(10)).await;
    assert_eq!(store.flushes().len(), 1);
    assert_eq!(store.count(TargetRef::post(4), CounterName::Views), 1);

    drop(tx);
    let handler = task.await.unwrap();
    assert_eq!(handler.batch().pending_len(), 0);
}
