use std::collections::HashSet;
use std::sync::Arc;

use metrics_util::debugging::DebuggingRecorder;
use time::macros::datetime;

use tally::domain::types::{CounterName, TargetRef};
use tally::engine::config::RepairConfig;
use tally::engine::{CounterEngine, EngineBackends, EngineConfig};
use tally::infra::memory::{MemoryCountStore, MemorySearchBackend};
use tally::infra::telemetry;
use tally::search::SearchFilter;

#[tokio::test]
async fn engine_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let mut config = EngineConfig {
        repair: RepairConfig {
            enabled: false,
            ..RepairConfig::default()
        },
        ..EngineConfig::default()
    };
    config.pipeline.channel_capacity = 2;
    config.batch.size_threshold = 1;

    let store = Arc::new(MemoryCountStore::new());
    store.fail_next_flushes(1);
    let search = Arc::new(MemorySearchBackend::new());
    search.index(
        TargetRef::post(1),
        "metrics everywhere",
        datetime!(2026-05-01 00:00 UTC),
        1,
    );
    let backends = EngineBackends {
        store: store.clone(),
        search: search.clone(),
        ..EngineBackends::in_memory(&config)
    };
    let engine = CounterEngine::start(&config, backends);
    let post = TargetRef::post(1);

    // Published, then dropped on the full views chain.
    for user in 1..=3 {
        engine.publish_view_event(user, post).await.unwrap();
    }
    engine.publish_like_event(1, post, true).await.unwrap();
    engine.shutdown().await;

    engine
        .trigger_repair(post, CounterName::Views)
        .await
        .unwrap();
    let filter = SearchFilter::new();
    for keyword in ["metrics", "metrics", "absent"] {
        engine.search(keyword, &filter, 0, 10).await.unwrap();
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "tally_pipeline_published_total",
        "tally_pipeline_dropped_total",
        "tally_chain_batch_size",
        "tally_chain_batch_ms",
        "tally_flush_total",
        "tally_flush_failure_total",
        "tally_flush_ms",
        "tally_pending_deltas",
        "tally_repair_total",
        "tally_search_cache_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
