use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Registers units and help text for every engine metric. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tally_pipeline_published_total",
            Unit::Count,
            "Total number of mutation events accepted by a handler chain."
        );
        describe_counter!(
            "tally_pipeline_dropped_total",
            Unit::Count,
            "Total number of mutation events dropped because a chain buffer was full."
        );
        describe_counter!(
            "tally_lock_timeout_total",
            Unit::Count,
            "Total number of aggregate lock acquisitions that timed out."
        );
        describe_counter!(
            "tally_handler_failure_total",
            Unit::Count,
            "Total number of events a handler failed to apply."
        );
        describe_histogram!(
            "tally_chain_batch_size",
            Unit::Count,
            "Events drained per handler chain batch."
        );
        describe_histogram!(
            "tally_chain_batch_ms",
            Unit::Milliseconds,
            "Handler chain batch processing time in milliseconds."
        );
        describe_counter!(
            "tally_flush_total",
            Unit::Count,
            "Total number of successful batch flushes to the count store."
        );
        describe_counter!(
            "tally_flush_failure_total",
            Unit::Count,
            "Total number of failed batch flushes."
        );
        describe_histogram!(
            "tally_flush_ms",
            Unit::Milliseconds,
            "Batch flush latency in milliseconds."
        );
        describe_gauge!(
            "tally_pending_deltas",
            Unit::Count,
            "Targets with unflushed deltas, per counter."
        );
        describe_counter!(
            "tally_repair_total",
            Unit::Count,
            "Repair checks by outcome (in_sync, seeded, repaired, failed)."
        );
        describe_counter!(
            "tally_search_cache_total",
            Unit::Count,
            "Search cache lookups by outcome (hit, empty_hit, miss, bypass)."
        );
    });
}
