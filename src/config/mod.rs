//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::engine::EngineConfig;

mod cli;

pub use cli::{CliArgs, RunOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tally";
const ENV_PREFIX: &str = "TALLY";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub pipeline: PipelineSettings,
    pub locks: LockSettings,
    pub batch: BatchSettings,
    pub repair: RepairSettings,
    pub search: SearchSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channel_capacity: NonZeroUsize,
    /// Zero means publishing never waits.
    pub enqueue_wait: Duration,
    pub drain_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub wait_timeout: Duration,
    pub lease_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub size_threshold: NonZeroUsize,
    pub flush_interval: Duration,
    pub pending_alert_threshold: usize,
    /// Zero disables view de-duplication.
    pub view_dedup_window: Duration,
}

#[derive(Debug, Clone)]
pub struct RepairSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub sample_size: NonZeroUsize,
    pub watch_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub normal_ttl: Duration,
    pub hot_ttl: Duration,
    pub empty_ttl: Duration,
    pub hot_empty_ttl: Duration,
    pub hot_set_ttl: Duration,
    pub hot_threshold: u64,
    pub hot_retention: NonZeroUsize,
    pub ttl_jitter_ratio: f64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    pipeline: RawPipelineSettings,
    locks: RawLockSettings,
    batch: RawBatchSettings,
    repair: RawRepairSettings,
    search: RawSearchSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(capacity) = overrides.cache_capacity {
            self.cache.capacity = Some(capacity);
        }
        if let Some(capacity) = overrides.pipeline_channel_capacity {
            self.pipeline.channel_capacity = Some(capacity);
        }
        if let Some(wait) = overrides.pipeline_enqueue_wait_ms {
            self.pipeline.enqueue_wait_ms = Some(wait);
        }
        if let Some(wait) = overrides.lock_wait_timeout_ms {
            self.locks.wait_timeout_ms = Some(wait);
        }
        if let Some(threshold) = overrides.batch_size_threshold {
            self.batch.size_threshold = Some(threshold);
        }
        if let Some(interval) = overrides.batch_flush_interval_ms {
            self.batch.flush_interval_ms = Some(interval);
        }
        if let Some(enabled) = overrides.repair_enabled {
            self.repair.enabled = Some(enabled);
        }
        if let Some(interval) = overrides.repair_interval_ms {
            self.repair.interval_ms = Some(interval);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            pipeline,
            locks,
            batch,
            repair,
            search,
        } = raw;
        let defaults = EngineConfig::default();

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache, &defaults)?,
            pipeline: build_pipeline_settings(pipeline, &defaults)?,
            locks: build_lock_settings(locks, &defaults)?,
            batch: build_batch_settings(batch, &defaults)?,
            repair: build_repair_settings(repair, &defaults)?,
            search: build_search_settings(search, &defaults)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    defaults: &EngineConfig,
) -> Result<CacheSettings, LoadError> {
    let capacity = non_zero_usize(
        cache.capacity,
        defaults.cache_capacity,
        "cache.capacity",
    )?;
    Ok(CacheSettings { capacity })
}

fn build_pipeline_settings(
    pipeline: RawPipelineSettings,
    defaults: &EngineConfig,
) -> Result<PipelineSettings, LoadError> {
    let channel_capacity = non_zero_usize(
        pipeline.channel_capacity,
        defaults.pipeline.channel_capacity,
        "pipeline.channel_capacity",
    )?;
    let drain_limit = non_zero_usize(
        pipeline.drain_limit,
        defaults.pipeline.drain_limit,
        "pipeline.drain_limit",
    )?;
    let enqueue_wait = Duration::from_millis(
        pipeline
            .enqueue_wait_ms
            .unwrap_or(defaults.pipeline.enqueue_wait_ms),
    );

    Ok(PipelineSettings {
        channel_capacity,
        enqueue_wait,
        drain_limit,
    })
}

fn build_lock_settings(
    locks: RawLockSettings,
    defaults: &EngineConfig,
) -> Result<LockSettings, LoadError> {
    let wait_timeout = positive_millis(
        locks.wait_timeout_ms,
        defaults.locks.wait_timeout_ms,
        "locks.wait_timeout_ms",
    )?;
    let lease_timeout = positive_millis(
        locks.lease_timeout_ms,
        defaults.locks.lease_timeout_ms,
        "locks.lease_timeout_ms",
    )?;
    let retry_interval = positive_millis(
        locks.retry_interval_ms,
        defaults.locks.retry_interval_ms,
        "locks.retry_interval_ms",
    )?;

    if retry_interval > wait_timeout {
        return Err(LoadError::invalid(
            "locks.retry_interval_ms",
            "must not exceed locks.wait_timeout_ms",
        ));
    }

    Ok(LockSettings {
        wait_timeout,
        lease_timeout,
        retry_interval,
    })
}

fn build_batch_settings(
    batch: RawBatchSettings,
    defaults: &EngineConfig,
) -> Result<BatchSettings, LoadError> {
    let size_threshold = non_zero_usize(
        batch.size_threshold,
        defaults.batch.size_threshold,
        "batch.size_threshold",
    )?;
    let flush_interval = positive_millis(
        batch.flush_interval_ms,
        defaults.batch.flush_interval_ms,
        "batch.flush_interval_ms",
    )?;
    let pending_alert_threshold = match batch.pending_alert_threshold {
        Some(value) => usize::try_from(value).map_err(|_| {
            LoadError::invalid(
                "batch.pending_alert_threshold",
                "value exceeds supported range",
            )
        })?,
        None => defaults.batch.pending_alert_threshold,
    };
    let view_dedup_window = Duration::from_secs(
        batch
            .view_dedup_window_seconds
            .unwrap_or(defaults.batch.view_dedup_window_secs),
    );

    Ok(BatchSettings {
        size_threshold,
        flush_interval,
        pending_alert_threshold,
        view_dedup_window,
    })
}

fn build_repair_settings(
    repair: RawRepairSettings,
    defaults: &EngineConfig,
) -> Result<RepairSettings, LoadError> {
    let interval = positive_millis(
        repair.interval_ms,
        defaults.repair.interval_ms,
        "repair.interval_ms",
    )?;
    let sample_size = non_zero_usize(
        repair.sample_size,
        defaults.repair.sample_size,
        "repair.sample_size",
    )?;
    let watch_limit = non_zero_usize(
        repair.watch_limit,
        defaults.repair.watch_limit,
        "repair.watch_limit",
    )?;

    Ok(RepairSettings {
        enabled: repair.enabled.unwrap_or(defaults.repair.enabled),
        interval,
        sample_size,
        watch_limit,
    })
}

fn build_search_settings(
    search: RawSearchSettings,
    defaults: &EngineConfig,
) -> Result<SearchSettings, LoadError> {
    let base = &defaults.search;
    let normal_ttl = positive_secs(
        search.normal_ttl_seconds,
        base.normal_ttl_secs,
        "search.normal_ttl_seconds",
    )?;
    let hot_ttl = positive_secs(
        search.hot_ttl_seconds,
        base.hot_ttl_secs,
        "search.hot_ttl_seconds",
    )?;
    let empty_ttl = positive_secs(
        search.empty_ttl_seconds,
        base.empty_ttl_secs,
        "search.empty_ttl_seconds",
    )?;
    let hot_empty_ttl = positive_secs(
        search.hot_empty_ttl_seconds,
        base.hot_empty_ttl_secs,
        "search.hot_empty_ttl_seconds",
    )?;
    let hot_set_ttl = positive_secs(
        search.hot_set_ttl_seconds,
        base.hot_set_ttl_secs,
        "search.hot_set_ttl_seconds",
    )?;
    let hot_retention = non_zero_usize(
        search.hot_retention,
        base.hot_retention,
        "search.hot_retention",
    )?;

    let hot_threshold = search.hot_threshold.unwrap_or(base.hot_threshold);
    if hot_threshold == 0 {
        return Err(LoadError::invalid(
            "search.hot_threshold",
            "must be greater than zero",
        ));
    }

    let ttl_jitter_ratio = search.ttl_jitter_ratio.unwrap_or(base.ttl_jitter_ratio);
    if !(0.0..1.0).contains(&ttl_jitter_ratio) {
        return Err(LoadError::invalid(
            "search.ttl_jitter_ratio",
            "must be at least 0 and below 1",
        ));
    }

    Ok(SearchSettings {
        normal_ttl,
        hot_ttl,
        empty_ttl,
        hot_empty_ttl,
        hot_set_ttl,
        hot_threshold,
        hot_retention,
        ttl_jitter_ratio,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPipelineSettings {
    channel_capacity: Option<u64>,
    enqueue_wait_ms: Option<u64>,
    drain_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    wait_timeout_ms: Option<u64>,
    lease_timeout_ms: Option<u64>,
    retry_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBatchSettings {
    size_threshold: Option<u64>,
    flush_interval_ms: Option<u64>,
    pending_alert_threshold: Option<u64>,
    view_dedup_window_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRepairSettings {
    enabled: Option<bool>,
    interval_ms: Option<u64>,
    sample_size: Option<u64>,
    watch_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSearchSettings {
    normal_ttl_seconds: Option<u64>,
    hot_ttl_seconds: Option<u64>,
    empty_ttl_seconds: Option<u64>,
    hot_empty_ttl_seconds: Option<u64>,
    hot_set_ttl_seconds: Option<u64>,
    hot_threshold: Option<u64>,
    hot_retention: Option<u64>,
    ttl_jitter_ratio: Option<f64>,
}

fn non_zero_usize(
    value: Option<u64>,
    default: usize,
    key: &'static str,
) -> Result<NonZeroUsize, LoadError> {
    let value = match value {
        Some(value) => usize::try_from(value)
            .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?,
        None => default,
    };
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_millis(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        millis => Ok(Duration::from_millis(millis)),
    }
}

fn positive_secs(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[cfg(test)]
mod tests;
