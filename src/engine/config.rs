//! Engine configuration.
//!
//! Controls the handler chains, aggregate locks, batching, repair and the
//! search cache via the `[pipeline]`, `[locks]`, `[batch]`, `[repair]` and
//! `[search]` tables of `tally.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_ENQUEUE_WAIT_MS: u64 = 0;
const DEFAULT_DRAIN_LIMIT: usize = 100;
const DEFAULT_LOCK_WAIT_MS: u64 = 1_000;
const DEFAULT_LOCK_LEASE_MS: u64 = 10_000;
const DEFAULT_LOCK_RETRY_MS: u64 = 100;
const DEFAULT_BATCH_SIZE_THRESHOLD: usize = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_PENDING_ALERT_THRESHOLD: usize = 10_000;
const DEFAULT_VIEW_DEDUP_WINDOW_SECS: u64 = 300;
const DEFAULT_REPAIR_INTERVAL_MS: u64 = 60_000;
const DEFAULT_REPAIR_SAMPLE_SIZE: usize = 100;
const DEFAULT_REPAIR_WATCH_LIMIT: usize = 10_000;
const DEFAULT_NORMAL_TTL_SECS: u64 = 300;
const DEFAULT_HOT_TTL_SECS: u64 = 3_600;
const DEFAULT_EMPTY_TTL_SECS: u64 = 60;
const DEFAULT_HOT_EMPTY_TTL_SECS: u64 = 300;
const DEFAULT_HOT_THRESHOLD: u64 = 10;
const DEFAULT_HOT_RETENTION: usize = 1_000;
const DEFAULT_HOT_SET_TTL_SECS: u64 = 7 * 24 * 3_600;
const DEFAULT_TTL_JITTER_RATIO: f64 = 0.1;
const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub locks: LockConfig,
    pub batch: BatchConfig,
    pub repair: RepairConfig,
    pub search: SearchCacheConfig,
    /// Key capacity of the in-process cache backend.
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Buffered events per handler chain.
    pub channel_capacity: usize,
    /// How long `publish` may wait for buffer space; zero never waits.
    pub enqueue_wait_ms: u64,
    /// Maximum events a chain drains into one batch.
    pub drain_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            enqueue_wait_ms: DEFAULT_ENQUEUE_WAIT_MS,
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }
}

impl PipelineConfig {
    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }

    pub fn drain_limit(&self) -> usize {
        self.drain_limit.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub wait_timeout_ms: u64,
    pub lease_timeout_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_LOCK_WAIT_MS,
            lease_timeout_ms: DEFAULT_LOCK_LEASE_MS,
            retry_interval_ms: DEFAULT_LOCK_RETRY_MS,
        }
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Poll interval while waiting; never below one millisecond.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Distinct pending targets that force a flush at the next boundary.
    pub size_threshold: usize,
    pub flush_interval_ms: u64,
    /// Pending targets above which failed flushes are escalated to `error!`.
    pub pending_alert_threshold: usize,
    /// Repeat views by one actor inside this window are ignored; zero disables.
    pub view_dedup_window_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_BATCH_SIZE_THRESHOLD,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            pending_alert_threshold: DEFAULT_PENDING_ALERT_THRESHOLD,
            view_dedup_window_secs: DEFAULT_VIEW_DEDUP_WINDOW_SECS,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn view_dedup_window(&self) -> Option<Duration> {
        (self.view_dedup_window_secs > 0)
            .then(|| Duration::from_secs(self.view_dedup_window_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Run the scheduled repair loop.
    pub enabled: bool,
    pub interval_ms: u64,
    /// Watched entries checked per scheduled cycle.
    pub sample_size: usize,
    /// Recently touched counters and relations remembered for repair.
    pub watch_limit: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_REPAIR_INTERVAL_MS,
            sample_size: DEFAULT_REPAIR_SAMPLE_SIZE,
            watch_limit: DEFAULT_REPAIR_WATCH_LIMIT,
        }
    }
}

impl RepairConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchCacheConfig {
    pub normal_ttl_secs: u64,
    pub hot_ttl_secs: u64,
    pub empty_ttl_secs: u64,
    pub hot_empty_ttl_secs: u64,
    /// Query count at which a keyword is considered hot.
    pub hot_threshold: u64,
    /// Keywords kept in the hot ranking.
    pub hot_retention: usize,
    pub hot_set_ttl_secs: u64,
    /// Relative TTL spread; 0.1 jitters within ±10 %.
    pub ttl_jitter_ratio: f64,
}

impl Default for SearchCacheConfig {
    fn default() -> Self {
        Self {
            normal_ttl_secs: DEFAULT_NORMAL_TTL_SECS,
            hot_ttl_secs: DEFAULT_HOT_TTL_SECS,
            empty_ttl_secs: DEFAULT_EMPTY_TTL_SECS,
            hot_empty_ttl_secs: DEFAULT_HOT_EMPTY_TTL_SECS,
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            hot_retention: DEFAULT_HOT_RETENTION,
            hot_set_ttl_secs: DEFAULT_HOT_SET_TTL_SECS,
            ttl_jitter_ratio: DEFAULT_TTL_JITTER_RATIO,
        }
    }
}

impl SearchCacheConfig {
    /// Base TTL for a result page before jitter.
    pub fn result_ttl(&self, hot: bool) -> Duration {
        Duration::from_secs(if hot {
            self.hot_ttl_secs
        } else {
            self.normal_ttl_secs
        })
    }

    /// Base TTL for an empty-result marker before jitter.
    pub fn empty_ttl(&self, hot: bool) -> Duration {
        Duration::from_secs(if hot {
            self.hot_empty_ttl_secs
        } else {
            self.empty_ttl_secs
        })
    }

    pub fn hot_set_ttl(&self) -> Duration {
        Duration::from_secs(self.hot_set_ttl_secs)
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.ttl_jitter_ratio.clamp(0.0, 1.0)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            locks: LockConfig::default(),
            batch: BatchConfig::default(),
            repair: RepairConfig::default(),
            search: SearchCacheConfig::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity.max(1)
    }
}

impl From<&crate::config::Settings> for EngineConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let pipeline = &settings.pipeline;
        let locks = &settings.locks;
        let batch = &settings.batch;
        let repair = &settings.repair;
        let search = &settings.search;

        Self {
            pipeline: PipelineConfig {
                channel_capacity: pipeline.channel_capacity.get(),
                enqueue_wait_ms: duration_ms(pipeline.enqueue_wait),
                drain_limit: pipeline.drain_limit.get(),
            },
            locks: LockConfig {
                wait_timeout_ms: duration_ms(locks.wait_timeout),
                lease_timeout_ms: duration_ms(locks.lease_timeout),
                retry_interval_ms: duration_ms(locks.retry_interval),
            },
            batch: BatchConfig {
                size_threshold: batch.size_threshold.get(),
                flush_interval_ms: duration_ms(batch.flush_interval),
                pending_alert_threshold: batch.pending_alert_threshold,
                view_dedup_window_secs: batch.view_dedup_window.as_secs(),
            },
            repair: RepairConfig {
                enabled: repair.enabled,
                interval_ms: duration_ms(repair.interval),
                sample_size: repair.sample_size.get(),
                watch_limit: repair.watch_limit.get(),
            },
            search: SearchCacheConfig {
                normal_ttl_secs: search.normal_ttl.as_secs(),
                hot_ttl_secs: search.hot_ttl.as_secs(),
                empty_ttl_secs: search.empty_ttl.as_secs(),
                hot_empty_ttl_secs: search.hot_empty_ttl.as_secs(),
                hot_threshold: search.hot_threshold,
                hot_retention: search.hot_retention.get(),
                hot_set_ttl_secs: search.hot_set_ttl.as_secs(),
                ttl_jitter_ratio: search.ttl_jitter_ratio,
            },
            cache_capacity: settings.cache.capacity.get(),
        }
    }
}

fn duration_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}
