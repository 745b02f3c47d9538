//! Delta batching between the counter cache and the count store.
//!
//! Each handler chain owns one [`BatchAccumulator`]. Deltas are summed per
//! target in memory and written to the store in one call when the batch is
//! large enough or old enough. Pending deltas are also mirrored into the shared
//! [`PendingLedger`] so the repair service can tell legitimate lag from drift.
//!
//! Pending deltas live only in memory: a crash between accumulation and flush
//! loses them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::application::repos::{CountStore, RepoError};
use crate::cache::keys::CounterKey;
use crate::domain::types::{CounterName, TargetRef};

use super::config::BatchConfig;

const METRIC_FLUSH: &str = "tally_flush_total";
const METRIC_FLUSH_FAILURE: &str = "tally_flush_failure_total";
const METRIC_FLUSH_MS: &str = "tally_flush_ms";
const METRIC_PENDING: &str = "tally_pending_deltas";

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Threshold,
    Interval,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("flushing {pending} pending `{counter}` deltas failed: {source}")]
    Store {
        counter: CounterName,
        pending: usize,
        #[source]
        source: RepoError,
    },
}

/// Unflushed deltas of every chain, readable from any task.
///
/// `epoch` is bumped before and after each store write so that a reader can
/// detect a flush racing with its own reads (odd epoch means in flight).
#[derive(Debug, Default)]
pub struct PendingLedger {
    deltas: DashMap<CounterKey, i64>,
    epoch: AtomicU64,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, key: CounterKey) -> i64 {
        self.deltas.get(&key).map(|delta| *delta).unwrap_or(0)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of counters with a non-zero unflushed delta.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn add(&self, key: CounterKey, delta: i64) {
        *self.deltas.entry(key).or_insert(0) += delta;
        self.deltas.remove_if(&key, |_, pending| *pending == 0);
    }

    fn settle(&self, counter: CounterName, flushed: &HashMap<TargetRef, i64>) {
        for (target, delta) in flushed {
            let key = CounterKey::new(*target, counter);
            self.deltas.alter(&key, |_, pending| pending - delta);
            self.deltas.remove_if(&key, |_, pending| *pending == 0);
        }
    }

    fn begin_flush(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn end_flush(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct BatchAccumulator {
    counter: CounterName,
    store: Arc<dyn CountStore>,
    ledger: Arc<PendingLedger>,
    pending: HashMap<TargetRef, i64>,
    size_threshold: usize,
    flush_interval: Duration,
    alert_threshold: usize,
    last_flush: Instant,
    failure_streak: u32,
    recovered: Vec<TargetRef>,
}

impl BatchAccumulator {
    pub fn new(
        counter: CounterName,
        store: Arc<dyn CountStore>,
        ledger: Arc<PendingLedger>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            counter,
            store,
            ledger,
            pending: HashMap::new(),
            size_threshold: config.size_threshold.max(1),
            flush_interval: config.flush_interval(),
            alert_threshold: config.pending_alert_threshold,
            last_flush: Instant::now(),
            failure_streak: 0,
            recovered: Vec::new(),
        }
    }

    pub fn counter(&self) -> CounterName {
        self.counter
    }

    pub fn add(&mut self, target: TargetRef, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.pending.entry(target).or_insert(0) += delta;
        self.ledger.add(CounterKey::new(target, self.counter), delta);
        gauge!(METRIC_PENDING, "counter" => self.counter.code()).set(self.pending.len() as f64);
    }

    /// Number of targets with unflushed deltas.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_delta(&self, target: TargetRef) -> i64 {
        self.pending.get(&target).copied().unwrap_or(0)
    }

    /// Flushes when a trigger holds at a batch boundary; returns whether a
    /// flush succeeded. The size threshold is checked before the interval.
    pub async fn maybe_flush(&mut self, is_batch_boundary: bool) -> Result<bool, FlushError> {
        if !is_batch_boundary {
            return Ok(false);
        }
        match self.due() {
            Some(reason) => self.flush(reason).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Flushes unconditionally when anything is pending.
    pub async fn flush_now(&mut self, reason: FlushReason) -> Result<bool, FlushError> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        self.flush(reason).await.map(|()| true)
    }

    /// Targets written by a flush that followed failed attempts. The cache may
    /// have drifted for them while the store was unreachable.
    pub fn take_recovered(&mut self) -> Vec<TargetRef> {
        std::mem::take(&mut self.recovered)
    }

    fn due(&self) -> Option<FlushReason> {
        if self.pending.is_empty() {
            return None;
        }
        if self.pending.len() >= self.size_threshold {
            return Some(FlushReason::Threshold);
        }
        if self.last_flush.elapsed() >= self.flush_interval {
            return Some(FlushReason::Interval);
        }
        None
    }

    async fn flush(&mut self, reason: FlushReason) -> Result<(), FlushError> {
        let payload: HashMap<TargetRef, i64> = self
            .pending
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(target, delta)| (*target, *delta))
            .collect();

        if payload.is_empty() {
            self.pending.clear();
            self.last_flush = Instant::now();
            return Ok(());
        }

        let started_at = std::time::Instant::now();
        self.ledger.begin_flush();
        let result = self.store.batch_update_counts(self.counter, &payload).await;
        if result.is_ok() {
            self.ledger.settle(self.counter, &payload);
        }
        self.ledger.end_flush();
        self.last_flush = Instant::now();

        match result {
            Ok(()) => {
                let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
                counter!(METRIC_FLUSH, "counter" => self.counter.code(), "reason" => reason.as_str())
                    .increment(1);
                histogram!(METRIC_FLUSH_MS, "counter" => self.counter.code()).record(elapsed_ms);
                gauge!(METRIC_PENDING, "counter" => self.counter.code()).set(0.0);

                if self.failure_streak > 0 {
                    info!(
                        counter = self.counter.code(),
                        failed_attempts = self.failure_streak,
                        targets = payload.len(),
                        "Batch flush recovered after failures"
                    );
                    self.recovered.extend(payload.keys().copied());
                    self.failure_streak = 0;
                }

                info!(
                    counter = self.counter.code(),
                    reason = reason.as_str(),
                    targets = payload.len(),
                    elapsed_ms,
                    "Batch flushed"
                );
                self.pending.clear();
                Ok(())
            }
            Err(source) => {
                self.failure_streak += 1;
                counter!(METRIC_FLUSH_FAILURE, "counter" => self.counter.code()).increment(1);

                let pending = self.pending.len();
                if pending > self.alert_threshold {
                    error!(
                        counter = self.counter.code(),
                        pending,
                        alert_threshold = self.alert_threshold,
                        failed_attempts = self.failure_streak,
                        error = %source,
                        "Pending deltas exceed alert threshold; count store is not accepting flushes"
                    );
                } else {
                    warn!(
                        counter = self.counter.code(),
                        reason = reason.as_str(),
                        pending,
                        failed_attempts = self.failure_streak,
                        error = %source,
                        "Batch flush failed; deltas retained"
                    );
                }
                Err(FlushError::Store {
                    counter: self.counter,
                    pending,
                    source,
                })
            }
        }
    }
}
