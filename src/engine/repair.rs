//! Consistency repair: the corrective path for cache drift.
//!
//! The count store always wins. A cached counter is compared with the store
//! plus whatever deltas are still waiting in a batch, and overwritten when the
//! two disagree. Relation flags are compared with the store directly because
//! handlers persist them synchronously. Repair never writes the store and never
//! takes the aggregate lock.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use lru::LruCache;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use crate::application::error::EngineError;
use crate::application::repos::CountStore;
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheError, CounterCache, CounterKey, RelationKey};
use crate::domain::types::{CounterName, TargetRef, UserId};

use super::batch::PendingLedger;
use super::config::RepairConfig;

const SOURCE: &str = "engine::repair";
const METRIC_REPAIR: &str = "tally_repair_total";

/// Result of comparing one cache entry with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    InSync,
    /// The cache had no usable entry and was seeded.
    Seeded,
    /// The cache disagreed and was overwritten. Informational, not an error.
    Repaired { cached: i64, authoritative: i64 },
}

impl RepairOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::Seeded => "seeded",
            Self::Repaired { .. } => "repaired",
        }
    }
}

/// A cache entry the repair service can check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairSubject {
    Counter(CounterKey),
    Relation(RelationKey),
}

/// Totals of one scheduled repair cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub checked: usize,
    pub in_sync: usize,
    pub seeded: usize,
    pub repaired: usize,
    pub failed: usize,
}

pub struct ConsistencyRepairService {
    cache: Arc<CounterCache>,
    store: Arc<dyn CountStore>,
    ledger: Arc<PendingLedger>,
    watched: Mutex<LruCache<RepairSubject, ()>>,
    suspects: DashSet<RepairSubject>,
    sample_size: usize,
}

impl ConsistencyRepairService {
    pub fn new(
        cache: Arc<CounterCache>,
        store: Arc<dyn CountStore>,
        ledger: Arc<PendingLedger>,
        config: &RepairConfig,
    ) -> Self {
        let limit = NonZeroUsize::new(config.watch_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache,
            store,
            ledger,
            watched: Mutex::new(LruCache::new(limit)),
            suspects: DashSet::new(),
            sample_size: config.sample_size.max(1),
        }
    }

    /// Remembers a recently touched counter for scheduled checks.
    pub fn watch(&self, target: TargetRef, counter: CounterName) {
        self.watch_subject(RepairSubject::Counter(CounterKey::new(target, counter)));
    }

    pub fn watch_relation(&self, user: UserId, target: TargetRef) {
        self.watch_subject(RepairSubject::Relation(RelationKey::new(user, target)));
    }

    /// Marks a counter whose cache entry may be wrong; the next read repairs it.
    pub fn mark_suspect(&self, target: TargetRef, counter: CounterName) {
        let subject = RepairSubject::Counter(CounterKey::new(target, counter));
        self.suspects.insert(subject);
        self.watch_subject(subject);
    }

    pub fn mark_relation_suspect(&self, user: UserId, target: TargetRef) {
        let subject = RepairSubject::Relation(RelationKey::new(user, target));
        self.suspects.insert(subject);
        self.watch_subject(subject);
    }

    pub fn is_suspect(&self, subject: &RepairSubject) -> bool {
        self.suspects.contains(subject)
    }

    pub fn watched_len(&self) -> usize {
        mutex_lock(&self.watched, SOURCE, "watched_len").len()
    }

    /// Repairs `subject` when it is marked suspect; returns `None` otherwise.
    pub async fn repair_if_suspect(
        &self,
        subject: RepairSubject,
    ) -> Result<Option<RepairOutcome>, EngineError> {
        if self.suspects.remove(&subject).is_none() {
            return Ok(None);
        }
        match self.repair_subject(subject).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.suspects.insert(subject);
                Err(err)
            }
        }
    }

    /// Brings the cached count of `(target, counter)` in line with the store.
    #[instrument(skip_all, fields(target = %target, counter = %counter))]
    pub async fn repair(
        &self,
        target: TargetRef,
        counter: CounterName,
    ) -> Result<RepairOutcome, EngineError> {
        let key = CounterKey::new(target, counter);
        let result = self.repair_counter(key).await;
        record(&result);
        result
    }

    /// Brings the cached like flag of `(user, target)` in line with the store.
    #[instrument(skip_all, fields(user = user, target = %target))]
    pub async fn repair_relation(
        &self,
        user: UserId,
        target: TargetRef,
    ) -> Result<RepairOutcome, EngineError> {
        let result = self.repair_relation_flag(user, target).await;
        record(&result);
        result
    }

    /// Checks pending suspects, then up to `sample_size` watched entries,
    /// least recently touched first.
    pub async fn run_cycle(&self) -> RepairSummary {
        let mut subjects: Vec<RepairSubject> =
            self.suspects.iter().map(|entry| *entry.key()).collect();
        for subject in &subjects {
            self.suspects.remove(subject);
        }

        let sampled = {
            let mut watched = mutex_lock(&self.watched, SOURCE, "run_cycle");
            let budget = self.sample_size.min(watched.len());
            let mut sampled = Vec::with_capacity(budget);
            while sampled.len() < budget {
                match watched.pop_lru() {
                    Some((subject, ())) => sampled.push(subject),
                    None => break,
                }
            }
            // Re-inserting rotates the sample to other entries next cycle.
            for subject in &sampled {
                watched.put(*subject, ());
            }
            sampled
        };
        for subject in sampled {
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }

        let mut summary = RepairSummary::default();
        for subject in subjects {
            summary.checked += 1;
            match self.repair_subject(subject).await {
                Ok(RepairOutcome::InSync) => summary.in_sync += 1,
                Ok(RepairOutcome::Seeded) => summary.seeded += 1,
                Ok(RepairOutcome::Repaired { .. }) => summary.repaired += 1,
                Err(err) => {
                    summary.failed += 1;
                    self.suspects.insert(subject);
                    warn!(subject = ?subject, error = %err, "Repair check failed");
                }
            }
        }

        if summary.repaired > 0 || summary.failed > 0 {
            info!(
                checked = summary.checked,
                repaired = summary.repaired,
                seeded = summary.seeded,
                failed = summary.failed,
                "Repair cycle finished"
            );
        } else {
            debug!(checked = summary.checked, "Repair cycle finished");
        }
        summary
    }

    /// Spawns the scheduled repair loop.
    pub fn spawn(self: Arc<Self>, config: &RepairConfig) -> JoinHandle<()> {
        let period = config.interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    fn watch_subject(&self, subject: RepairSubject) {
        mutex_lock(&self.watched, SOURCE, "watch").put(subject, ());
    }

    async fn repair_subject(&self, subject: RepairSubject) -> Result<RepairOutcome, EngineError> {
        match subject {
            RepairSubject::Counter(key) => self.repair(key.target, key.counter).await,
            RepairSubject::Relation(key) => self.repair_relation(key.user, key.target).await,
        }
    }

    async fn repair_counter(&self, key: CounterKey) -> Result<RepairOutcome, EngineError> {
        let epoch = self.ledger.epoch();
        let pending = self.ledger.pending(key);
        let authoritative = self
            .store
            .find_authoritative_count(key.target, key.counter)
            .await?;
        if epoch % 2 == 1 || self.ledger.epoch() != epoch {
            debug!(key = %key, "Flush raced with repair read; deferring");
            return Ok(RepairOutcome::InSync);
        }
        let expected = authoritative + pending;

        match self.cache.get(key).await {
            Ok(None) => {
                if self.cache.seed(key, expected).await? {
                    debug!(key = %key, value = expected, "Seeded counter during repair");
                    Ok(RepairOutcome::Seeded)
                } else {
                    Ok(RepairOutcome::InSync)
                }
            }
            Ok(Some(cached)) if cached == expected => Ok(RepairOutcome::InSync),
            Ok(Some(cached)) => {
                self.cache.set(key, expected).await?;
                warn!(
                    key = %key,
                    cached,
                    authoritative,
                    pending,
                    "Counter cache inconsistency detected; cache overwritten"
                );
                Ok(RepairOutcome::Repaired {
                    cached,
                    authoritative: expected,
                })
            }
            Err(CacheError::Corrupt { reason, .. }) => {
                self.cache.set(key, expected).await?;
                warn!(key = %key, reason = %reason, "Replaced corrupt counter entry");
                Ok(RepairOutcome::Seeded)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn repair_relation_flag(
        &self,
        user: UserId,
        target: TargetRef,
    ) -> Result<RepairOutcome, EngineError> {
        let cached = match self.cache.relation(user, target).await {
            Ok(cached) => cached,
            Err(CacheError::Corrupt { reason, .. }) => {
                let authoritative = self.store.find_relation(user, target).await?;
                self.cache.set_relation(user, target, authoritative).await?;
                warn!(user, target = %target, reason = %reason, "Replaced corrupt relation entry");
                return Ok(RepairOutcome::Seeded);
            }
            Err(err) => return Err(err.into()),
        };
        let authoritative = self.store.find_relation(user, target).await?;
        if cached == Some(authoritative) {
            return Ok(RepairOutcome::InSync);
        }

        // Handlers write the store before the cache; only the flag that was
        // compared may be overwritten.
        if !self
            .cache
            .replace_relation(user, target, cached, authoritative)
            .await?
        {
            debug!(user, target = %target, "Relation changed during repair; deferring");
            self.watch_relation(user, target);
            return Ok(RepairOutcome::InSync);
        }
        let latest = self.store.find_relation(user, target).await?;
        if latest != authoritative {
            // A full like/unlike round trip landed between the reads.
            self.cache
                .replace_relation(user, target, Some(authoritative), latest)
                .await?;
        }

        match cached {
            Some(flag) => {
                warn!(
                    user,
                    target = %target,
                    cached = flag,
                    authoritative,
                    "Relation cache inconsistency detected; cache overwritten"
                );
                Ok(RepairOutcome::Repaired {
                    cached: i64::from(flag),
                    authoritative: i64::from(authoritative),
                })
            }
            None => Ok(RepairOutcome::Seeded),
        }
    }
}

fn record(result: &Result<RepairOutcome, EngineError>) {
    let outcome = match result {
        Ok(outcome) => outcome.as_str(),
        Err(_) => "failed",
    };
    counter!(METRIC_REPAIR, "outcome" => outcome).increment(1);
}
