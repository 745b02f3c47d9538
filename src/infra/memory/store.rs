//! Authoritative count store kept in memory.
//!
//! Stands in for the relational store. Failures can be injected so that the
//! flush, compensation and repair paths can be exercised deterministically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::application::repos::{CountStore, RepoError};
use crate::cache::lock::mutex_lock;
use crate::domain::types::{CounterName, TargetRef, UserId};

const SOURCE: &str = "infra::memory::store";

/// One accepted `batch_update_counts` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRecord {
    pub counter: CounterName,
    pub deltas: HashMap<TargetRef, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryCountStore {
    counts: DashMap<(TargetRef, CounterName), i64>,
    relations: DashMap<(UserId, TargetRef), bool>,
    flushes: Mutex<Vec<FlushRecord>>,
    failing_flushes: AtomicUsize,
    failing_relations: AtomicBool,
    failing_reads: AtomicBool,
}

impl MemoryCountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self, target: TargetRef, counter: CounterName, value: i64) {
        self.counts.insert((target, counter), value);
    }

    pub fn count(&self, target: TargetRef, counter: CounterName) -> i64 {
        self.counts
            .get(&(target, counter))
            .map(|value| *value)
            .unwrap_or(0)
    }

    pub fn set_relation(&self, user: UserId, target: TargetRef, present: bool) {
        self.relations.insert((user, target), present);
    }

    pub fn relation(&self, user: UserId, target: TargetRef) -> bool {
        self.relations
            .get(&(user, target))
            .map(|present| *present)
            .unwrap_or(false)
    }

    /// The next `count` flushes fail with a persistence error.
    pub fn fail_next_flushes(&self, count: usize) {
        self.failing_flushes.store(count, Ordering::SeqCst);
    }

    pub fn set_relation_writes_failing(&self, failing: bool) {
        self.failing_relations.store(failing, Ordering::SeqCst);
    }

    pub fn set_reads_failing(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    /// Every accepted flush, oldest first.
    pub fn flushes(&self) -> Vec<FlushRecord> {
        mutex_lock(&self.flushes, SOURCE, "flushes").clone()
    }

    fn take_flush_failure(&self) -> bool {
        self.failing_flushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn check_reads(&self) -> Result<(), RepoError> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(RepoError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn find_authoritative_count(
        &self,
        target: TargetRef,
        counter: CounterName,
    ) -> Result<i64, RepoError> {
        self.check_reads()?;
        Ok(self.count(target, counter))
    }

    async fn batch_update_counts(
        &self,
        counter: CounterName,
        deltas: &HashMap<TargetRef, i64>,
    ) -> Result<(), RepoError> {
        if self.take_flush_failure() {
            return Err(RepoError::from_persistence("injected flush failure"));
        }

        // Recording under the log mutex keeps each batch atomic for readers.
        let mut log = mutex_lock(&self.flushes, SOURCE, "batch_update_counts");
        for (target, delta) in deltas {
            *self.counts.entry((*target, counter)).or_insert(0) += delta;
        }
        log.push(FlushRecord {
            counter,
            deltas: deltas.clone(),
        });
        Ok(())
    }

    async fn find_relation(&self, user: UserId, target: TargetRef) -> Result<bool, RepoError> {
        self.check_reads()?;
        Ok(self.relation(user, target))
    }

    async fn save_relation(
        &self,
        user: UserId,
        target: TargetRef,
        present: bool,
    ) -> Result<(), RepoError> {
        if self.failing_relations.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("injected relation failure"));
        }
        self.set_relation(user, target, present);
        Ok(())
    }
}
