//! Leased locks held in process memory.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::aggregate_lock::{LockBackend, LockError, LockHandle};

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    leases: DashMap<String, Lease>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a live lease.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: Uuid,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let now = Instant::now();
        let granted = Lease {
            holder,
            expires_at: now + lease,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(None);
                }
                occupied.insert(granted);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(granted);
            }
        }
        Ok(Some(LockHandle::new(key, holder, lease)))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let now = Instant::now();
        let removed = self.leases.remove_if(&handle.key, |_, lease| {
            lease.holder == handle.holder_id && lease.is_live(now)
        });
        if removed.is_some() {
            return Ok(true);
        }
        // An expired lease of ours is still cleaned up, but reported as lost.
        self.leases
            .remove_if(&handle.key, |_, lease| lease.holder == handle.holder_id);
        Ok(false)
    }

    async fn is_held(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(self
            .leases
            .get(&handle.key)
            .is_some_and(|lease| lease.holder == handle.holder_id && lease.is_live(now)))
    }
}
