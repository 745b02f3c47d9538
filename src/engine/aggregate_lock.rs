//! Leased mutual exclusion keyed by aggregate.
//!
//! All handler chains touching one aggregate (`post:42`) serialize through the
//! same lock name, across chains and across service instances sharing a lock
//! backend. Every acquisition is bounded twice: by the wait timeout while
//! polling, and by the lease which expires even if the holder dies.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::LockConfig;

const METRIC_LOCK_TIMEOUT: &str = "tally_lock_timeout_total";

/// Proof of a granted lease. At most one live handle exists per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub holder_id: Uuid,
    pub acquired_at: OffsetDateTime,
    pub lease_expires_at: OffsetDateTime,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, holder_id: Uuid, lease: Duration) -> Self {
        let acquired_at = OffsetDateTime::now_utc();
        Self {
            key: key.into(),
            holder_id,
            acquired_at,
            lease_expires_at: acquired_at + lease,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock `{key}`")]
    Timeout { key: String, waited: Duration },
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Storage for leased locks. Each call is a single attempt; waiting is the
/// caller's concern.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Grants the lock to `holder` when it is free or its lease has expired.
    async fn try_acquire(
        &self,
        key: &str,
        holder: Uuid,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Compare-and-delete on the holder id. Returns whether this handle's
    /// lease was released; an expired lease taken by a successor is untouched.
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Whether `handle` still owns a live lease.
    async fn is_held(&self, handle: &LockHandle) -> Result<bool, LockError>;
}

#[derive(Clone)]
pub struct AggregateLock {
    backend: Arc<dyn LockBackend>,
    retry_interval: Duration,
}

impl AggregateLock {
    pub fn new(backend: Arc<dyn LockBackend>, config: &LockConfig) -> Self {
        Self {
            backend,
            retry_interval: config.retry_interval(),
        }
    }

    /// Polls the backend until the lock is granted or `wait_timeout` elapses.
    pub async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let holder = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + wait_timeout;

        loop {
            if let Some(handle) = self.backend.try_acquire(key, holder, lease_timeout).await? {
                debug!(
                    lock = key,
                    holder = %holder,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Aggregate lock acquired"
                );
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                counter!(METRIC_LOCK_TIMEOUT).increment(1);
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: now.duration_since(started),
                });
            }
            sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    /// Releases `handle`; failures are logged because the lease bounds them.
    pub async fn release(&self, handle: &LockHandle) -> bool {
        match self.backend.release(handle).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    lock = %handle.key,
                    holder = %handle.holder_id,
                    "Aggregate lock lease expired before release"
                );
                false
            }
            Err(err) => {
                warn!(
                    lock = %handle.key,
                    holder = %handle.holder_id,
                    error = %err,
                    "Failed to release aggregate lock; lease will expire"
                );
                false
            }
        }
    }

    /// Whether `handle` still owns its lease. Backend errors count as lost.
    pub async fn still_held(&self, handle: &LockHandle) -> bool {
        match self.backend.is_held(handle).await {
            Ok(held) => held,
            Err(err) => {
                warn!(lock = %handle.key, error = %err, "Failed to check aggregate lock");
                false
            }
        }
    }

    /// Runs `body` while holding the lock named `key`.
    ///
    /// The lock is released on every exit path of `body`: success, error or
    /// panic. A panic is resumed once the lock has been released.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let handle = self.acquire(key, wait_timeout, lease_timeout).await?;
        let outcome = AssertUnwindSafe(body(handle.clone())).catch_unwind().await;
        self.release(&handle).await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
