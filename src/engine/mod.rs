//! Counter engine
//!
//! Keeps soft counters (likes, comments, views) in the cache consistent with
//! the authoritative store under high write concurrency:
//!
//! - **Pipeline**: bounded per-chain channels; publishing never blocks
//! - **Handlers**: one task per chain applies events under an aggregate lock
//! - **Batches**: deltas are accumulated and written to the store in bulk
//! - **Repair**: drift between cache and store is detected and overwritten
//!
//! [`CounterEngine`] is the entry point.

pub mod aggregate_lock;
pub mod batch;
pub mod chain;
pub mod config;
mod facade;
pub mod handler;
pub mod pipeline;
pub mod repair;

pub use aggregate_lock::{AggregateLock, LockBackend, LockError, LockHandle};
pub use batch::{BatchAccumulator, FlushError, FlushReason, PendingLedger};
pub use config::EngineConfig;
pub use facade::{CounterEngine, EngineBackends};
pub use pipeline::{EventPipeline, HandlerChain, PipelineError};
pub use repair::{ConsistencyRepairService, RepairOutcome, RepairSubject, RepairSummary};
