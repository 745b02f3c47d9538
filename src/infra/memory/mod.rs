//! In-process adapters for every collaborator the engine depends on.
//!
//! Used by the `tallyd` binary for single-instance deployments and by tests.

mod cache;
mod locks;
mod search;
mod store;

pub use cache::MemoryCacheBackend;
pub use locks::MemoryLockBackend;
pub use search::MemorySearchBackend;
pub use store::{FlushRecord, MemoryCountStore};
