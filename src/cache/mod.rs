//! Tally cache layer
//!
//! Everything the engine keeps in the shared key/value cache goes through
//! this module:
//!
//! - **Counters**: per-target soft counts (`count:{type}:{id}:{counter}`)
//! - **Relations**: per-(user, target) like flags (`like:rel:{user}:{id}:{type}`)
//! - **View markers**: de-duplication markers with a TTL
//! - **Search entries**: cached result pages, empty markers and the hot
//!   keyword ranking (written by [`crate::search`])
//!
//! The cache is never authoritative. Drift from the store is corrected by the
//! repair service.

mod backend;
mod counter;
pub mod keys;
pub(crate) mod lock;

pub use backend::{CacheBackend, CacheError};
pub use counter::CounterCache;
pub use keys::{CounterKey, RelationKey};
