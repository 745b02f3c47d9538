//! Search result caching.
//!
//! Sits in front of the full-text search collaborator. Result pages are cached
//! per keyword, filter and page; empty results leave a short-lived marker so
//! that repeated misses never reach the collaborator. Keyword popularity
//! decides how long entries live.

mod cache;
mod filter;
mod hot;

use thiserror::Error;

use crate::application::repos::SearchBackendError;

pub use cache::{CachedSearchResult, SearchCache, jittered};
pub use filter::{SearchFilter, SortOption};
pub use hot::{HotKeywordScore, HotKeywords};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search backend `{backend}` is unavailable")]
    Unavailable {
        backend: &'static str,
        #[source]
        source: SearchBackendError,
    },
}
