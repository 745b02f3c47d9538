//! Collaborator traits describing the authoritative store and the search engine.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::pagination::Page;
use crate::domain::types::{CounterName, TargetRef, UserId};
use crate::search::SearchFilter;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Source of truth for counts and user relations.
#[async_trait]
pub trait CountStore: Send + Sync {
    async fn find_authoritative_count(
        &self,
        target: TargetRef,
        counter: CounterName,
    ) -> Result<i64, RepoError>;

    /// Applies every delta in `deltas` to `counter`; all or nothing.
    async fn batch_update_counts(
        &self,
        counter: CounterName,
        deltas: &HashMap<TargetRef, i64>,
    ) -> Result<(), RepoError>;

    async fn find_relation(&self, user: UserId, target: TargetRef) -> Result<bool, RepoError>;

    async fn save_relation(
        &self,
        user: UserId,
        target: TargetRef,
        present: bool,
    ) -> Result<(), RepoError>;
}

/// A ranked document returned by the search collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub target: TargetRef,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum SearchBackendError {
    #[error("search engine unavailable: {0}")]
    Unavailable(String),
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
}

/// Full-text search engine or its relational fallback.
///
/// Implementations must be idempotent and side-effect free.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn query(
        &self,
        keyword: &str,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<SearchDocument>, SearchBackendError>;

    fn name(&self) -> &'static str;
}
