use thiserror::Error;

use crate::{
    application::repos::RepoError, cache::CacheError, domain::error::DomainError,
    infra::error::InfraError, search::SearchError,
};

/// Errors surfaced by the public engine facade.
///
/// Transient write-path failures never reach callers; only reads, searches and
/// on-demand repairs return these.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("engine has been shut down")]
    ShutDown,
}

/// Top-level error of the `tallyd` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
}
