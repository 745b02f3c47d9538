use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::application::pagination::Page;
use crate::application::repos::SearchBackend;
use crate::cache::keys::{search_empty_key, search_result_key};
use crate::cache::{CacheBackend, CacheError};
use crate::domain::types::TargetRef;
use crate::engine::config::SearchCacheConfig;

use super::SearchError;
use super::filter::SearchFilter;
use super::hot::{HotKeywordScore, HotKeywords};

const METRIC_SEARCH_CACHE: &str = "tally_search_cache_total";
const EMPTY_MARKER: &str = "1";

/// A cached result page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSearchResult {
    pub keyword: String,
    pub filter_hash: String,
    pub page: u32,
    pub size: u32,
    pub items: Vec<TargetRef>,
    pub total_elements: u64,
    #[serde(with = "time::serde::timestamp")]
    pub cached_at: OffsetDateTime,
}

impl CachedSearchResult {
    fn into_page(self) -> Page<TargetRef> {
        Page::new(self.items, self.page, self.size, self.total_elements)
    }
}

/// Spreads `base` uniformly within `±ratio` so that entries written together
/// do not expire together.
pub fn jittered(base: Duration, ratio: f64) -> Duration {
    if base.is_zero() || ratio <= 0.0 {
        return base;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

pub struct SearchCache {
    cache: Arc<dyn CacheBackend>,
    backend: Arc<dyn SearchBackend>,
    hot: HotKeywords,
    config: SearchCacheConfig,
}

impl SearchCache {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        backend: Arc<dyn SearchBackend>,
        config: &SearchCacheConfig,
    ) -> Self {
        Self {
            hot: HotKeywords::new(cache.clone(), config),
            cache,
            backend,
            config: config.clone(),
        }
    }

    /// Returns one page of targets matching `keyword` under `filter`.
    ///
    /// Cache failures degrade to a collaborator query; only collaborator
    /// failures are returned.
    #[instrument(skip_all, fields(keyword = keyword, page = page, size = size))]
    pub async fn search(
        &self,
        keyword: &str,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<TargetRef>, SearchError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            record_outcome("bypass");
            return self.query_backend(keyword, filter, page, size).await;
        }

        let filter_hash = filter.filter_hash();
        let result_key = search_result_key(keyword, &filter_hash, page, size);
        if let Some(cached) = self.cached_page(&result_key).await {
            record_outcome("hit");
            self.record_keyword(keyword).await;
            return Ok(cached.into_page());
        }

        let empty_key = search_empty_key(&result_key);
        if self.empty_marker_present(&empty_key).await {
            record_outcome("empty_hit");
            self.record_keyword(keyword).await;
            return Ok(Page::empty(page, size));
        }

        record_outcome("miss");
        // Hotness is judged on the queries seen before this one.
        let hot = self.keyword_is_hot(keyword).await;
        let results = self.query_backend(keyword, filter, page, size).await?;
        self.record_keyword(keyword).await;

        if results.is_empty() {
            let ttl = jittered(self.config.empty_ttl(hot), self.config.jitter_ratio());
            self.write(&empty_key, EMPTY_MARKER.to_string(), ttl).await;
        } else {
            let entry = CachedSearchResult {
                keyword: keyword.to_string(),
                filter_hash,
                page,
                size,
                items: results.items.clone(),
                total_elements: results.total_elements,
                cached_at: OffsetDateTime::now_utc(),
            };
            match serde_json::to_string(&entry) {
                Ok(payload) => {
                    let ttl = jittered(self.config.result_ttl(hot), self.config.jitter_ratio());
                    self.write(&result_key, payload, ttl).await;
                }
                Err(err) => warn!(key = %result_key, error = %err, "Failed to encode search result"),
            }
        }
        Ok(results)
    }

    /// Most queried keywords, highest first.
    pub async fn hot_keywords(&self, limit: usize) -> Result<Vec<HotKeywordScore>, CacheError> {
        self.hot.top(limit).await
    }

    async fn query_backend(
        &self,
        keyword: &str,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<TargetRef>, SearchError> {
        let documents = self
            .backend
            .query(keyword, filter, page, size)
            .await
            .map_err(|source| SearchError::Unavailable {
                backend: self.backend.name(),
                source,
            })?;
        let mut results = documents.map(|document| document.target);
        results.items.truncate(size as usize);
        Ok(results)
    }

    async fn cached_page(&self, key: &str) -> Option<CachedSearchResult> {
        let payload = match self.cache.get(key).await {
            Ok(payload) => payload?,
            Err(err) => {
                warn!(key, error = %err, "Search cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(cached) => Some(cached),
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable search cache entry");
                if let Err(err) = self.cache.delete(key).await {
                    debug!(key, error = %err, "Failed to delete search cache entry");
                }
                None
            }
        }
    }

    async fn empty_marker_present(&self, key: &str) -> bool {
        self.cache.exists(key).await.unwrap_or_else(|err| {
            warn!(key, error = %err, "Search cache read failed; treating as miss");
            false
        })
    }

    async fn write(&self, key: &str, value: String, ttl: Duration) {
        if let Err(err) = self.cache.set(key, value, Some(ttl)).await {
            warn!(key, error = %err, "Failed to cache search result");
        }
    }

    async fn keyword_is_hot(&self, keyword: &str) -> bool {
        self.hot.is_hot(keyword).await.unwrap_or_else(|err| {
            warn!(keyword, error = %err, "Failed to read keyword score");
            false
        })
    }

    async fn record_keyword(&self, keyword: &str) {
        if let Err(err) = self.hot.record(keyword).await {
            warn!(keyword, error = %err, "Failed to record keyword query");
        }
    }
}

fn record_outcome(outcome: &'static str) {
    counter!(METRIC_SEARCH_CACHE, "outcome" => outcome).increment(1);
}
