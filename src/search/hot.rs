//! Hot keyword ranking.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::keys::{hot_keyword_seen_key, hot_keywords_key};
use crate::cache::{CacheBackend, CacheError};
use crate::engine::config::SearchCacheConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotKeywordScore {
    pub keyword: String,
    pub score: f64,
    /// Absent once the marker expired or was evicted ahead of the ranking.
    #[serde(with = "time::serde::timestamp::option")]
    pub last_seen_at: Option<OffsetDateTime>,
}

/// Query frequencies kept in a sorted set of the cache backend.
pub struct HotKeywords {
    cache: Arc<dyn CacheBackend>,
    threshold: f64,
    retention: usize,
    set_ttl: Duration,
}

impl HotKeywords {
    pub fn new(cache: Arc<dyn CacheBackend>, config: &SearchCacheConfig) -> Self {
        Self {
            cache,
            threshold: config.hot_threshold as f64,
            retention: config.hot_retention.max(1),
            set_ttl: config.hot_set_ttl(),
        }
    }

    /// Counts one query of `keyword` and returns its new score.
    pub async fn record(&self, keyword: &str) -> Result<f64, CacheError> {
        let key = hot_keywords_key();
        let score = self.cache.zincr(key, keyword, 1.0).await?;
        self.cache.ztrim(key, self.retention).await?;
        self.cache.expire(key, self.set_ttl).await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.cache
            .set(
                &hot_keyword_seen_key(keyword),
                now.to_string(),
                Some(self.set_ttl),
            )
            .await?;
        Ok(score)
    }

    fn is_hot_score(&self, score: f64) -> bool {
        score >= self.threshold
    }

    pub async fn is_hot(&self, keyword: &str) -> Result<bool, CacheError> {
        let score = self.cache.zscore(hot_keywords_key(), keyword).await?;
        Ok(score.is_some_and(|score| self.is_hot_score(score)))
    }

    /// Highest scoring keywords first.
    pub async fn top(&self, limit: usize) -> Result<Vec<HotKeywordScore>, CacheError> {
        let ranked = self.cache.ztop(hot_keywords_key(), limit).await?;
        let mut scores = Vec::with_capacity(ranked.len());
        for (keyword, score) in ranked {
            let last_seen_at = self
                .cache
                .get(&hot_keyword_seen_key(&keyword))
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());
            scores.push(HotKeywordScore {
                keyword,
                score,
                last_seen_at,
            });
        }
        Ok(scores)
    }
}
