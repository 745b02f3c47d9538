//! Cache key definitions.
//!
//! Keys are colon-separated `module:resource:...` strings so that they can be
//! shared with other service instances through an external cache server.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::domain::types::{CounterName, TargetRef, UserId};

const DIGEST_HEX_LEN: usize = 16;

/// Key of a per-target counter: `(target_type, target_id, counter_name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub target: TargetRef,
    pub counter: CounterName,
}

impl CounterKey {
    pub const fn new(target: TargetRef, counter: CounterName) -> Self {
        Self { target, counter }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count:{}:{}:{}",
            self.target.target_type, self.target.target_id, self.counter
        )
    }
}

/// Key of a per-(user, target) like relation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub user: UserId,
    pub target: TargetRef,
}

impl RelationKey {
    pub const fn new(user: UserId, target: TargetRef) -> Self {
        Self { user, target }
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "like:rel:{}:{}:{}",
            self.user, self.target.target_id, self.target.target_type
        )
    }
}

/// Marker recording that `user` viewed `target` within the de-duplication window.
pub fn view_marker_key(user: UserId, target: TargetRef) -> String {
    format!(
        "view:seen:{}:{}:{}",
        target.target_type, target.target_id, user
    )
}

/// Aggregate lock name; every counter of one aggregate shares it.
pub fn aggregate_lock_key(target: TargetRef) -> String {
    format!("lock:{}:{}", target.target_type, target.target_id)
}

/// Cached page of search results.
pub fn search_result_key(keyword: &str, filter_hash: &str, page: u32, size: u32) -> String {
    let keyword_digest = digest_hex(keyword);
    if filter_hash.is_empty() {
        format!("search:result:{keyword_digest}:{page}:{size}")
    } else {
        format!("search:result:{keyword_digest}:{filter_hash}:{page}:{size}")
    }
}

/// Negative-cache marker stored next to a result key.
pub fn search_empty_key(result_key: &str) -> String {
    format!("{result_key}:empty")
}

/// Sorted set of keyword query frequencies.
pub fn hot_keywords_key() -> &'static str {
    "search:hot:keywords"
}

/// Unix timestamp of the last query of `keyword`.
pub fn hot_keyword_seen_key(keyword: &str) -> String {
    format!("search:hot:seen:{}", digest_hex(keyword))
}

/// Truncated SHA-256 hex digest; stable across processes and releases.
pub fn digest_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(DIGEST_HEX_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_key_layout() {
        let key = CounterKey::new(TargetRef::post(42), CounterName::Likes);
        assert_eq!(key.to_string(), "count:post:42:like");
    }

    #[test]
    fn relation_key_layout() {
        let key = RelationKey::new(7, TargetRef::comment(9));
        assert_eq!(key.to_string(), "like:rel:7:9:comment");
    }

    #[test]
    fn search_keys_embed_filter_hash_only_when_present() {
        let plain = search_result_key("rust", "", 0, 10);
        let filtered = search_result_key("rust", "abcd", 0, 10);
        assert_ne!(plain, filtered);
        assert!(filtered.contains(":abcd:0:10"));
        assert_eq!(search_empty_key(&plain), format!("{plain}:empty"));
    }

    #[test]
    fn digest_is_stable_and_truncated() {
        let a = digest_hex("hello");
        assert_eq!(a.len(), DIGEST_HEX_LEN);
        assert_eq!(a, digest_hex("hello"));
        assert_ne!(a, digest_hex("hello "));
    }
}
