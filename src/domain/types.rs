use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Identifier of a forum user acting on an aggregate.
pub type UserId = u64;

/// Identifier of an aggregate within its [`TargetType`].
pub type TargetId = u64;

/// Kind of aggregate whose counters are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Post,
    Comment,
    Article,
}

impl TargetType {
    /// Stable code used in cache keys and filter hashes.
    pub fn code(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Article => "article",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TargetType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            "article" => Ok(Self::Article),
            other => Err(DomainError::UnknownTargetType(other.to_string())),
        }
    }
}

/// A concrete aggregate: `(target_type, target_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_type: TargetType,
    pub target_id: TargetId,
}

impl TargetRef {
    pub const fn new(target_type: TargetType, target_id: TargetId) -> Self {
        Self {
            target_type,
            target_id,
        }
    }

    pub const fn post(target_id: TargetId) -> Self {
        Self::new(TargetType::Post, target_id)
    }

    pub const fn comment(target_id: TargetId) -> Self {
        Self::new(TargetType::Comment, target_id)
    }

    pub const fn article(target_id: TargetId) -> Self {
        Self::new(TargetType::Article, target_id)
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type, self.target_id)
    }
}

/// Soft counters maintained per aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterName {
    Likes,
    Comments,
    Views,
}

impl CounterName {
    pub const ALL: [CounterName; 3] = [Self::Likes, Self::Comments, Self::Views];

    pub fn code(self) -> &'static str {
        match self {
            Self::Likes => "like",
            Self::Comments => "comment",
            Self::Views => "view",
        }
    }
}

impl fmt::Display for CounterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
