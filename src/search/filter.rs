//! Search filters and their cache fingerprint.

use std::fmt;

use time::OffsetDateTime;

use crate::cache::keys::digest_hex;
use crate::domain::types::TargetType;

/// Result ordering requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SortOption {
    /// Newest first.
    #[default]
    Time,
    /// Most engaged first.
    Hot,
    /// Best keyword match first.
    Relevance,
}

impl SortOption {
    pub fn code(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Hot => "hot",
            Self::Relevance => "relevance",
        }
    }
}

impl fmt::Display for SortOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Restricts a keyword search. An empty `types` list means every type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub types: Vec<TargetType>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub sort: SortOption,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = TargetType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn between(mut self, start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn sorted_by(mut self, sort: SortOption) -> Self {
        self.sort = sort;
        self
    }

    /// Canonical text of the fields that change results.
    ///
    /// Type codes are sorted and de-duplicated; an absent time bound and the
    /// default sort contribute nothing, so the unfiltered search is `""`.
    pub fn canonical(&self) -> String {
        let mut parts = Vec::new();

        let mut codes: Vec<&str> = self.types.iter().map(|kind| kind.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        if !codes.is_empty() {
            parts.push(format!("types={}", codes.join(",")));
        }
        if let Some(start) = self.start {
            parts.push(format!("start={}", start.unix_timestamp()));
        }
        if let Some(end) = self.end {
            parts.push(format!("end={}", end.unix_timestamp()));
        }
        if self.sort != SortOption::default() {
            parts.push(format!("sort={}", self.sort));
        }

        parts.join("|")
    }

    /// Fingerprint used in result keys; empty for the unfiltered search.
    pub fn filter_hash(&self) -> String {
        let canonical = self.canonical();
        if canonical.is_empty() {
            return String::new();
        }
        digest_hex(&canonical)
    }

    /// Whether a document of `kind` created at `at` passes this filter.
    pub fn admits(&self, kind: TargetType, at: OffsetDateTime) -> bool {
        let type_ok = self.types.is_empty() || self.types.contains(&kind);
        let start_ok = self.start.is_none_or(|start| at >= start);
        let end_ok = self.end.is_none_or(|end| at <= end);
        type_ok && start_ok && end_ok
    }
}
