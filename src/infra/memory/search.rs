//! Substring search over registered documents.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::pagination::Page;
use crate::application::repos::{SearchBackend, SearchBackendError, SearchDocument};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::types::TargetRef;
use crate::search::{SearchFilter, SortOption};

const SOURCE: &str = "infra::memory::search";

#[derive(Debug, Clone)]
struct IndexedDocument {
    target: TargetRef,
    text: String,
    created_at: OffsetDateTime,
    popularity: i64,
}

#[derive(Debug, Default)]
pub struct MemorySearchBackend {
    documents: RwLock<Vec<IndexedDocument>>,
    queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(
        &self,
        target: TargetRef,
        text: impl Into<String>,
        created_at: OffsetDateTime,
        popularity: i64,
    ) {
        let text = text.into().to_lowercase();
        let mut documents = rw_write(&self.documents, SOURCE, "index");
        documents.retain(|doc| doc.target != target);
        documents.push(IndexedDocument {
            target,
            text,
            created_at,
            popularity,
        });
    }

    /// Number of queries that reached this backend.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchBackend for MemorySearchBackend {
    async fn query(
        &self,
        keyword: &str,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<SearchDocument>, SearchBackendError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SearchBackendError::Unavailable(
                "memory search marked unavailable".to_string(),
            ));
        }

        let needle = keyword.trim().to_lowercase();
        let documents = rw_read(&self.documents, SOURCE, "query");
        let mut matches: Vec<(usize, &IndexedDocument)> = documents
            .iter()
            .filter(|doc| filter.admits(doc.target.target_type, doc.created_at))
            .filter_map(|doc| {
                let hits = if needle.is_empty() {
                    1
                } else {
                    doc.text.matches(needle.as_str()).count()
                };
                (hits > 0).then_some((hits, doc))
            })
            .collect();

        match filter.sort {
            SortOption::Time => matches.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at)),
            SortOption::Hot => matches.sort_by(|a, b| b.1.popularity.cmp(&a.1.popularity)),
            SortOption::Relevance => matches.sort_by(|a, b| b.0.cmp(&a.0)),
        }

        let total = matches.len() as u64;
        let offset = (page as usize).saturating_mul(size as usize);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(size as usize)
            .map(|(hits, doc)| SearchDocument {
                target: doc.target,
                score: hits as f64,
            })
            .collect();

        Ok(Page::new(items, page, size, total))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
