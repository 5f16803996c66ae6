use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tokenizer::query_terms;
use crate::node::NodeState;
use crate::storage::models::{FileRecord, SearchVector};
use crate::storage::{Database, DatabaseError};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;

/// Exact-match filters, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchFilters {
    pub uploader: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    pub filters: SearchFilters,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub score: f64,
    #[serde(flatten)]
    pub file: FileRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Matches before pagination
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl SearchFilters {
    pub fn matches(&self, file: &FileRecord) -> bool {
        if self.uploader.as_ref().is_some_and(|u| *u != file.uploader) {
            return false;
        }
        if self.min_size.is_some_and(|min| file.size_bytes < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| file.size_bytes > max) {
            return false;
        }
        if self.created_after.is_some_and(|t| file.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| file.created_at > t) {
            return false;
        }
        if self
            .mime_type
            .as_ref()
            .is_some_and(|m| !m.eq_ignore_ascii_case(&file.mime_type))
        {
            return false;
        }
        self.tags
            .iter()
            .all(|(key, value)| file.tags.get(key) == Some(value))
    }
}

/// Rank a search vector against a set of distinct query terms.
///
/// The integer part counts matched terms and the fractional part grows with their summed
/// weight but stays below one, so a vector matching more terms always scores higher.
/// Zero means no match.
pub fn score(terms: &[String], vector: &SearchVector) -> f64 {
    let (matched, weight) = terms
        .iter()
        .filter_map(|term| vector.get(term))
        .fold((0u32, 0u64), |(n, w), weight| (n + 1, w + u64::from(*weight)));

    if matched == 0 {
        return 0.0;
    }
    let weight = weight as f64;
    f64::from(matched) + weight / (1.0 + weight)
}

/// Highest score first, then newest, then id for a stable order.
fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.file.created_at.cmp(&a.file.created_at))
        .then_with(|| a.file.id.cmp(&b.file.id))
}

/// Read-only query side of the metadata index. Observes committed rows only.
#[derive(Clone)]
pub struct SearchEngine {
    db: Database,
    node: Arc<NodeState>,
}

impl SearchEngine {
    pub fn new(db: Database, node: Arc<NodeState>) -> Self {
        Self { db, node }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage, DatabaseError> {
        let terms = query_terms(&query.text);
        // Text made only of short tokens or punctuation matches nothing
        if terms.is_empty() && !query.text.trim().is_empty() {
            return Ok(self.paginate(std::iter::empty(), query.offset, query.limit));
        }

        let candidates = if !terms.is_empty() {
            self.db.get_files_with_any_term(&terms)?
        } else if let Some(ref uploader) = query.filters.uploader {
            self.db.get_files_by_uploader(uploader)?
        } else {
            self.db.get_all_files()?
        };

        let hits = candidates
            .into_iter()
            .filter(|file| query.filters.matches(file))
            .map(|file| SearchHit {
                score: score(&terms, &file.search_vector),
                file,
            })
            .filter(|hit| terms.is_empty() || hit.score > 0.0);

        Ok(self.paginate(hits, query.offset, query.limit))
    }

    /// Files ranked against `file_id`'s own search vector. `None` if the file is unknown.
    pub fn similar(
        &self,
        file_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Option<SearchPage>, DatabaseError> {
        let Some(target) = self.db.get_file(file_id)? else {
            return Ok(None);
        };

        let terms: Vec<String> = target.search_vector.keys().cloned().collect();
        if terms.is_empty() {
            return Ok(Some(self.paginate(std::iter::empty(), offset, limit)));
        }

        let hits = self
            .db
            .get_files_with_any_term(&terms)?
            .into_iter()
            .filter(|file| file.id != target.id)
            .map(|file| SearchHit {
                score: score(&terms, &file.search_vector),
                file,
            });

        Ok(Some(self.paginate(hits, offset, limit)))
    }

    fn paginate(
        &self,
        hits: impl Iterator<Item = SearchHit>,
        offset: usize,
        limit: Option<usize>,
    ) -> SearchPage {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let mut hits: Vec<SearchHit> = hits
            .filter(|hit| !self.node.is_quarantined(&hit.file.id))
            .collect();
        hits.sort_by(rank);

        let total = hits.len();
        let hits = hits.into_iter().skip(offset).take(limit).collect();
        SearchPage {
            hits,
            total,
            offset,
            limit,
        }
    }
}
