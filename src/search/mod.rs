//! Ranked metadata search over the `search_vector` of committed files.

mod engine;
pub mod tokenizer;

pub use engine::{score, SearchEngine, SearchFilters, SearchHit, SearchPage, SearchQuery};
