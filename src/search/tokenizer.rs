use std::collections::{BTreeMap, HashSet};

use crate::storage::models::SearchVector;

pub const FILENAME_WEIGHT: u32 = 3;
pub const TAG_WEIGHT: u32 = 2;
pub const DESCRIPTION_WEIGHT: u32 = 1;

/// Terms shorter than this carry no signal.
const MIN_TERM_CHARS: usize = 2;

/// Lowercase `text` and split it into alphanumeric terms.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_TERM_CHARS)
        .map(|word| word.to_lowercase())
}

/// Distinct query terms in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .filter(|term| seen.insert(term.clone()))
        .collect()
}

/// Weighted term frequencies for a file's text fields.
pub fn build_search_vector(
    filename: &str,
    tags: &BTreeMap<String, String>,
    description: Option<&str>,
) -> SearchVector {
    let mut vector = SearchVector::new();
    let mut add = |text: &str, weight: u32| {
        for term in tokenize(text) {
            *vector.entry(term).or_insert(0) += weight;
        }
    };

    add(filename, FILENAME_WEIGHT);
    for (key, value) in tags {
        add(key, TAG_WEIGHT);
        add(value, TAG_WEIGHT);
    }
    if let Some(description) = description {
        add(description, DESCRIPTION_WEIGHT);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_and_lowercases() {
        let terms: Vec<String> = tokenize("Invoice_2024-Q3.PDF a").collect();
        assert_eq!(terms, vec!["invoice", "2024", "q3", "pdf"]);
    }

    #[test]
    fn test_query_terms_dedup() {
        assert_eq!(query_terms("tax Tax report"), vec!["tax", "report"]);
        assert!(query_terms("  ").is_empty());
    }

    #[test]
    fn test_search_vector_weights() {
        let tags = BTreeMap::from([("type".to_string(), "invoice".to_string())]);
        let vector = build_search_vector("invoice.pdf", &tags, Some("march invoice"));

        assert_eq!(
            vector["invoice"],
            FILENAME_WEIGHT + TAG_WEIGHT + DESCRIPTION_WEIGHT
        );
        assert_eq!(vector["type"], TAG_WEIGHT);
        assert_eq!(vector["march"], DESCRIPTION_WEIGHT);
        assert_eq!(vector["pdf"], FILENAME_WEIGHT);
    }
}
