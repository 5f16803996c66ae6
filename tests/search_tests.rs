mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use file_node::mode::NodeMode;
use file_node::node::NodeState;
use file_node::search::{SearchEngine, SearchFilters, SearchPage, SearchQuery};
use file_node::storage::models::FileRecord;
use file_node::storage::Database;

use common::{sample_record, tags};

struct Fixture {
    _dir: tempfile::TempDir,
    db: Database,
    node: Arc<NodeState>,
    engine: SearchEngine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let node = Arc::new(NodeState::new("node-a", NodeMode::Edit, 1 << 30, 1));
    let engine = SearchEngine::new(db.clone(), Arc::clone(&node));
    Fixture {
        _dir: dir,
        db,
        node,
        engine,
    }
}

impl Fixture {
    /// Insert a file created `age_minutes` ago.
    fn add(&self, id: &str, filename: &str, uploader: &str, age_minutes: i64) -> FileRecord {
        let mut record = sample_record(id, filename, uploader);
        record.created_at = Utc::now() - Duration::minutes(age_minutes);
        self.db.put_file(&record).unwrap();
        record
    }

    fn put(&self, record: &mut FileRecord) {
        record.refresh_search_vector();
        self.db.put_file(record).unwrap();
    }

    fn search(&self, text: &str, filters: SearchFilters) -> SearchPage {
        self.engine
            .search(&SearchQuery {
                text: text.to_string(),
                filters,
                ..Default::default()
            })
            .unwrap()
    }
}

fn ids(page: &SearchPage) -> Vec<&str> {
    page.hits.iter().map(|hit| hit.file.id.as_str()).collect()
}

#[test]
fn test_more_matching_terms_rank_higher() {
    let f = fixture();
    f.add("one", "tax.pdf", "alice", 1);
    f.add("both", "tax-report.pdf", "alice", 10);
    f.add("none", "holiday.jpg", "alice", 0);

    let page = f.search("tax report", SearchFilters::default());

    assert_eq!(ids(&page), vec!["both", "one"]);
    assert_eq!(page.total, 2);
    assert!(page.hits[0].score > page.hits[1].score);
}

#[test]
fn test_ties_prefer_newer_files() {
    let f = fixture();
    f.add("old", "invoice.pdf", "alice", 60);
    f.add("new", "invoice.pdf", "bob", 5);

    let page = f.search("invoice", SearchFilters::default());
    assert_eq!(ids(&page), vec!["new", "old"]);
    assert_eq!(page.hits[0].score, page.hits[1].score);
}

#[test]
fn test_tag_and_description_terms_are_searchable() {
    let f = fixture();
    let mut tagged = sample_record("tagged", "scan.pdf", "alice");
    tagged.tags = tags(&[("type", "invoice")]);
    f.put(&mut tagged);
    let mut described = sample_record("described", "scan2.pdf", "alice");
    described.description = Some("paid invoice for march".into());
    f.put(&mut described);

    let page = f.search("Invoice", SearchFilters::default());
    // Tag terms weigh more than description terms
    assert_eq!(ids(&page), vec!["tagged", "described"]);
}

#[test]
fn test_filters_narrow_results() {
    let f = fixture();
    let mut small = sample_record("small", "report.pdf", "alice");
    small.size_bytes = 100;
    small.tags = tags(&[("year", "2024")]);
    f.put(&mut small);
    let mut large = sample_record("large", "report.pdf", "alice");
    large.size_bytes = 10_000;
    large.tags = tags(&[("year", "2025")]);
    f.put(&mut large);
    let mut image = sample_record("image", "report.png", "bob");
    image.mime_type = "image/png".into();
    f.put(&mut image);

    let by_size = f.search(
        "report",
        SearchFilters {
            min_size: Some(5_000),
            max_size: Some(20_000),
            ..Default::default()
        },
    );
    assert_eq!(ids(&by_size), vec!["large"]);

    let by_tag = f.search(
        "report",
        SearchFilters {
            tags: tags(&[("year", "2024")]),
            ..Default::default()
        },
    );
    assert_eq!(ids(&by_tag), vec!["small"]);

    let by_mime = f.search(
        "report",
        SearchFilters {
            mime_type: Some("IMAGE/PNG".into()),
            ..Default::default()
        },
    );
    assert_eq!(ids(&by_mime), vec!["image"]);

    let by_uploader = f.search(
        "report",
        SearchFilters {
            uploader: Some("bob".into()),
            ..Default::default()
        },
    );
    assert_eq!(ids(&by_uploader), vec!["image"]);
}

#[test]
fn test_created_window() {
    let f = fixture();
    f.add("recent", "a.txt", "alice", 5);
    f.add("older", "b.txt", "alice", 120);

    let page = f.search(
        "",
        SearchFilters {
            created_after: Some(Utc::now() - Duration::minutes(60)),
            ..Default::default()
        },
    );
    assert_eq!(ids(&page), vec!["recent"]);

    let page = f.search(
        "",
        SearchFilters {
            created_before: Some(Utc::now() - Duration::minutes(60)),
            ..Default::default()
        },
    );
    assert_eq!(ids(&page), vec!["older"]);
}

#[test]
fn test_empty_query_lists_newest_first() {
    let f = fixture();
    f.add("a", "a.txt", "alice", 30);
    f.add("b", "b.txt", "bob", 20);
    f.add("c", "c.txt", "alice", 10);

    let all = f.search("", SearchFilters::default());
    assert_eq!(ids(&all), vec!["c", "b", "a"]);
    assert!(all.hits.iter().all(|hit| hit.score == 0.0));

    let alice = f.search(
        "  ",
        SearchFilters {
            uploader: Some("alice".into()),
            ..Default::default()
        },
    );
    assert_eq!(ids(&alice), vec!["c", "a"]);
}

#[test]
fn test_text_without_searchable_terms_matches_nothing() {
    let f = fixture();
    f.add("a", "x-ray.png", "alice", 2);
    f.add("b", "notes.txt", "bob", 1);

    for text in ["x", "!!!", "?", " a "] {
        let page = f.search(text, SearchFilters::default());
        assert_eq!(page.total, 0, "query {text:?}");
        assert!(page.hits.is_empty());
    }
}

#[test]
fn test_pagination() {
    let f = fixture();
    for i in 0..130 {
        f.add(&format!("file-{i:03}"), "shared.txt", "alice", i);
    }

    let first = f.search("shared", SearchFilters::default());
    assert_eq!(first.total, 130);
    assert_eq!(first.limit, 20);
    assert_eq!(first.hits.len(), 20);
    assert_eq!(first.hits[0].file.id, "file-000");

    let page = f
        .engine
        .search(&SearchQuery {
            text: "shared".into(),
            offset: 120,
            limit: Some(1000),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.limit, 100);
    assert_eq!(page.offset, 120);
    assert_eq!(page.hits.len(), 10);
    assert_eq!(page.hits[0].file.id, "file-120");

    let past_end = f
        .engine
        .search(&SearchQuery {
            text: "shared".into(),
            offset: 500,
            ..Default::default()
        })
        .unwrap();
    assert!(past_end.hits.is_empty());
    assert_eq!(past_end.total, 130);
}

#[test]
fn test_quarantined_files_are_hidden() {
    let f = fixture();
    f.add("ok", "contract.pdf", "alice", 1);
    f.add("bad", "contract.pdf", "alice", 2);
    f.node.quarantine("bad", "checksum mismatch");

    let page = f.search("contract", SearchFilters::default());
    assert_eq!(ids(&page), vec!["ok"]);
    assert_eq!(page.total, 1);
}

#[test]
fn test_similar_files() {
    let f = fixture();
    f.add("target", "tax-report-2024.pdf", "alice", 1);
    f.add("close", "tax-report-2023.pdf", "alice", 2);
    f.add("partial", "tax.pdf", "bob", 3);
    f.add("unrelated", "holiday.jpg", "bob", 4);

    let page = f.engine.similar("target", 0, None).unwrap().unwrap();
    let found = ids(&page);
    assert_eq!(found[0], "close");
    assert!(found.contains(&"partial"));
    assert!(!found.contains(&"target"));
    assert!(!found.contains(&"unrelated"));

    assert!(f.engine.similar("missing", 0, None).unwrap().is_none());
}
