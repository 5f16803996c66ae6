use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::search::tokenizer;

/// Three-state patch value for partial updates that survives serialization round-trips.
/// Unlike `Option<Option<T>>`, each variant has a distinct wire representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Patch<T> {
    /// Field was not included in the request (no change).
    #[default]
    Absent,
    /// Field was explicitly set to null (clear it).
    Null,
    /// Field was set to a new value.
    Value(T),
}

impl<T> From<Option<Option<T>>> for Patch<T> {
    fn from(v: Option<Option<T>>) -> Self {
        match v {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(v)) => Patch::Value(v),
        }
    }
}

impl<T: Clone> Patch<T> {
    /// Apply the patch to an optional field.
    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            Patch::Absent => {}
            Patch::Null => *field = None,
            Patch::Value(v) => *field = Some(v.clone()),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }
}

/// Term -> weighted frequency. Derived from filename, tags and description.
pub type SearchVector = BTreeMap<String, u32>;

/// A committed file, one row per object in the metadata index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub storage_path: String,
    /// SHA-256 of the content, lowercase hex
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub original_filename: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub uploader: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` means the file never expires
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub search_vector: SearchVector,
}

impl FileRecord {
    /// Recompute `search_vector` from the current text fields.
    pub fn refresh_search_vector(&mut self) {
        self.search_vector = tokenizer::build_search_vector(
            &self.original_filename,
            &self.tags,
            self.description.as_deref(),
        );
    }

    /// Moment the retention policy allows the file to be expired, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.retention_days
            .map(|days| self.created_at + Duration::days(i64::from(days)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Strong entity tag derived from the content checksum.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.checksum)
    }
}

/// Caller-supplied metadata for a new upload. Travels as the upload's query string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewFile {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    /// From the request's `Content-Type`; guessed from the filename when absent
    #[serde(skip)]
    pub mime_type: Option<String>,
}

impl NewFile {
    /// Metadata that recreates `record` on another node.
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            filename: record.original_filename.clone(),
            description: record.description.clone(),
            tags: record.tags.clone(),
            retention_days: record.retention_days,
            mime_type: Some(record.mime_type.clone()),
        }
    }
}

/// Changes accepted by a metadata update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileUpdate {
    #[serde(default)]
    pub description: Patch<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub retention_days: Patch<u32>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

impl FileUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_absent()
            && self.original_filename.is_none()
            && self.retention_days.is_absent()
            && self.tags.is_none()
    }

    /// Apply the update to a copy of `record`, refreshing derived fields.
    pub fn applied_to(&self, record: &FileRecord, now: DateTime<Utc>) -> FileRecord {
        let mut updated = record.clone();
        self.description.apply_to(&mut updated.description);
        self.retention_days.apply_to(&mut updated.retention_days);
        if let Some(ref name) = self.original_filename {
            updated.original_filename = name.clone();
        }
        if let Some(ref tags) = self.tags {
            updated.tags = tags.clone();
        }
        updated.updated_at = now;
        updated.refresh_search_vector();
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        let created = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut record = FileRecord {
            id: "id".into(),
            storage_path: "id/id".into(),
            checksum: "ab".repeat(32),
            size_bytes: 3,
            mime_type: "text/plain".into(),
            original_filename: "notes.txt".into(),
            description: None,
            tags: BTreeMap::new(),
            uploader: "alice".into(),
            created_at: created,
            updated_at: created,
            retention_days: Some(30),
            search_vector: SearchVector::new(),
        };
        record.refresh_search_vector();
        record
    }

    #[test]
    fn test_expiry() {
        let record = record();
        let expires = record.expires_at().unwrap();
        assert!(!record.is_expired(expires - Duration::seconds(1)));
        assert!(record.is_expired(expires));

        let mut forever = record.clone();
        forever.retention_days = None;
        assert!(!forever.is_expired(Utc::now() + Duration::days(100_000)));
    }

    #[test]
    fn test_update_refreshes_search_vector() {
        let record = record();
        assert!(!record.search_vector.contains_key("invoice"));

        let update = FileUpdate {
            tags: Some(BTreeMap::from([("type".to_string(), "invoice".to_string())])),
            description: Patch::Value("quarterly numbers".into()),
            retention_days: Patch::Null,
            ..Default::default()
        };
        let updated = update.applied_to(&record, Utc::now());

        assert!(updated.search_vector.contains_key("invoice"));
        assert!(updated.search_vector.contains_key("quarterly"));
        assert_eq!(updated.retention_days, None);
        assert_eq!(updated.original_filename, "notes.txt");
    }

    #[test]
    fn test_patch_from_nullable() {
        assert_eq!(Patch::<u32>::from(None), Patch::Absent);
        assert_eq!(Patch::<u32>::from(Some(None)), Patch::Null);
        assert_eq!(Patch::from(Some(Some(3u32))), Patch::Value(3));
    }
}
