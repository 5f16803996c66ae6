use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Uploader index: uploader -> msgpack Vec of file UUIDs
pub const UPLOADER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("uploader_files");

/// Inverted search index: term -> msgpack Vec of file UUIDs
pub const SEARCH_TERMS: TableDefinition<&str, &[u8]> = TableDefinition::new("search_terms");
