use std::collections::BTreeSet;

use redb::{ReadableTable, ReadableTableMetadata, Table};

use super::db::{Database, DatabaseError};
use super::models::FileRecord;
use super::tables::*;

type IndexTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Insert or replace a file record, keeping the uploader and term indexes in step
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            let previous: Option<FileRecord> = match table.get(file.id.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.id.as_str(), data.as_slice())?;

            let mut uploader_table = write_txn.open_table(UPLOADER_FILES)?;
            let mut terms_table = write_txn.open_table(SEARCH_TERMS)?;

            if let Some(ref old) = previous {
                if old.uploader != file.uploader {
                    index_remove(&mut uploader_table, &old.uploader, &old.id)?;
                }
                for term in old.search_vector.keys() {
                    if !file.search_vector.contains_key(term) {
                        index_remove(&mut terms_table, term, &old.id)?;
                    }
                }
            }

            index_insert(&mut uploader_table, &file.uploader, &file.id)?;
            for term in file.search_vector.keys() {
                index_insert(&mut terms_table, term, &file.id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its UUID
    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(id)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Delete a file row and its index entries. Returns the removed record, if any.
    pub fn delete_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let removed = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            if let Some(ref file) = existing {
                table.remove(id)?;

                let mut uploader_table = write_txn.open_table(UPLOADER_FILES)?;
                index_remove(&mut uploader_table, &file.uploader, id)?;

                let mut terms_table = write_txn.open_table(SEARCH_TERMS)?;
                for term in file.search_vector.keys() {
                    index_remove(&mut terms_table, term, id)?;
                }
            }
            existing
        };

        write_txn.commit()?;
        Ok(removed)
    }

    /// Get all committed files
    pub fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            files.push(file);
        }

        Ok(files)
    }

    /// Get all files owned by an uploader
    pub fn get_files_by_uploader(&self, uploader: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let uploader_table = read_txn.open_table(UPLOADER_FILES)?;
        let files_table = read_txn.open_table(FILES)?;

        let file_ids: Vec<String> = match uploader_table.get(uploader)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut files = Vec::new();
        for file_id in file_ids {
            if let Some(data) = files_table.get(file_id.as_str())? {
                files.push(rmp_serde::from_slice(data.value())?);
            }
        }

        Ok(files)
    }

    /// Files whose search vector contains at least one of `terms`.
    /// Reads postings and rows from a single snapshot.
    pub fn get_files_with_any_term(
        &self,
        terms: &[String],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let terms_table = read_txn.open_table(SEARCH_TERMS)?;
        let files_table = read_txn.open_table(FILES)?;

        let mut ids = BTreeSet::new();
        for term in terms {
            if let Some(data) = terms_table.get(term.as_str())? {
                let postings: Vec<String> = rmp_serde::from_slice(data.value())?;
                ids.extend(postings);
            }
        }

        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(data) = files_table.get(id.as_str())? {
                files.push(rmp_serde::from_slice(data.value())?);
            }
        }

        Ok(files)
    }

    /// Total stored bytes and number of committed files.
    pub fn usage(&self) -> Result<(u64, u64), DatabaseError> {
        let files = self.get_all_files()?;
        let used = files.iter().map(|f| f.size_bytes).sum();
        Ok((used, files.len() as u64))
    }

    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;
        Ok(table.is_empty()?)
    }
}

fn index_insert(table: &mut IndexTable<'_>, key: &str, id: &str) -> Result<(), DatabaseError> {
    let mut ids: Vec<String> = match table.get(key)? {
        Some(data) => rmp_serde::from_slice(data.value())?,
        None => Vec::new(),
    };

    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
        let data = rmp_serde::to_vec_named(&ids)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}

fn index_remove(table: &mut IndexTable<'_>, key: &str, id: &str) -> Result<(), DatabaseError> {
    let ids: Option<Vec<String>> = match table.get(key)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };

    if let Some(mut ids) = ids {
        ids.retain(|existing| existing != id);
        if ids.is_empty() {
            table.remove(key)?;
        } else {
            let data = rmp_serde::to_vec_named(&ids)?;
            table.insert(key, data.as_slice())?;
        }
    }
    Ok(())
}
