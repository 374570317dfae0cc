//! Incremental ingestion: decide which discovered files need attention by
//! comparing their (mtime, size) with the stored fingerprints.
//!
//! Hashing is left to the caller and only done for files this module reports
//! as new or modified.

use std::collections::{HashMap, HashSet};

use crate::ingest::FileMetadata;
use crate::state::FileRecord;

/// How a discovered file relates to the stored records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// No record exists for the file name.
    New,
    /// A record exists but the file's (mtime, size) differ from it.
    Modified,
    Unchanged,
}

/// Result of classifying discovered files against the stored records.
#[derive(Debug, Default)]
pub struct FileClassification {
    pub new_files: Vec<FileMetadata>,
    pub modified_files: Vec<FileMetadata>,
    pub unchanged_files: Vec<FileMetadata>,
}

/// Classify one discovered file.
pub fn classify_file(file: &FileMetadata, records: &HashMap<String, FileRecord>) -> FileClass {
    match records.get(&file.filename) {
        None => FileClass::New,
        Some(record) if record.fingerprint().differs_from(file.mod_date, file.file_size) => {
            FileClass::Modified
        }
        Some(_) => FileClass::Unchanged,
    }
}

/// Classify discovered files into new, modified, or unchanged relative to the records.
pub fn classify_files(
    files: &[FileMetadata],
    records: &HashMap<String, FileRecord>,
) -> FileClassification {
    let mut classification = FileClassification::default();

    for file in files {
        match classify_file(file, records) {
            FileClass::New => classification.new_files.push(file.clone()),
            FileClass::Modified => classification.modified_files.push(file.clone()),
            FileClass::Unchanged => classification.unchanged_files.push(file.clone()),
        }
    }

    classification
}

/// File names that have a record but are no longer present on disk.
pub fn find_deleted_files(
    records: &HashMap<String, FileRecord>,
    existing_files: &HashSet<String>,
) -> Vec<String> {
    let mut deleted: Vec<String> = records
        .keys()
        .filter(|name| !existing_files.contains(*name))
        .cloned()
        .collect();
    deleted.sort();
    deleted
}
