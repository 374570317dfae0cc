//! Directory watcher: polls one source directory and reports new and modified files.
//!
//! The watcher keeps the (size, mtime) it saw for every matching file on the
//! previous poll. A file is *stable* when two consecutive polls saw the same
//! values; the pipeline only marks a file complete once it is stable.

mod pattern;

pub use pattern::FilePattern;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, TidewaterError};
use crate::ingest::{classify_file, compute_file_hash, discover_files, FileClass, FileMetadata};
use crate::state::{FileRecord, Fingerprint};

/// What one poll found out about a file.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Matching file with no stored record.
    New { filename: String, fingerprint: Fingerprint },
    /// Stored file whose (mtime, size) no longer match its record.
    Modified { filename: String, fingerprint: Fingerprint },
}

/// Last observed on-disk state of a matching file.
#[derive(Debug, Clone)]
pub struct Observation {
    pub path: PathBuf,
    pub file_size: u64,
    pub mod_date: f64,
    /// Same size and mtime as on the poll before.
    pub stable: bool,
}

#[derive(Debug)]
pub struct FileWatcher {
    directory: PathBuf,
    pattern: FilePattern,
    observations: HashMap<String, Observation>,
}

/// A listed file, its class and, when new or modified, its fingerprint.
type Scanned = (FileMetadata, FileClass, Option<Fingerprint>);

impl FileWatcher {
    pub fn new(directory: impl Into<PathBuf>, pattern: FilePattern) -> Self {
        Self {
            directory: directory.into(),
            pattern,
            observations: HashMap::new(),
        }
    }

    /// List the directory once and compare it with `records`.
    ///
    /// Listing and hashing run on the blocking pool. Events come back in
    /// discovery order. Any I/O failure other than a file vanishing between
    /// listing and hashing is a [`TidewaterError::WatchIo`].
    pub async fn poll(&mut self, records: &HashMap<String, FileRecord>) -> Result<Vec<WatchEvent>> {
        let directory = self.directory.clone();
        let pattern = self.pattern.clone();
        let records = records.clone();
        let scanned =
            tokio::task::spawn_blocking(move || scan(&directory, &pattern, &records)).await??;

        let mut seen = HashMap::with_capacity(scanned.len());
        let mut events = Vec::new();

        for (file, class, fingerprint) in scanned {
            let stable = self
                .observations
                .get(&file.filename)
                .map(|prev| prev.file_size == file.file_size && prev.mod_date == file.mod_date)
                .unwrap_or(false);

            if let Some(fingerprint) = fingerprint {
                let filename = file.filename.clone();
                events.push(match class {
                    FileClass::New => WatchEvent::New { filename, fingerprint },
                    _ => WatchEvent::Modified { filename, fingerprint },
                });
            }

            seen.insert(
                file.filename,
                Observation {
                    path: file.absolute_path,
                    file_size: file.file_size,
                    mod_date: file.mod_date,
                    stable,
                },
            );
        }

        self.observations = seen;
        Ok(events)
    }

    pub fn observation(&self, filename: &str) -> Option<&Observation> {
        self.observations.get(filename)
    }

    /// Path of a file seen on the last poll.
    pub fn path_of(&self, filename: &str) -> Option<&Path> {
        self.observations.get(filename).map(|o| o.path.as_path())
    }
}

/// List and classify the directory, hashing new and modified files.
fn scan(
    directory: &Path,
    pattern: &FilePattern,
    records: &HashMap<String, FileRecord>,
) -> Result<Vec<Scanned>> {
    let files = discover_files(directory, pattern)?;
    let mut scanned = Vec::with_capacity(files.len());

    for file in files {
        let class = classify_file(&file, records);
        let fingerprint = match class {
            FileClass::Unchanged => None,
            FileClass::New | FileClass::Modified => match fingerprint_of(&file) {
                Ok(fp) => Some(fp),
                Err(TidewaterError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    log::debug!("{} disappeared while polling", file.absolute_path.display());
                    continue;
                }
                Err(TidewaterError::Io(e)) => {
                    return Err(TidewaterError::WatchIo {
                        path: file.absolute_path.display().to_string(),
                        source: e,
                    })
                }
                Err(e) => return Err(e),
            },
        };
        scanned.push((file, class, fingerprint));
    }
    Ok(scanned)
}

fn fingerprint_of(file: &FileMetadata) -> Result<Fingerprint> {
    Ok(Fingerprint {
        file_mod_date: file.mod_date,
        file_checksum: compute_file_hash(&file.absolute_path)?,
        file_size: file.file_size,
    })
}
