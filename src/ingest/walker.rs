use walkdir::WalkDir;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use crate::error::{Result, TidewaterError};
use crate::ingest::metadata::mod_date_seconds;
use crate::watch::FilePattern;

/// Metadata for a discovered file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File name relative to the watched directory (no directory components).
    pub filename: String,
    pub absolute_path: PathBuf,
    pub file_size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub mod_date: f64,
}

/// Discover files directly inside `directory` whose name matches `pattern`.
///
/// Subdirectories are not descended into. Files come back in discovery order:
/// oldest modification time first, ties broken by name.
///
/// An unreadable directory or matching entry is an error. Failures on entries
/// that do not match the pattern are ignored, and a matching entry that is gone
/// by the time its metadata is read (dangling link, file renamed away) is skipped.
pub fn discover_files(directory: &Path, pattern: &FilePattern) -> Result<Vec<FileMetadata>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() > 0 && !entry_matters(e.path(), pattern) {
                    continue;
                }
                if e.depth() > 0 && is_not_found(&e) {
                    log::debug!("Skipping vanished entry {:?}", e.path());
                    continue;
                }
                let path = e.path().unwrap_or(directory).to_path_buf();
                return Err(watch_error(&path, e.into_io_error()));
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().to_string();
        if !pattern.matches(&filename) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if is_not_found(&e) => {
                log::debug!("{} disappeared while listing", entry.path().display());
                continue;
            }
            Err(e) => return Err(watch_error(entry.path(), e.into_io_error())),
        };
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(watch_error(entry.path(), Some(e))),
        };

        files.push(FileMetadata {
            filename,
            absolute_path: entry.path().to_path_buf(),
            file_size: metadata.len(),
            mod_date: mod_date_seconds(modified),
        });
    }

    files.sort_by(|a, b| {
        a.mod_date
            .total_cmp(&b.mod_date)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    log::debug!("Discovered {} matching files in {}", files.len(), directory.display());
    Ok(files)
}

/// Whether a failed entry is one the source would have picked up.
fn entry_matters(path: Option<&Path>, pattern: &FilePattern) -> bool {
    path.and_then(Path::file_name)
        .map(|name| pattern.matches(&name.to_string_lossy()))
        .unwrap_or(true)
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error().map(|io| io.kind() == ErrorKind::NotFound).unwrap_or(false)
}

fn watch_error(path: &Path, source: Option<std::io::Error>) -> TidewaterError {
    TidewaterError::WatchIo {
        path: path.display().to_string(),
        source: source.unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "directory walk failed")),
    }
}
