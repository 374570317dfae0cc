//! Ingestion state: per-file fingerprints and parser checkpoints, persisted per source.
//!
//! The [`StateStore`] is the single persisted source of truth for [`FileRecord`]s.
//! Every `save` is one upsert statement, so a concurrent `load` sees either the
//! previous or the new row, never a mix.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{migrate, Db};
use crate::error::{Result, TidewaterError};

/// Current layout version of [`ParserState`] blobs.
pub const PARSER_STATE_VERSION: u32 = 1;

/// Persisted state of a whole driver: source key -> filename -> record.
pub type DriverMemento = BTreeMap<String, BTreeMap<String, FileRecord>>;

/// Identity of one version of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Modification time in seconds since the Unix epoch.
    pub file_mod_date: f64,
    /// Hex SHA-256 of the full file content.
    pub file_checksum: String,
    pub file_size: u64,
}

impl Fingerprint {
    /// Whether the cheap (mtime, size) part differs from what the watcher sees now.
    pub fn differs_from(&self, file_mod_date: f64, file_size: u64) -> bool {
        self.file_mod_date != file_mod_date || self.file_size != file_size
    }

    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.file_size == other.file_size && self.file_checksum == other.file_checksum
    }
}

/// Opaque parser resume token. The coordinator only stores and returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserState {
    pub version: u32,
    /// Name of the record format that produced the state.
    pub format: String,
    pub body: serde_json::Value,
}

impl ParserState {
    pub fn new(format: &str, body: serde_json::Value) -> Self {
        Self {
            version: PARSER_STATE_VERSION,
            format: format.to_string(),
            body,
        }
    }
}

/// Ingestion state of one observed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub ingested: bool,
    pub file_mod_date: f64,
    pub file_checksum: String,
    pub file_size: u64,
    pub parser_state: Option<ParserState>,
}

impl FileRecord {
    /// A record for a file seen for the first time (or whose checkpoint was discarded).
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            ingested: false,
            file_mod_date: fingerprint.file_mod_date,
            file_checksum: fingerprint.file_checksum,
            file_size: fingerprint.file_size,
            parser_state: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            file_mod_date: self.file_mod_date,
            file_checksum: self.file_checksum.clone(),
            file_size: self.file_size,
        }
    }

    /// Replace the fingerprint, keeping ingestion progress.
    pub fn set_fingerprint(&mut self, fingerprint: Fingerprint) {
        self.file_mod_date = fingerprint.file_mod_date;
        self.file_checksum = fingerprint.file_checksum;
        self.file_size = fingerprint.file_size;
    }
}

/// SQLite-backed store of [`FileRecord`]s keyed by (source, filename).
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Db,
}

impl StateStore {
    /// Open (and migrate) the state database at `path`.
    pub async fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let db = Db::new(path);
        db.with_connection(migrate::run_migrations).await?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// All records of one source.
    pub async fn load(&self, source_key: &str) -> Result<HashMap<String, FileRecord>> {
        let source_key = source_key.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT filename, ingested, file_mod_date, file_checksum, file_size, parser_state \
                     FROM file_records WHERE source_key = ?1",
                )?;
                let rows = stmt.query_map([&source_key], read_row)?;
                let mut records = HashMap::new();
                for row in rows {
                    let (filename, record) = row?;
                    records.insert(filename, decode_record(record)?);
                }
                Ok(records)
            })
            .await
    }

    /// One record, if present.
    pub async fn get(&self, source_key: &str, filename: &str) -> Result<Option<FileRecord>> {
        let source_key = source_key.to_string();
        let filename = filename.to_string();
        self.db
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT filename, ingested, file_mod_date, file_checksum, file_size, parser_state \
                         FROM file_records WHERE source_key = ?1 AND filename = ?2",
                        params![source_key, filename],
                        read_row,
                    )
                    .optional()?;
                row.map(|(_, record)| decode_record(record)).transpose()
            })
            .await
    }

    /// Insert or replace one record.
    pub async fn save(&self, source_key: &str, filename: &str, record: &FileRecord) -> Result<()> {
        let source_key = source_key.to_string();
        let filename = filename.to_string();
        let record = record.clone();
        self.db
            .with_connection(move |conn| {
                upsert(conn, &source_key, &filename, &record)?;
                Ok(())
            })
            .await
    }

    pub async fn remove(&self, source_key: &str, filename: &str) -> Result<bool> {
        let source_key = source_key.to_string();
        let filename = filename.to_string();
        self.db
            .with_connection(move |conn| {
                let n = conn.execute(
                    "DELETE FROM file_records WHERE source_key = ?1 AND filename = ?2",
                    params![source_key, filename],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Every record of every source.
    pub async fn load_all(&self) -> Result<DriverMemento> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_key, filename, ingested, file_mod_date, file_checksum, file_size, parser_state \
                     FROM file_records ORDER BY source_key, filename",
                )?;
                let rows = stmt.query_map([], |row| {
                    let source_key: String = row.get(0)?;
                    let filename: String = row.get(1)?;
                    let raw = RawRecord {
                        ingested: row.get(2)?,
                        file_mod_date: row.get(3)?,
                        file_checksum: row.get(4)?,
                        file_size: row.get(5)?,
                        parser_state: row.get(6)?,
                    };
                    Ok((source_key, filename, raw))
                })?;
                let mut memento = DriverMemento::new();
                for row in rows {
                    let (source_key, filename, raw) = row?;
                    memento
                        .entry(source_key)
                        .or_default()
                        .insert(filename, decode_record(raw)?);
                }
                Ok(memento)
            })
            .await
    }

    /// Write every record of a memento in one transaction.
    pub async fn restore(&self, memento: &DriverMemento) -> Result<usize> {
        let memento = memento.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut count = 0;
                for (source_key, files) in &memento {
                    for (filename, record) in files {
                        upsert(&tx, source_key, filename, record)?;
                        count += 1;
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await
    }
}

/// Column values of one `file_records` row before decoding the parser state.
struct RawRecord {
    ingested: bool,
    file_mod_date: f64,
    file_checksum: String,
    file_size: i64,
    parser_state: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, RawRecord)> {
    Ok((
        row.get(0)?,
        RawRecord {
            ingested: row.get(1)?,
            file_mod_date: row.get(2)?,
            file_checksum: row.get(3)?,
            file_size: row.get(4)?,
            parser_state: row.get(5)?,
        },
    ))
}

fn decode_record(raw: RawRecord) -> Result<FileRecord> {
    // Undecodable blobs load as version 0, which every parser rejects as corrupt.
    let parser_state = raw.parser_state.map(|text| {
        serde_json::from_str::<ParserState>(&text).unwrap_or_else(|e| {
            log::warn!("Unreadable parser state kept for rejection: {}", e);
            ParserState {
                version: 0,
                format: String::new(),
                body: serde_json::Value::String(text),
            }
        })
    });
    let file_size = u64::try_from(raw.file_size)
        .map_err(|_| TidewaterError::InvalidInput(format!("negative file size {}", raw.file_size)))?;
    Ok(FileRecord {
        ingested: raw.ingested,
        file_mod_date: raw.file_mod_date,
        file_checksum: raw.file_checksum,
        file_size,
        parser_state,
    })
}

fn upsert(
    conn: &rusqlite::Connection,
    source_key: &str,
    filename: &str,
    record: &FileRecord,
) -> Result<()> {
    let parser_state = record
        .parser_state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let file_size = i64::try_from(record.file_size)
        .map_err(|_| TidewaterError::InvalidInput(format!("file size {} too large", record.file_size)))?;
    conn.execute(
        r#"
        INSERT INTO file_records (
            source_key, filename, ingested, file_mod_date,
            file_checksum, file_size, parser_state, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(source_key, filename) DO UPDATE SET
            ingested = excluded.ingested,
            file_mod_date = excluded.file_mod_date,
            file_checksum = excluded.file_checksum,
            file_size = excluded.file_size,
            parser_state = excluded.parser_state,
            updated_at = excluded.updated_at
        "#,
        params![
            source_key,
            filename,
            record.ingested,
            record.file_mod_date,
            record.file_checksum,
            file_size,
            parser_state,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}
