use thiserror::Error;

/// Main error type for Tidewater
#[derive(Error, Debug)]
pub enum TidewaterError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A watched directory or file could not be read
    #[error("Watch error on {path}: {source}")]
    WatchIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Saved parser checkpoint is unreadable or does not fit the file
    #[error("Parser state corrupt: {0}")]
    ParserStateCorrupt(String),

    /// JSON (de)serialization of persisted state
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A spawned or blocking task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for TidewaterError {
    fn from(e: tokio::task::JoinError) -> Self {
        TidewaterError::Task(e.to_string())
    }
}

/// Convenient Result type using TidewaterError
pub type Result<T> = std::result::Result<T, TidewaterError>;
