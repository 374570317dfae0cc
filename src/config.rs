use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub driver: DriverConfig,
    /// Sources keyed by their stable data key (e.g. "telemetered", "recovered").
    pub sources: BTreeMap<String, SourceConfig>,
}

/// Driver-wide configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound on particles emitted per second by one source.
    #[serde(default)]
    pub records_per_second: Option<f64>,
    /// Upper bound on particles emitted by one source per poll cycle.
    #[serde(default)]
    pub max_records_per_cycle: Option<usize>,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            resource_id: default_resource_id(),
            state_db: default_state_db(),
            log_level: default_log_level(),
            records_per_second: None,
            max_records_per_cycle: None,
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

fn default_resource_id() -> String {
    "tidewater".to_string()
}

fn default_state_db() -> PathBuf {
    PathBuf::from("tidewater.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_queue_capacity() -> usize {
    1024
}

/// One watched directory and the format of the files it receives
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub directory: PathBuf,
    /// Filename glob (`*`, `?` and `[...]` classes), matched against the file name only.
    pub pattern: String,
    /// Poll interval in seconds.
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    pub parser: ParserConfig,
}

fn default_frequency() -> f64 {
    1.0
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.frequency)
    }
}

/// Record format of a source, selecting the parser implementation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ParserConfig {
    Cspp(CsppOptions),
    JsonLines(JsonLinesOptions),
    Binary(BinaryOptions),
}

impl ParserConfig {
    /// Format name recorded in every parser checkpoint.
    pub fn format_name(&self) -> &'static str {
        match self {
            ParserConfig::Cspp(_) => "cspp",
            ParserConfig::JsonLines(_) => "json_lines",
            ParserConfig::Binary(_) => "binary",
        }
    }
}

/// Text files with a `key: value` header, a column-name line and delimited data rows
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsppOptions {
    /// Column delimiter; `None` splits on any run of whitespace.
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_metadata_stream")]
    pub metadata_stream: String,
    #[serde(default = "default_instrument_stream")]
    pub instrument_stream: String,
}

impl Default for CsppOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            metadata_stream: default_metadata_stream(),
            instrument_stream: default_instrument_stream(),
        }
    }
}

fn default_metadata_stream() -> String {
    "metadata".to_string()
}

fn default_instrument_stream() -> String {
    "instrument".to_string()
}

/// One JSON object per line
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonLinesOptions {
    #[serde(default = "default_instrument_stream")]
    pub stream: String,
}

impl Default for JsonLinesOptions {
    fn default() -> Self {
        Self {
            stream: default_instrument_stream(),
        }
    }
}

/// Fixed-size binary records, optionally prefixed by a sync marker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BinaryOptions {
    pub record_size: usize,
    /// Hex encoded marker every record starts with (e.g. "a5a5").
    #[serde(default)]
    pub sync: Option<String>,
    #[serde(default = "default_instrument_stream")]
    pub stream: String,
}

impl BinaryOptions {
    /// Decoded sync marker bytes.
    pub fn sync_bytes(&self) -> std::result::Result<Option<Vec<u8>>, String> {
        let Some(hex) = &self.sync else {
            return Ok(None);
        };
        if hex.is_empty() || !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(format!("sync marker must be an even number of hex digits: {:?}", hex));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| format!("invalid hex in sync marker: {:?}", hex))
            })
            .collect::<std::result::Result<Vec<u8>, String>>()
            .map(Some)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in TIDEWATER_CONFIG environment variable
    /// 2. ./tidewater.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("TIDEWATER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tidewater.toml"));

        Self::from_file(&config_path)
    }

    /// Load and validate configuration from an explicit path
    pub fn from_file(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            anyhow::bail!("at least one [sources.<key>] table is required");
        }

        if let Some(rps) = self.driver.records_per_second {
            if rps.is_nan() || rps <= 0.0 {
                anyhow::bail!("driver.records_per_second must be greater than 0");
            }
        }

        if self.driver.max_records_per_cycle == Some(0) {
            anyhow::bail!("driver.max_records_per_cycle must be greater than 0");
        }

        if self.driver.event_queue_capacity == 0 {
            anyhow::bail!("driver.event_queue_capacity must be greater than 0");
        }

        for (key, source) in &self.sources {
            if key.trim().is_empty() {
                anyhow::bail!("source keys must not be empty");
            }

            if !source.frequency.is_finite() || source.frequency <= 0.0 {
                anyhow::bail!("sources.{}.frequency must be a positive number of seconds", key);
            }

            if source.pattern.trim().is_empty() {
                anyhow::bail!("sources.{}.pattern must not be empty", key);
            }

            crate::watch::FilePattern::new(&source.pattern)
                .with_context(|| format!("sources.{}.pattern is not a valid glob", key))?;

            if let ParserConfig::Binary(opts) = &source.parser {
                if opts.record_size == 0 {
                    anyhow::bail!("sources.{}.parser.record_size must be greater than 0", key);
                }
                let sync = opts
                    .sync_bytes()
                    .map_err(|e| anyhow::anyhow!("sources.{}.parser: {}", key, e))?;
                if let Some(sync) = sync {
                    if sync.len() > opts.record_size {
                        anyhow::bail!(
                            "sources.{}.parser.sync is longer than record_size",
                            key
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Get state database path
    pub fn state_db(&self) -> &Path {
        &self.driver.state_db
    }
}
