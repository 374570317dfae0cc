use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tidewater::db::migrate;
use tidewater::{Callbacks, Config, Driver, DriverMemento, StateStore, TidewaterError};

#[derive(Parser, Debug)]
#[command(name = "tidewater")]
#[command(version, about = "Resumable multi-source file ingestion")]
struct Args {
    /// Config file (defaults to $TIDEWATER_CONFIG, then ./tidewater.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample all sources and print particles as JSON lines until Ctrl+C
    Run {
        /// Saved state (JSON or YAML memento) to restore before sampling
        #[arg(long)]
        memento: Option<PathBuf>,
    },
    /// Check the state database schema
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.driver.log_level.as_str()),
    )
    .init();

    match args.command.unwrap_or(Command::Verify) {
        Command::Run { memento } => run(config, memento.as_deref()).await,
        Command::Verify => verify(&config).await,
    }
}

async fn run(config: Config, memento: Option<&Path>) -> Result<()> {
    log::info!("Starting tidewater v{}", env!("CARGO_PKG_VERSION"));
    log::info!("State database: {}", config.state_db().display());

    let callbacks = Callbacks::new(
        |particle| match serde_json::to_string(&particle) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("cannot encode particle: {}", e),
        },
        |source_key, filename, record| {
            log::debug!(
                "[{}] {} ingested={} state={:?}",
                source_key,
                filename,
                record.ingested,
                record.parser_state
            );
        },
        |exception| log::warn!("{}", exception),
    );

    let mut driver = Driver::new(config, callbacks).await?;

    if let Some(path) = memento {
        let memento = read_memento(path)?;
        driver.restore(&memento).await?;
    }

    driver.start_sampling().await?;
    log::info!("Sampling (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    log::info!("Shutdown requested");

    driver.stop_sampling().await?;
    Ok(())
}

fn read_memento(path: &Path) -> Result<DriverMemento> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read memento: {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );
    let memento = if yaml {
        serde_yaml_ng::from_str(&text)?
    } else {
        serde_json::from_str(&text)?
    };
    Ok(memento)
}

/// Open (and migrate) the state database, then check it is usable.
async fn verify(config: &Config) -> Result<()> {
    log::info!("Verifying {}", config.state_db().display());
    let store = StateStore::open(config.state_db()).await?;

    store
        .db()
        .with_connection(|conn| {
            let table_exists: bool = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='file_records'")?
                .exists([])?;
            if !table_exists {
                return Err(TidewaterError::Config("table 'file_records' does not exist".to_string()));
            }
            log::debug!("✓ Table exists: file_records");

            let applied = migrate::get_applied_migrations(conn)?;
            log::debug!("✓ {} migrations applied", applied.len());

            let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            if journal_mode.to_uppercase() != "WAL" {
                return Err(TidewaterError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
            }

            let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            if integrity != "ok" {
                return Err(TidewaterError::Config(format!(
                    "Database integrity check failed: {}",
                    integrity
                )));
            }
            log::info!("✓ Database integrity: OK");
            Ok(())
        })
        .await?;

    for (key, files) in store.load_all().await? {
        let done = files.values().filter(|r| r.ingested).count();
        log::info!("[{}] {} file(s), {} complete", key, files.len(), done);
    }

    log::info!("✓ State database verification complete");
    Ok(())
}
