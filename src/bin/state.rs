//! Inspect and edit the persisted ingestion state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use tidewater::ingest::{classify_files, discover_files, find_deleted_files};
use tidewater::watch::FilePattern;
use tidewater::{Config, DriverMemento, StateStore};

#[derive(Parser, Debug)]
#[command(name = "state")]
#[command(about = "Inspect or reset tidewater ingestion state")]
struct Args {
    /// Config file (defaults to $TIDEWATER_CONFIG, then ./tidewater.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the saved state of every source as a memento
    Dump {
        #[arg(long, value_enum, default_value = "json")]
        format: DumpFormat,
        /// Only this source
        #[arg(long)]
        source: Option<String>,
    },
    /// Forget one file so it is ingested again from the start
    Reset { source: String, filename: String },
    /// Compare each source directory with the saved state
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DumpFormat {
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    let store = StateStore::open(config.state_db()).await?;

    match args.command {
        Command::Dump { format, source } => {
            let mut memento = store.load_all().await?;
            if let Some(source) = source {
                memento.retain(|key, _| *key == source);
            }
            print_memento(&memento, format)?;
        }
        Command::Reset { source, filename } => {
            if !config.sources.contains_key(&source) {
                anyhow::bail!("unknown source: {}", source);
            }
            match store.get(&source, &filename).await? {
                Some(record) => {
                    store.remove(&source, &filename).await?;
                    log::info!(
                        "[{}] {} will be ingested again on the next start (was {})",
                        source,
                        filename,
                        if record.ingested { "complete" } else { "in progress" }
                    );
                }
                None => log::warn!("[{}] no saved state for {}", source, filename),
            }
        }
        Command::Status => status(&config, &store).await?,
    }

    Ok(())
}

fn print_memento(memento: &DriverMemento, format: DumpFormat) -> Result<()> {
    let text = match format {
        DumpFormat::Json => serde_json::to_string_pretty(memento)?,
        DumpFormat::Yaml => serde_yaml_ng::to_string(memento)?,
    };
    println!("{}", text);
    Ok(())
}

async fn status(config: &Config, store: &StateStore) -> Result<()> {
    for (key, source) in &config.sources {
        let pattern = FilePattern::new(&source.pattern)?;
        let files = discover_files(&source.directory, &pattern)
            .with_context(|| format!("cannot list source {}", key))?;
        let records = store.load(key).await?;

        let classification = classify_files(&files, &records);
        let on_disk: HashSet<String> = files.iter().map(|f| f.filename.clone()).collect();
        let deleted = find_deleted_files(&records, &on_disk);

        let complete = classification
            .unchanged_files
            .iter()
            .filter(|f| records.get(&f.filename).map(|r| r.ingested).unwrap_or(false))
            .count();
        let in_progress = classification.unchanged_files.len() - complete;

        println!("[{}] {}", key, source.directory.display());
        println!("  complete:    {}", complete);
        println!("  in progress: {}", in_progress);
        println!("  new:         {}", classification.new_files.len());
        println!("  modified:    {}", classification.modified_files.len());
        for file in &classification.new_files {
            println!("    + {}", file.filename);
        }
        for file in &classification.modified_files {
            println!("    ~ {}", file.filename);
        }
        for filename in &deleted {
            println!("    - {} (no longer on disk)", filename);
        }
    }
    Ok(())
}
