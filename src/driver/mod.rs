//! Ingestion coordinator.
//!
//! A [`Driver`] runs one [`pipeline::SourcePipeline`] task per configured
//! source. Pipelines report particles, checkpoints and failures over a
//! bounded channel to a single dispatch task, which calls the data callback,
//! persists each checkpoint to the [`StateStore`] and then calls the state
//! callback, strictly in the order the events were produced.

mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Result, TidewaterError};
use crate::ingest::Particle;
use crate::state::{DriverMemento, FileRecord, StateStore};
use pipeline::{Limits, PipelineEvent, SourcePipeline};

/// Failure categories reported through the exception callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// Source directory or file unreadable; the source's pipeline has stopped.
    WatchIo,
    /// A malformed record was skipped.
    SampleException,
    /// A saved checkpoint was unusable; the file is read again from the start.
    ParserStateCorrupt,
    /// The file cannot be parsed at all; it is left alone until it changes.
    ParserFailure,
    /// A checkpoint could not be persisted.
    StateStore,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::WatchIo => "watch_io",
            ExceptionKind::SampleException => "sample_exception",
            ExceptionKind::ParserStateCorrupt => "parser_state_corrupt",
            ExceptionKind::ParserFailure => "parser_failure",
            ExceptionKind::StateStore => "state_store",
        };
        f.write_str(name)
    }
}

/// What the exception callback receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverException {
    pub kind: ExceptionKind,
    pub source_key: String,
    pub filename: Option<String>,
    pub detail: String,
}

impl fmt::Display for DriverException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(name) => write!(f, "[{}] {} in {}: {}", self.source_key, self.kind, name, self.detail),
            None => write!(f, "[{}] {}: {}", self.source_key, self.kind, self.detail),
        }
    }
}

pub type DataCallback = Arc<dyn Fn(Particle) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(&str, &str, &FileRecord) + Send + Sync>;
pub type ExceptionCallback = Arc<dyn Fn(&DriverException) + Send + Sync>;

/// Callbacks the driver reports to. All run on the dispatch task.
#[derive(Clone)]
pub struct Callbacks {
    pub data: DataCallback,
    pub state: StateCallback,
    pub exception: ExceptionCallback,
}

impl Callbacks {
    pub fn new(
        data: impl Fn(Particle) + Send + Sync + 'static,
        state: impl Fn(&str, &str, &FileRecord) + Send + Sync + 'static,
        exception: impl Fn(&DriverException) + Send + Sync + 'static,
    ) -> Self {
        Self {
            data: Arc::new(data),
            state: Arc::new(state),
            exception: Arc::new(exception),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Stopped,
    Sampling,
    /// The pipeline ended on its own because its watcher died.
    Failed,
}

struct Sampling {
    cancel: CancellationToken,
    pipelines: BTreeMap<String, JoinHandle<()>>,
    dispatch: JoinHandle<()>,
}

pub struct Driver {
    config: Config,
    store: StateStore,
    callbacks: Callbacks,
    sampling: Option<Sampling>,
}

impl Driver {
    /// Open the configured state database and build a stopped driver.
    pub async fn new(config: Config, callbacks: Callbacks) -> Result<Self> {
        let store = StateStore::open(config.state_db()).await?;
        Ok(Self {
            config,
            store,
            callbacks,
            sampling: None,
        })
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling.is_some()
    }

    pub fn source_status(&self, source_key: &str) -> Option<SourceStatus> {
        if !self.config.sources.contains_key(source_key) {
            return None;
        }
        Some(match &self.sampling {
            None => SourceStatus::Stopped,
            Some(s) => match s.pipelines.get(source_key) {
                Some(handle) if !handle.is_finished() => SourceStatus::Sampling,
                _ => SourceStatus::Failed,
            },
        })
    }

    /// Write a saved memento into the state store. Only allowed while stopped.
    pub async fn restore(&self, memento: &DriverMemento) -> Result<usize> {
        if self.is_sampling() {
            return Err(TidewaterError::InvalidInput(
                "cannot restore state while sampling".to_string(),
            ));
        }
        let restored = self.store.restore(memento).await?;
        log::info!("Restored {} file record(s)", restored);
        Ok(restored)
    }

    /// Current persisted state of every source.
    pub async fn memento(&self) -> Result<DriverMemento> {
        self.store.load_all().await
    }

    /// Start one pipeline per source. Does nothing when already sampling.
    pub async fn start_sampling(&mut self) -> Result<()> {
        if self.sampling.is_some() {
            log::debug!("start_sampling: already sampling");
            return Ok(());
        }

        let mut loaded = Vec::with_capacity(self.config.sources.len());
        for (key, source) in &self.config.sources {
            let records = self.store.load(key).await?;
            loaded.push((key.clone(), source.clone(), records));
        }

        let limits = Limits {
            min_interval: self
                .config
                .driver
                .records_per_second
                .map(|rps| Duration::from_secs_f64(1.0 / rps)),
            max_records_per_cycle: self.config.driver.max_records_per_cycle,
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.driver.event_queue_capacity);

        let mut pipelines = BTreeMap::new();
        let mut built = Vec::with_capacity(loaded.len());
        for (key, source, records) in loaded {
            let pipeline = SourcePipeline::new(
                key.clone(),
                source,
                records,
                tx.clone(),
                cancel.child_token(),
                limits,
            )?;
            built.push((key, pipeline));
        }
        drop(tx);

        let dispatch = tokio::spawn(dispatch(rx, self.store.clone(), self.callbacks.clone()));
        for (key, pipeline) in built {
            pipelines.insert(key, tokio::spawn(pipeline.run()));
        }

        log::info!(
            "{}: sampling {} source(s)",
            self.config.driver.resource_id,
            pipelines.len()
        );
        self.sampling = Some(Sampling {
            cancel,
            pipelines,
            dispatch,
        });
        Ok(())
    }

    /// Stop all pipelines and wait until every emitted event has been dispatched.
    ///
    /// Safe to call when already stopped.
    pub async fn stop_sampling(&mut self) -> Result<()> {
        let Some(sampling) = self.sampling.take() else {
            return Ok(());
        };

        sampling.cancel.cancel();
        let mut first_error = None;
        let (keys, handles): (Vec<String>, Vec<JoinHandle<()>>) = sampling.pipelines.into_iter().unzip();
        for (key, joined) in keys.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                log::error!("[{}] pipeline task failed: {}", key, e);
                first_error.get_or_insert_with(|| format!("pipeline {}: {}", key, e));
            }
        }
        // All senders are gone now, so the dispatch loop drains and ends.
        if let Err(e) = sampling.dispatch.await {
            log::error!("dispatch task failed: {}", e);
            first_error.get_or_insert_with(|| format!("dispatch: {}", e));
        }

        log::info!("{}: sampling stopped", self.config.driver.resource_id);
        match first_error {
            Some(msg) => Err(TidewaterError::Task(msg)),
            None => Ok(()),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(sampling) = &self.sampling {
            sampling.cancel.cancel();
        }
    }
}

async fn dispatch(mut events: mpsc::Receiver<PipelineEvent>, store: StateStore, callbacks: Callbacks) {
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::Particle(particle) => (callbacks.data)(particle),
            PipelineEvent::Checkpoint {
                source_key,
                filename,
                record,
            } => match store.save(&source_key, &filename, &record).await {
                Ok(()) => (callbacks.state)(&source_key, &filename, &record),
                Err(e) => {
                    log::error!("[{}] failed to save state of {}: {}", source_key, filename, e);
                    (callbacks.exception)(&DriverException {
                        kind: ExceptionKind::StateStore,
                        source_key,
                        filename: Some(filename),
                        detail: e.to_string(),
                    });
                }
            },
            PipelineEvent::Exception(exception) => {
                log::debug!("{}", exception);
                (callbacks.exception)(&exception)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, JsonLinesOptions, ParserConfig, SourceConfig};
    use crate::state::Fingerprint;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut sources = BTreeMap::new();
        sources.insert(
            "telemetered".to_string(),
            SourceConfig {
                directory: dir.path().join("telem"),
                pattern: "*.jsonl".to_string(),
                frequency: 0.05,
                parser: ParserConfig::JsonLines(JsonLinesOptions::default()),
            },
        );
        Config {
            driver: DriverConfig {
                state_db: dir.path().join("state.db"),
                ..DriverConfig::default()
            },
            sources,
        }
    }

    fn quiet_callbacks() -> Callbacks {
        Callbacks::new(|_| {}, |_, _, _| {}, |_| {})
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("telem")).unwrap();
        let mut driver = Driver::new(config(&dir), quiet_callbacks()).await.unwrap();

        assert_eq!(driver.source_status("telemetered"), Some(SourceStatus::Stopped));
        assert_eq!(driver.source_status("nope"), None);

        driver.start_sampling().await.unwrap();
        driver.start_sampling().await.unwrap();
        assert!(driver.is_sampling());
        assert_eq!(driver.source_status("telemetered"), Some(SourceStatus::Sampling));

        driver.stop_sampling().await.unwrap();
        driver.stop_sampling().await.unwrap();
        assert!(!driver.is_sampling());
        assert_eq!(driver.source_status("telemetered"), Some(SourceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_missing_directory_fails_source() {
        let dir = TempDir::new().unwrap();
        let seen: Arc<Mutex<Vec<DriverException>>> = Arc::default();
        let sink = seen.clone();
        let callbacks = Callbacks::new(|_| {}, |_, _, _| {}, move |e| sink.lock().unwrap().push(e.clone()));

        let mut driver = Driver::new(config(&dir), callbacks).await.unwrap();
        driver.start_sampling().await.unwrap();
        for _ in 0..100 {
            if driver.source_status("telemetered") == Some(SourceStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(driver.source_status("telemetered"), Some(SourceStatus::Failed));
        driver.stop_sampling().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ExceptionKind::WatchIo);
    }

    #[tokio::test]
    async fn test_restore_refused_while_sampling() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("telem")).unwrap();
        let mut driver = Driver::new(config(&dir), quiet_callbacks()).await.unwrap();
        driver.start_sampling().await.unwrap();
        assert!(driver.restore(&DriverMemento::new()).await.is_err());
        driver.stop_sampling().await.unwrap();
        assert_eq!(driver.restore(&DriverMemento::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_reports_state_store_exception() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state.db")).await.unwrap();
        store
            .db()
            .with_connection(|conn| {
                conn.execute("DROP TABLE file_records", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let exceptions: Arc<Mutex<Vec<DriverException>>> = Arc::default();
        let saved: Arc<Mutex<usize>> = Arc::default();
        let (exception_sink, state_sink) = (exceptions.clone(), saved.clone());
        let callbacks = Callbacks::new(
            |_| {},
            move |_, _, _| *state_sink.lock().unwrap() += 1,
            move |e| exception_sink.lock().unwrap().push(e.clone()),
        );

        let (tx, rx) = mpsc::channel(4);
        let record = FileRecord::new(Fingerprint {
            file_mod_date: 1.0,
            file_checksum: "abc".to_string(),
            file_size: 3,
        });
        tx.send(PipelineEvent::Checkpoint {
            source_key: "telemetered".to_string(),
            filename: "a.jsonl".to_string(),
            record,
        })
        .await
        .unwrap();
        drop(tx);

        dispatch(rx, store, callbacks).await;

        assert_eq!(*saved.lock().unwrap(), 0);
        let exceptions = exceptions.lock().unwrap();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].kind, ExceptionKind::StateStore);
        assert_eq!(exceptions[0].filename.as_deref(), Some("a.jsonl"));
    }

    #[test]
    fn test_exception_display() {
        let e = DriverException {
            kind: ExceptionKind::SampleException,
            source_key: "recovered".to_string(),
            filename: Some("x.txt".to_string()),
            detail: "expected 4 fields, found 1".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "[recovered] sample_exception in x.txt: expected 4 fields, found 1"
        );
    }
}
