//! One source's watch-and-parse loop.
//!
//! A pipeline owns its watcher, its in-memory copy of the source's file
//! records and the queue of files still to ingest. It never touches the state
//! store or the callbacks directly: everything goes out as [`PipelineEvent`]s
//! to the driver's dispatch task, which persists checkpoints in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DriverException, ExceptionKind};
use crate::config::SourceConfig;
use crate::error::{Result, TidewaterError};
use crate::ingest::{
    build_parser, compute_prefix_hash, ParseContext, ParseEvent, Particle, RecordParser,
};
use crate::state::{FileRecord, Fingerprint};
use crate::watch::{FilePattern, FileWatcher, Observation, WatchEvent};

/// Messages from pipelines to the dispatch task.
#[derive(Debug)]
pub(crate) enum PipelineEvent {
    Particle(Particle),
    Checkpoint {
        source_key: String,
        filename: String,
        record: FileRecord,
    },
    Exception(DriverException),
}

/// Emission limits shared by all pipelines of a driver.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits {
    /// Minimum spacing between two particles.
    pub min_interval: Option<Duration>,
    pub max_records_per_cycle: Option<usize>,
}

enum FileOutcome {
    /// Ingestion complete.
    Done,
    /// Read to the end but the file may still grow.
    Waiting,
    /// Left the directory since the last poll.
    Gone,
    /// Unrecoverable parse failure; the file is in ERROR.
    Failed,
    BudgetExhausted,
    Cancelled,
    /// The file could not be read; the pipeline dies.
    Fatal(TidewaterError),
}

pub(crate) struct SourcePipeline {
    source_key: String,
    config: SourceConfig,
    watcher: FileWatcher,
    records: HashMap<String, FileRecord>,
    pending: VecDeque<String>,
    errored: HashSet<String>,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    limits: Limits,
    last_emit: Option<Instant>,
}

impl SourcePipeline {
    pub(crate) fn new(
        source_key: String,
        config: SourceConfig,
        records: HashMap<String, FileRecord>,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
        limits: Limits,
    ) -> Result<Self> {
        let pattern = FilePattern::new(&config.pattern)?;
        let watcher = FileWatcher::new(config.directory.clone(), pattern);

        // Unfinished files from an earlier run go first, oldest first.
        let mut unfinished: Vec<(&String, &FileRecord)> =
            records.iter().filter(|(_, r)| !r.ingested).collect();
        unfinished.sort_by(|a, b| {
            a.1.file_mod_date
                .total_cmp(&b.1.file_mod_date)
                .then_with(|| a.0.cmp(b.0))
        });
        let pending = unfinished.into_iter().map(|(name, _)| name.clone()).collect();

        Ok(Self {
            source_key,
            config,
            watcher,
            records,
            pending,
            errored: HashSet::new(),
            events,
            cancel,
            limits,
            last_emit: None,
        })
    }

    /// Poll and ingest until cancelled or the watcher dies.
    pub(crate) async fn run(mut self) {
        log::info!(
            "[{}] sampling {} ({}), {} file(s) to resume",
            self.source_key,
            self.config.directory.display(),
            self.config.pattern,
            self.pending.len()
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.poll().await {
                self.die(e).await;
                return;
            }

            match self.ingest_pending().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.die(e).await;
                    return;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        log::info!("[{}] sampling stopped", self.source_key);
    }

    async fn die(&self, e: TidewaterError) {
        log::error!("[{}] watcher is dead: {}", self.source_key, e);
        self.exception(ExceptionKind::WatchIo, None, e.to_string()).await;
    }

    async fn poll(&mut self) -> Result<()> {
        for event in self.watcher.poll(&self.records).await? {
            match event {
                WatchEvent::New { filename, fingerprint } => {
                    log::info!("[{}] new file {}", self.source_key, filename);
                    self.start_fresh(filename, fingerprint).await;
                }
                WatchEvent::Modified { filename, fingerprint } => {
                    self.file_modified(filename, fingerprint).await;
                }
            }
        }
        Ok(())
    }

    async fn start_fresh(&mut self, filename: String, fingerprint: Fingerprint) {
        self.errored.remove(&filename);
        self.checkpoint(&filename, FileRecord::new(fingerprint)).await;
        self.enqueue(filename);
    }

    async fn file_modified(&mut self, filename: String, fingerprint: Fingerprint) {
        let Some(existing) = self.records.get(&filename).cloned() else {
            self.start_fresh(filename, fingerprint).await;
            return;
        };
        let previous = existing.fingerprint();

        if previous.same_content(&fingerprint) {
            let mut record = existing;
            record.set_fingerprint(fingerprint);
            self.checkpoint(&filename, record).await;
            return;
        }

        let in_progress = !existing.ingested && !self.errored.contains(&filename);
        if in_progress
            && fingerprint.file_size >= previous.file_size
            && self.prefix_unchanged(&filename, &previous).await
        {
            log::debug!(
                "[{}] {} grew from {} to {} bytes",
                self.source_key,
                filename,
                previous.file_size,
                fingerprint.file_size
            );
            let mut record = existing;
            record.set_fingerprint(fingerprint);
            self.checkpoint(&filename, record).await;
            self.enqueue(filename);
            return;
        }

        if existing.ingested || existing.parser_state.is_some() {
            log::warn!(
                "[{}] {} was rewritten ({} -> {} bytes), ingesting it again from the start",
                self.source_key,
                filename,
                previous.file_size,
                fingerprint.file_size
            );
        }
        self.start_fresh(filename, fingerprint).await;
    }

    /// Whether the bytes fingerprinted before are still the file's prefix.
    async fn prefix_unchanged(&self, filename: &str, previous: &Fingerprint) -> bool {
        let Some(path) = self.watcher.path_of(filename).map(|p| p.to_path_buf()) else {
            return false;
        };
        let len = previous.file_size;
        let hashed = tokio::task::spawn_blocking(move || compute_prefix_hash(&path, len)).await;
        match hashed.map_err(TidewaterError::from).and_then(|r| r) {
            Ok(hash) => hash == previous.file_checksum,
            Err(e) => {
                log::debug!("[{}] prefix check of {} failed: {}", self.source_key, filename, e);
                false
            }
        }
    }

    fn enqueue(&mut self, filename: String) {
        if !self.pending.contains(&filename) {
            self.pending.push_back(filename);
        }
    }

    /// Work through the queue once. `Ok(false)` when cancelled.
    async fn ingest_pending(&mut self) -> Result<bool> {
        let mut budget = self.limits.max_records_per_cycle;
        let queue: Vec<String> = self.pending.iter().cloned().collect();

        for filename in queue {
            match self.ingest_file(&filename, &mut budget).await {
                FileOutcome::Done | FileOutcome::Gone | FileOutcome::Failed => {
                    self.pending.retain(|f| f != &filename);
                }
                FileOutcome::Waiting => {}
                FileOutcome::BudgetExhausted => {
                    log::debug!("[{}] cycle budget used up in {}", self.source_key, filename);
                    break;
                }
                FileOutcome::Cancelled => return Ok(false),
                FileOutcome::Fatal(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn ingest_file(&mut self, filename: &str, budget: &mut Option<usize>) -> FileOutcome {
        let Some(observation) = self.watcher.observation(filename).cloned() else {
            log::debug!("[{}] {} is no longer in the directory", self.source_key, filename);
            return FileOutcome::Gone;
        };
        let Some(mut record) = self.records.get(filename).cloned() else {
            return FileOutcome::Gone;
        };
        if record.ingested {
            return FileOutcome::Done;
        }

        let mut state = record.parser_state.clone();
        let (mut parser, is_final) = loop {
            let data = match read_file(observation.path.clone()).await {
                Ok(Some(data)) => data,
                Ok(None) => return FileOutcome::Gone,
                Err(e) => return FileOutcome::Fatal(e),
            };
            let is_final = file_is_final(&observation, &data);

            match build_parser(
                &self.config.parser,
                state.as_ref(),
                data,
                is_final,
                self.context(filename),
            ) {
                Ok(parser) => break (parser, is_final),
                Err(TidewaterError::ParserStateCorrupt(detail)) if state.is_some() => {
                    log::warn!(
                        "[{}] saved state of {} is unusable ({}), ingesting it from the start",
                        self.source_key,
                        filename,
                        detail
                    );
                    self.exception(ExceptionKind::ParserStateCorrupt, Some(filename), detail)
                        .await;
                    state = None;
                    record = FileRecord::new(record.fingerprint());
                    self.checkpoint(filename, record.clone()).await;
                }
                Err(e) => return self.fail_file(filename, e).await,
            }
        };

        if let Some(outcome) = self.drain(filename, &mut record, parser.as_mut(), budget).await {
            return outcome;
        }

        if !is_final {
            log::debug!(
                "[{}] {} read up to byte {}, waiting for it to settle",
                self.source_key,
                filename,
                parser.position()
            );
            return FileOutcome::Waiting;
        }

        record.ingested = true;
        record.parser_state = Some(parser.checkpoint());
        self.checkpoint(filename, record).await;
        log::info!("[{}] finished {}", self.source_key, filename);
        FileOutcome::Done
    }

    /// Emit records until the parser runs dry. `Some` when stopped early.
    async fn drain(
        &mut self,
        filename: &str,
        record: &mut FileRecord,
        parser: &mut dyn RecordParser,
        budget: &mut Option<usize>,
    ) -> Option<FileOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Some(FileOutcome::Cancelled);
            }
            if *budget == Some(0) {
                return Some(FileOutcome::BudgetExhausted);
            }

            match parser.next_event() {
                Ok(Some(ParseEvent::Particle(particle))) => {
                    if !self.throttle().await {
                        return Some(FileOutcome::Cancelled);
                    }
                    self.send(PipelineEvent::Particle(particle)).await;
                    record.parser_state = Some(parser.checkpoint());
                    self.checkpoint(filename, record.clone()).await;
                    if let Some(left) = budget.as_mut() {
                        *left -= 1;
                    }
                }
                Ok(Some(ParseEvent::Malformed { position, detail })) => {
                    log::warn!(
                        "[{}] skipped malformed record in {} ending at byte {}: {}",
                        self.source_key,
                        filename,
                        position,
                        detail
                    );
                    self.exception(ExceptionKind::SampleException, Some(filename), detail)
                        .await;
                    record.parser_state = Some(parser.checkpoint());
                    self.checkpoint(filename, record.clone()).await;
                }
                Ok(None) => return None,
                Err(e) => return Some(self.fail_file(filename, e).await),
            }
        }
    }

    async fn fail_file(&mut self, filename: &str, e: TidewaterError) -> FileOutcome {
        log::error!("[{}] giving up on {}: {}", self.source_key, filename, e);
        self.errored.insert(filename.to_string());
        self.exception(ExceptionKind::ParserFailure, Some(filename), e.to_string())
            .await;
        FileOutcome::Failed
    }

    /// Wait out the emission rate limit. `false` when cancelled meanwhile.
    async fn throttle(&mut self) -> bool {
        if let (Some(interval), Some(last)) = (self.limits.min_interval, self.last_emit) {
            let due = last + interval;
            if due > Instant::now() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
        }
        self.last_emit = Some(Instant::now());
        true
    }

    fn context(&self, filename: &str) -> ParseContext {
        ParseContext {
            source_key: self.source_key.clone(),
            filename: filename.to_string(),
        }
    }

    async fn checkpoint(&mut self, filename: &str, record: FileRecord) {
        self.records.insert(filename.to_string(), record.clone());
        self.send(PipelineEvent::Checkpoint {
            source_key: self.source_key.clone(),
            filename: filename.to_string(),
            record,
        })
        .await;
    }

    async fn exception(&self, kind: ExceptionKind, filename: Option<&str>, detail: String) {
        self.send(PipelineEvent::Exception(DriverException {
            kind,
            source_key: self.source_key.clone(),
            filename: filename.map(str::to_string),
            detail,
        }))
        .await;
    }

    async fn send(&self, event: PipelineEvent) {
        if self.events.send(event).await.is_err() {
            log::warn!("[{}] dispatch loop has gone away, event dropped", self.source_key);
        }
    }
}

/// The whole file, `None` if it vanished. Reads on the blocking pool.
async fn read_file(path: PathBuf) -> Result<Option<Vec<u8>>> {
    let (path, read) = tokio::task::spawn_blocking(move || {
        let read = std::fs::read(&path);
        (path, read)
    })
    .await?;
    match read {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TidewaterError::WatchIo {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// A file is final once it held still across two polls and nothing was added since.
fn file_is_final(observation: &Observation, data: &[u8]) -> bool {
    observation.stable && data.len() as u64 == observation.file_size
}
