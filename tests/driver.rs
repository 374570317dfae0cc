//! End-to-end sampling of CSPP files through the driver.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tempfile::TempDir;
use tidewater::config::{CsppOptions, DriverConfig, ParserConfig, SourceConfig};
use tidewater::ingest::{compute_file_hash, mod_date_seconds};
use tidewater::{
    Callbacks, Config, Driver, DriverException, DriverMemento, ExceptionKind, FileRecord,
    ParserState, Particle, ParticleKind, SourceStatus,
};

const TELEM_FILE: &str = "11079364_PPD_PARS.txt";
const RECOV_FILE: &str = "11079364_PPB_PARS.txt";
const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Fixture {
    particles: Vec<Expected>,
}

#[derive(Debug, Deserialize)]
struct Expected {
    kind: ParticleKind,
    stream: String,
    position: u64,
    payload: serde_json::Value,
}

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn expected() -> Vec<Expected> {
    let text = fs::read_to_string(fixture_path("11079364_PPD_PARS.yml")).unwrap();
    let fixture: Fixture = serde_yaml_ng::from_str(&text).unwrap();
    fixture.particles
}

fn assert_matches_fixture(actual: &[Particle], expected: &[Expected], source_key: &str, filename: &str) {
    assert_eq!(actual.len(), expected.len(), "particle count");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(a.kind, e.kind, "kind of particle {}", i);
        assert_eq!(a.stream, e.stream, "stream of particle {}", i);
        assert_eq!(a.position, e.position, "position of particle {}", i);
        assert_eq!(a.payload, e.payload, "payload of particle {}", i);
        assert_eq!(a.source_key, source_key);
        assert_eq!(a.filename, filename);
    }
}

/// Collects everything the driver reports.
#[derive(Clone, Default)]
struct Recorder {
    particles: Arc<Mutex<Vec<Particle>>>,
    exceptions: Arc<Mutex<Vec<DriverException>>>,
    states: Arc<Mutex<Vec<(String, String, FileRecord)>>>,
}

impl Recorder {
    fn callbacks(&self) -> Callbacks {
        let particles = self.particles.clone();
        let states = self.states.clone();
        let exceptions = self.exceptions.clone();
        Callbacks::new(
            move |p| particles.lock().unwrap().push(p),
            move |source, file, record| {
                states
                    .lock()
                    .unwrap()
                    .push((source.to_string(), file.to_string(), record.clone()))
            },
            move |e| exceptions.lock().unwrap().push(e.clone()),
        )
    }

    fn particles(&self) -> Vec<Particle> {
        self.particles.lock().unwrap().clone()
    }

    fn particles_of(&self, source_key: &str) -> Vec<Particle> {
        self.particles()
            .into_iter()
            .filter(|p| p.source_key == source_key)
            .collect()
    }

    fn exceptions(&self) -> Vec<DriverException> {
        self.exceptions.lock().unwrap().clone()
    }

    fn completed(&self, source_key: &str, filename: &str) -> bool {
        self.states
            .lock()
            .unwrap()
            .iter()
            .any(|(s, f, r)| s == source_key && f == filename && r.ingested)
    }

    async fn wait_until(&self, what: &str, cond: impl Fn(&Recorder) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !cond(self) {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {}: {} particles, exceptions {:?}",
                    what,
                    self.particles().len(),
                    self.exceptions()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct Setup {
    root: TempDir,
}

impl Setup {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("telem")).unwrap();
        fs::create_dir_all(root.path().join("recov")).unwrap();
        Self { root }
    }

    fn telem_dir(&self) -> PathBuf {
        self.root.path().join("telem")
    }

    fn recov_dir(&self) -> PathBuf {
        self.root.path().join("recov")
    }

    fn source(dir: PathBuf, pattern: &str, frequency: f64) -> SourceConfig {
        SourceConfig {
            directory: dir,
            pattern: pattern.to_string(),
            frequency,
            parser: ParserConfig::Cspp(CsppOptions {
                delimiter: Some('\t'),
                ..CsppOptions::default()
            }),
        }
    }

    fn config(&self, frequency: f64, max_records_per_cycle: Option<usize>) -> Config {
        let mut sources = BTreeMap::new();
        sources.insert(
            "telemetered".to_string(),
            Self::source(self.telem_dir(), "*_PPD_PARS.txt", frequency),
        );
        sources.insert(
            "recovered".to_string(),
            Self::source(self.recov_dir(), "*_PPB_PARS.txt", frequency),
        );
        Config {
            driver: DriverConfig {
                resource_id: "parad_j_cspp".to_string(),
                state_db: self.root.path().join("state.db"),
                max_records_per_cycle,
                ..DriverConfig::default()
            },
            sources,
        }
    }

    fn add_telem_file(&self) -> PathBuf {
        let target = self.telem_dir().join(TELEM_FILE);
        fs::copy(fixture_path(TELEM_FILE), &target).unwrap();
        target
    }

    async fn driver(&self, recorder: &Recorder, frequency: f64, max_per_cycle: Option<usize>) -> Driver {
        Driver::new(self.config(frequency, max_per_cycle), recorder.callbacks())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_full_file_matches_fixture() {
    let setup = Setup::new();
    setup.add_telem_file();
    let recorder = Recorder::default();

    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("file completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;
    // A few more polls must not re-deliver anything.
    tokio::time::sleep(Duration::from_millis(200)).await;
    driver.stop_sampling().await.unwrap();

    let particles = recorder.particles();
    assert_eq!(particles.len(), 20);
    assert_eq!(particles[0].kind, ParticleKind::Metadata);
    assert!(particles[1..].iter().all(|p| p.kind == ParticleKind::Instrument));
    assert_matches_fixture(&particles, &expected(), "telemetered", TELEM_FILE);
    assert!(recorder.exceptions().is_empty());

    let memento = driver.memento().await.unwrap();
    let record = &memento["telemetered"][TELEM_FILE];
    assert!(record.ingested);
    assert_eq!(record.file_size, fs::metadata(setup.telem_dir().join(TELEM_FILE)).unwrap().len());
}

#[tokio::test]
async fn test_mid_state_start_emits_only_remaining_record() {
    let setup = Setup::new();
    let path = setup.add_telem_file();
    let expected = expected();

    // First 19 particles (metadata + 18 rows) already delivered.
    let meta = fs::metadata(&path).unwrap();
    let record = FileRecord {
        ingested: false,
        file_mod_date: mod_date_seconds(meta.modified().unwrap()),
        file_checksum: compute_file_hash(&path).unwrap(),
        file_size: meta.len(),
        parser_state: Some(ParserState::new(
            "cspp",
            serde_json::json!({"position": expected[18].position, "metadata_extracted": true}),
        )),
    };
    let mut memento = DriverMemento::new();
    memento
        .entry("telemetered".to_string())
        .or_default()
        .insert(TELEM_FILE.to_string(), record);

    let recorder = Recorder::default();
    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.restore(&memento).await.unwrap();
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("file completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;
    driver.stop_sampling().await.unwrap();

    let particles = recorder.particles();
    assert_matches_fixture(&particles, &expected[19..], "telemetered", TELEM_FILE);
}

#[tokio::test]
async fn test_stop_after_one_particle_then_resume() {
    let setup = Setup::new();
    setup.add_telem_file();
    let expected = expected();

    // One particle per (long) cycle, so the first run stops after exactly one.
    let first = Recorder::default();
    let mut driver = setup.driver(&first, 30.0, Some(1)).await;
    driver.start_sampling().await.unwrap();
    first.wait_until("first particle", |r| r.particles().len() == 1).await;
    driver.stop_sampling().await.unwrap();
    drop(driver);
    assert_eq!(first.particles().len(), 1);

    let second = Recorder::default();
    let mut driver = setup.driver(&second, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    second
        .wait_until("file completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;
    driver.stop_sampling().await.unwrap();

    let mut all = first.particles();
    all.extend(second.particles());
    assert_eq!(second.particles().len(), expected.len() - 1);
    assert_matches_fixture(&all, &expected, "telemetered", TELEM_FILE);
}

#[tokio::test]
async fn test_split_runs_match_continuous_run() {
    let setup = Setup::new();
    setup.add_telem_file();
    let expected = expected();

    let mut all = Vec::new();
    while all.len() < expected.len() {
        let want = (all.len() + 3).min(expected.len()) - all.len();
        let recorder = Recorder::default();
        let mut driver = setup.driver(&recorder, 30.0, Some(3)).await;
        driver.start_sampling().await.unwrap();
        recorder
            .wait_until("one cycle of particles", |r| r.particles().len() == want)
            .await;
        driver.stop_sampling().await.unwrap();
        all.extend(recorder.particles());
    }

    assert_matches_fixture(&all, &expected, "telemetered", TELEM_FILE);
}

#[tokio::test]
async fn test_malformed_record_raises_one_exception() {
    let setup = Setup::new();
    let text = fs::read_to_string(fixture_path(TELEM_FILE)).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines[10] = "not\ta\tvalid row";
    fs::write(setup.telem_dir().join(TELEM_FILE), lines.join("\n") + "\n").unwrap();

    let recorder = Recorder::default();
    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("file completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;
    driver.stop_sampling().await.unwrap();

    assert_eq!(recorder.particles().len(), 19);
    let exceptions = recorder.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].kind, ExceptionKind::SampleException);
    assert_eq!(exceptions[0].filename.as_deref(), Some(TELEM_FILE));
}

#[tokio::test]
async fn test_rewritten_file_is_ingested_again_from_start() {
    let setup = Setup::new();
    let path = setup.add_telem_file();
    let recorder = Recorder::default();

    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("file completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;

    let text = fs::read_to_string(&path).unwrap();
    let shortened: Vec<&str> = text.lines().take(9).collect();
    fs::write(&path, shortened.join("\n") + "\n").unwrap();

    recorder
        .wait_until("rewritten file", |r| r.particles().len() == 24)
        .await;
    driver.stop_sampling().await.unwrap();

    let particles = recorder.particles();
    assert_eq!(particles[20].kind, ParticleKind::Metadata);
    let expected = expected();
    assert_matches_fixture(&particles[20..], &expected[..4], "telemetered", TELEM_FILE);
}

#[tokio::test]
async fn test_sources_are_independent() {
    let setup = Setup::new();
    fs::copy(fixture_path(TELEM_FILE), setup.recov_dir().join(RECOV_FILE)).unwrap();
    fs::remove_dir(setup.telem_dir()).unwrap();

    let recorder = Recorder::default();
    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("recovered completion", |r| r.completed("recovered", RECOV_FILE))
        .await;

    assert_eq!(driver.source_status("telemetered"), Some(SourceStatus::Failed));
    assert_eq!(driver.source_status("recovered"), Some(SourceStatus::Sampling));
    driver.stop_sampling().await.unwrap();

    assert_matches_fixture(&recorder.particles_of("recovered"), &expected(), "recovered", RECOV_FILE);
    let exceptions = recorder.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].kind, ExceptionKind::WatchIo);
    assert_eq!(exceptions[0].source_key, "telemetered");
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_file_kills_only_its_source() {
    use std::os::unix::fs::PermissionsExt;

    let setup = Setup::new();
    let path = setup.recov_dir().join(RECOV_FILE);
    fs::copy(fixture_path(TELEM_FILE), &path).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read(&path).is_ok() {
        // Permissions are not enforced for this user.
        return;
    }
    setup.add_telem_file();

    let recorder = Recorder::default();
    let mut driver = setup.driver(&recorder, 0.05, None).await;
    driver.start_sampling().await.unwrap();
    recorder
        .wait_until("telemetered completion", |r| r.completed("telemetered", TELEM_FILE))
        .await;
    recorder
        .wait_until("watcher failure", |r| !r.exceptions().is_empty())
        .await;
    driver.stop_sampling().await.unwrap();

    let exceptions = recorder.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].kind, ExceptionKind::WatchIo);
    assert_eq!(exceptions[0].source_key, "recovered");
    assert_eq!(recorder.particles_of("telemetered").len(), 20);
    assert!(recorder.particles_of("recovered").is_empty());
}
