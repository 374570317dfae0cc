pub mod config;
pub mod error;
pub mod db;
pub mod state;
pub mod ingest;
pub mod watch;
pub mod driver;

pub use config::Config;
pub use error::{TidewaterError, Result};
pub use driver::{Callbacks, Driver, DriverException, ExceptionKind, SourceStatus};
pub use ingest::{Particle, ParticleKind};
pub use state::{DriverMemento, FileRecord, ParserState, StateStore};
