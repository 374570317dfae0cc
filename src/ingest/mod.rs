pub mod walker;
pub mod metadata;
pub mod parsers;
pub mod incremental;

pub use walker::{FileMetadata, discover_files};
pub use incremental::{
    FileClass, FileClassification, classify_file, classify_files, find_deleted_files,
};
pub use metadata::{compute_file_hash, compute_prefix_hash, hash_bytes, mod_date_seconds};
pub use parsers::{
    build_parser, ParseContext, ParseEvent, Particle, ParticleKind, RecordParser,
};
