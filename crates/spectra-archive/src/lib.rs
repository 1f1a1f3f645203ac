//! Archive pipeline: page through an entity's history, persist messages,
//! users, media, topics and mentions with checksums, download media with
//! sidecar metadata and a CSV download log, and checkpoint for resume.

pub mod error;
pub mod media;
pub mod pipeline;

pub use error::{ArchiveError, Result};
pub use media::MediaSink;
pub use pipeline::{ArchiveReport, Archiver};
