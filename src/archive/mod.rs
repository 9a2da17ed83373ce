//! Archive codec for cache artifacts
//!
//! Artifacts travel as gzip-compressed tar streams whose entries are paths
//! relative to the cache directory (`{hash}/...`). The same [`PathFilter`] is
//! applied when packing and when unpacking.

pub mod codec;
pub mod filter;

use std::path::PathBuf;

pub use codec::{unpack, unpack_from_reader, ArchiveStream, PackedArchive, UnpackSummary};
pub use filter::{KeepAll, PathFilter, ProvenanceFilter};

/// Archive errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive source not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Archive entry escapes the destination: {0}")]
    UnsafePath(PathBuf),

    #[error("Failed to walk archive source: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive worker interrupted: {0}")]
    Interrupted(String),
}
