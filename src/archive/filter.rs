//! Path filters applied to archive entries

use std::path::{Component, Path};

/// File the orchestrator keeps inside each hash directory for its own
/// integrity checks. It is host-specific and never round-trips through the cache.
pub const PROVENANCE_FILE_NAME: &str = "source";

/// Decides which archive entries are kept
///
/// Paths are relative to the cache directory, e.g. `abc123/out.txt`.
pub trait PathFilter: Send + Sync {
    /// Returns `true` to keep the entry
    fn keep(&self, path: &Path) -> bool;
}

/// Drops `{hash}/source`, keeps everything else
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvenanceFilter;

impl PathFilter for ProvenanceFilter {
    fn keep(&self, path: &Path) -> bool {
        let mut parts = path.components().filter(|c| !matches!(c, Component::CurDir));
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Component::Normal(_)), Some(Component::Normal(name)), None) => {
                name != PROVENANCE_FILE_NAME
            }
            _ => true,
        }
    }
}

/// Keeps every entry
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl PathFilter for KeepAll {
    fn keep(&self, _path: &Path) -> bool {
        true
    }
}
