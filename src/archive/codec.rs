//! Packing and unpacking of gzip-compressed tar streams
//!
//! Packing happens in two steps. [`PackedArchive::plan`] walks the source
//! tree up front so a missing or unreadable directory fails before anything
//! touches the network. [`PackedArchive::into_stream`] then writes the archive
//! on a blocking worker and hands out the compressed bytes chunk by chunk.
//!
//! Unpacking reads the stream incrementally; nothing is buffered in full.

use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::filter::PathFilter;
use super::ArchiveError;

/// Size of the chunks handed to the network
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the archive worker and the consumer
const CHANNEL_DEPTH: usize = 8;

/// Compressed archive bytes as they are produced
pub type ArchiveStream = ReceiverStream<io::Result<Bytes>>;

/// One filesystem entry scheduled for an archive
#[derive(Debug, Clone)]
struct PlannedEntry {
    /// Path inside the archive
    relative: PathBuf,
    /// Path on disk
    absolute: PathBuf,
    is_dir: bool,
}

/// An archive whose entries have been resolved but not yet written
#[derive(Debug)]
pub struct PackedArchive {
    entries: Vec<PlannedEntry>,
}

/// Outcome of a successful unpack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Entries written to the destination
    pub extracted: usize,
    /// Entries dropped by the filter
    pub skipped: usize,
}

impl PackedArchive {
    /// Resolve the entries of an archive
    ///
    /// # Arguments
    /// * `source` - Directory the entry paths are relative to
    /// * `roots` - Relative paths to include, recursively
    /// * `filter` - Entries (and whole subtrees) it rejects are left out
    pub fn plan(
        source: &Path,
        roots: &[PathBuf],
        filter: &dyn PathFilter,
    ) -> Result<Self, ArchiveError> {
        let mut entries = Vec::new();

        for root in roots {
            ensure_contained(root)?;
            let absolute_root = source.join(root);
            if let Err(e) = std::fs::symlink_metadata(&absolute_root) {
                return Err(match e.kind() {
                    io::ErrorKind::NotFound => ArchiveError::SourceMissing(absolute_root),
                    _ => ArchiveError::Io(e),
                });
            }

            let walker = WalkDir::new(&absolute_root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    entry
                        .path()
                        .strip_prefix(source)
                        .map(|relative| filter.keep(relative))
                        .unwrap_or(false)
                });

            for entry in walker {
                let entry = entry?;
                let relative = entry
                    .path()
                    .strip_prefix(source)
                    .map_err(|_| ArchiveError::UnsafePath(entry.path().to_path_buf()))?
                    .to_path_buf();
                entries.push(PlannedEntry {
                    relative,
                    absolute: entry.path().to_path_buf(),
                    is_dir: entry.file_type().is_dir(),
                });
            }
        }

        debug!(
            source = %source.display(),
            entries = entries.len(),
            "Planned archive"
        );
        Ok(Self { entries })
    }

    /// Number of entries that will be written
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Archive-relative paths, in archive order
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.relative.as_path())
    }

    /// Write the compressed archive into `writer` and return it
    pub fn write_to<W: Write>(&self, writer: W) -> Result<W, ArchiveError> {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for entry in &self.entries {
            trace!(path = %entry.relative.display(), "Appending archive entry");
            if entry.is_dir {
                builder.append_dir(&entry.relative, &entry.absolute)?;
            } else {
                builder.append_path_with_name(&entry.absolute, &entry.relative)?;
            }
        }

        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Produce the compressed archive as a stream of chunks
    ///
    /// The archive is written on a blocking worker; an error while reading
    /// the source is delivered as the last item of the stream. Must be called
    /// from within a Tokio runtime.
    pub fn into_stream(self) -> ArchiveStream {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            let writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx: tx.clone() });
            let result = self
                .write_to(writer)
                .and_then(|mut writer| writer.flush().map_err(ArchiveError::from));

            if let Err(e) = result {
                debug!(error = %e, "Archive stream aborted");
                // The receiver may already be gone; nothing left to tell then
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
            }
        });

        ReceiverStream::new(rx)
    }
}

/// `Write` adapter that forwards every buffer to an async channel
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Unpack a compressed archive stream under `destination`
///
/// Entries rejected by `filter` are skipped silently. The first structural
/// error (corrupt stream, entry escaping the destination, write failure)
/// aborts the remaining writes.
pub async fn unpack<S>(
    stream: S,
    destination: &Path,
    filter: Arc<dyn PathFilter>,
) -> Result<UnpackSummary, ArchiveError>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    let reader = SyncIoBridge::new(StreamReader::new(stream));
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || unpack_from_reader(reader, &destination, filter.as_ref()))
        .await
        .map_err(|e| ArchiveError::Interrupted(e.to_string()))?
}

/// Blocking counterpart of [`unpack`]
pub fn unpack_from_reader<R: Read>(
    reader: R,
    destination: &Path,
    filter: &dyn PathFilter,
) -> Result<UnpackSummary, ArchiveError> {
    std::fs::create_dir_all(destination)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);

    let mut summary = UnpackSummary::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        ensure_contained(&path)?;

        if path.components().all(|c| matches!(c, Component::CurDir)) {
            continue;
        }
        if !filter.keep(&path) {
            trace!(path = %path.display(), "Skipping filtered archive entry");
            summary.skipped += 1;
            continue;
        }
        if !entry.unpack_in(destination)? {
            return Err(ArchiveError::UnsafePath(path));
        }
        summary.extracted += 1;
    }

    debug!(
        destination = %destination.display(),
        extracted = summary.extracted,
        skipped = summary.skipped,
        "Unpacked archive"
    );
    Ok(summary)
}

/// Reject absolute paths and `..` components
fn ensure_contained(path: &Path) -> Result<(), ArchiveError> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ArchiveError::UnsafePath(path.to_path_buf())),
        }
    }
    Ok(())
}
