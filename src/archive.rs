//! Gzip-compressed tar archives of a build directory, produced as a stream.
//!
//! The archive starts with the directory itself under the name `./`, followed
//! by its contents in file-name order. [`ArchiveStream::of_directory`] builds
//! the archive on a blocking task and hands it out in chunks through a
//! bounded channel, so an upload never holds the whole archive in memory.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::Stream;
use tar::{Builder, EntryType, Header};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the first archive entry, standing for the directory root.
pub const ROOT_ENTRY: &str = "./";

const CHUNK_CAPACITY: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Errors raised while archiving a directory.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The directory to archive does not exist or is not a directory.
    #[error("build directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be archived.
        path: Utf8PathBuf,
    },
    /// Walking the directory tree failed.
    #[error("failed to walk build directory: {0}")]
    Walk(#[from] walkdir::Error),
    /// Reading a file or writing the archive failed.
    #[error("failed to write archive: {0}")]
    Io(#[from] io::Error),
}

/// Writes the gzip-compressed tar archive of `dir` into `writer`.
///
/// Returns the writer once the archive is complete.
///
/// # Errors
///
/// Returns [`ArchiveError`] when `dir` is not a directory or when any read or
/// write fails.
pub fn write_archive<W: Write>(dir: &Utf8Path, writer: W) -> Result<W, ArchiveError> {
    if !dir.is_dir() {
        return Err(ArchiveError::MissingSource {
            path: dir.to_path_buf(),
        });
    }

    let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.follow_symlinks(false);
    append_root(&mut builder, dir)?;

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|err| io::Error::other(err.to_string()))?;
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_root<W: Write>(builder: &mut Builder<W>, dir: &Utf8Path) -> Result<(), ArchiveError> {
    let metadata = fs::metadata(dir)?;
    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    // `set_path` normalises `./` away, so the name is written directly.
    if let Some(slot) = header.as_old_mut().name.get_mut(..ROOT_ENTRY.len()) {
        slot.copy_from_slice(ROOT_ENTRY.as_bytes());
    }
    header.set_cksum();
    builder.append(&header, io::empty())?;
    Ok(())
}

/// Single-pass stream of archive bytes.
///
/// Yields an error item and then ends if archiving fails part-way.
#[derive(Debug)]
pub struct ArchiveStream {
    chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl ArchiveStream {
    /// Starts archiving `dir` on a blocking task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn of_directory(dir: &Utf8Path) -> Self {
        let (tx, chunks) = mpsc::channel(CHANNEL_DEPTH);
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || produce(&dir, tx));
        Self { chunks }
    }

    /// Wraps a receiver fed by some other producer.
    #[must_use]
    pub const fn from_receiver(chunks: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self { chunks }
    }
}

impl Stream for ArchiveStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

fn produce(dir: &Utf8Path, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let writer = BufWriter::with_capacity(CHUNK_CAPACITY, ChunkWriter { tx: tx.clone() });
    let result = write_archive(dir, writer).and_then(|mut buffered| {
        buffered.flush()?;
        Ok(())
    });

    match result {
        Ok(()) => debug!(%dir, "archive complete"),
        Err(err) => {
            debug!(%dir, error = %err, "archive failed");
            // The receiver may already be gone if the upload was cancelled.
            tx.blocking_send(Err(io::Error::other(err.to_string()))).ok();
        }
    }
}

struct ChunkWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
