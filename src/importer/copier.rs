/// Stream Copier: drain a decoded stream into the destination file
///
/// The destination either ends up complete and synced, or does not exist.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::importer::error::ImportError;
use crate::importer::progress::ProgressTracker;
use crate::importer::transform::StageKind;
use crate::importer::validation::ImageFormat;

/// Copy buffer size
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a completed import
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub bytes_written: u64,
    pub destination: PathBuf,
    /// Decode stages applied, outermost last
    pub stages: Vec<StageKind>,
    pub format: ImageFormat,
    pub elapsed: Duration,
}

/// Write target that can be made durable
pub(crate) trait SyncWrite: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Copy `stream` to `destination`, truncating any existing file.
///
/// Returns the number of bytes written. On any read or write failure the
/// destination is removed and a `Copy` error is returned.
pub fn stream_data_to_file<R: Read + ?Sized>(
    stream: &mut R,
    destination: &Path,
) -> Result<u64, ImportError> {
    let mut progress = ProgressTracker::new(DEFAULT_PROGRESS_INTERVAL);
    copy_with_progress(stream, destination, &mut progress)
}

pub(crate) fn copy_with_progress<R: Read + ?Sized>(
    stream: &mut R,
    destination: &Path,
    progress: &mut ProgressTracker,
) -> Result<u64, ImportError> {
    copy_to_destination(stream, destination, |path| File::create(path), progress)
}

pub(crate) fn copy_to_destination<R, W, F>(
    stream: &mut R,
    destination: &Path,
    open: F,
    progress: &mut ProgressTracker,
) -> Result<u64, ImportError>
where
    R: Read + ?Sized,
    W: SyncWrite,
    F: FnOnce(&Path) -> io::Result<W>,
{
    tracing::info!(destination = %destination.display(), "writing destination file");
    let mut writer = open(destination).map_err(|source| ImportError::Copy {
        path: destination.to_path_buf(),
        source,
    })?;

    match copy_chunks(stream, &mut writer, progress) {
        Ok(written) => {
            tracing::debug!(bytes_written = written, "destination synced");
            Ok(written)
        }
        Err(e) => {
            drop(writer);
            Err(abandon_copy(destination, e))
        }
    }
}

/// Remove whatever was written to `destination` and report `source`
pub(crate) fn abandon_copy(destination: &Path, source: io::Error) -> ImportError {
    remove_partial(destination);
    ImportError::Copy {
        path: destination.to_path_buf(),
        source,
    }
}

fn copy_chunks<R, W>(
    stream: &mut R,
    writer: &mut W,
    progress: &mut ProgressTracker,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: SyncWrite,
{
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        written += n as u64;
        progress.add_written(n);
    }

    writer.flush()?;
    writer.sync()?;
    Ok(written)
}

fn remove_partial(destination: &Path) {
    match std::fs::remove_file(destination) {
        Ok(()) => tracing::info!(
            destination = %destination.display(),
            "removed partial destination file"
        ),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            destination = %destination.display(),
            error = %e,
            "failed to remove partial destination file"
        ),
    }
}
