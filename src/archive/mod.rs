//! Album zip archives: request admission and the zip job itself.

use anyhow::Context;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::db::{AlbumZipRecord, Database};
use crate::error::{Error, Result};
use crate::tasks::{Job, JobQueue, Rejection, ZipJob};

/// Status message recorded when the queue refuses an accepted request.
pub const QUEUE_FULL: &str = "archive queue is full";

/// How long a request waits for the previous build of the same album to
/// release its queue slot.
const RELEASE_WAIT: Duration = Duration::from_secs(1);

/// Entry point for "give me a zip of this album".
pub struct AlbumArchiver {
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    photo_root: PathBuf,
    archive_dir: PathBuf,
}

impl AlbumArchiver {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<JobQueue>,
        photo_root: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            queue,
            photo_root: photo_root.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Request a fresh archive of an album.
    ///
    /// Fails with `Conflict` while a build for the album is `pending` or
    /// `processing`, and `NotFound` for unknown albums. Returns `false` if
    /// the queue is full; the record is then set to `error` so the request
    /// can be repeated.
    ///
    /// A build that has written `done` may still hold its queue slot for a
    /// moment. The request waits for that slot; if it is not released in
    /// time the album gets its previous status back and the request fails
    /// with `Conflict`.
    pub fn request_zip(&self, album_id: &str) -> Result<bool> {
        let album = self
            .db
            .get_album(album_id)?
            .ok_or_else(|| Error::not_found("album", album_id))?;

        let output = self.archive_path(album_id);
        self.db
            .begin_zip_request(album_id, &output.to_string_lossy())?;

        let job = Job::Zip(ZipJob {
            album_id: album_id.to_string(),
            folder: self.photo_root.join(&album.folder),
            output,
        });
        let key = job.key();
        let mut outcome = self.queue.try_submit(job.clone());
        if outcome == Err(Rejection::Duplicate) && self.queue.wait_released(&key, RELEASE_WAIT) {
            outcome = self.queue.try_submit(job);
        }

        match outcome {
            Ok(()) => {
                tracing::info!(album = %album_id, "Archive requested");
                Ok(true)
            }
            Err(Rejection::Duplicate) => {
                tracing::warn!(album = %album_id, "Previous archive job still holds the queue");
                self.db
                    .restore_zip_status(album_id, album.status, album.error.as_deref())?;
                Err(Error::Conflict(format!(
                    "archive for album '{}' is still being finalized",
                    album_id
                )))
            }
            Err(Rejection::Full) | Err(Rejection::Disconnected) => {
                tracing::warn!(album = %album_id, "Archive job rejected by the queue");
                self.db.fail_zip(album_id, QUEUE_FULL)?;
                Ok(false)
            }
        }
    }

    pub fn status(&self, album_id: &str) -> Result<AlbumZipRecord> {
        self.db
            .get_album(album_id)?
            .ok_or_else(|| Error::not_found("album", album_id))
    }

    /// Deterministic output path of an album's archive.
    ///
    /// The readable part is the album id with anything outside
    /// `[A-Za-z0-9._-]` replaced by `_`; the hash suffix keeps ids that
    /// sanitize to the same string apart.
    pub fn archive_path(&self, album_id: &str) -> PathBuf {
        let readable: String = album_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let readable = readable.trim_matches('.');
        let digest = Sha256::digest(album_id.as_bytes());
        let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        self.archive_dir.join(format!("{}-{}.zip", readable, suffix))
    }
}

/// Run a zip job: `processing`, build, then `done` with the size or
/// `error` with the message. A partial file is removed on failure.
pub(crate) fn run_zip_job(db: &Database, job: &ZipJob) -> Result<()> {
    db.mark_zip_processing(&job.album_id)?;

    match build_zip(&job.folder, &job.output) {
        Ok(size) => {
            db.complete_zip(&job.album_id, &job.output.to_string_lossy(), size)?;
            tracing::info!(album = %job.album_id, size, "Archive built");
        }
        Err(e) => {
            let message = format!("{:#}", e);
            tracing::warn!(album = %job.album_id, error = %message, "Archive failed");
            if job.output.exists() {
                if let Err(e) = std::fs::remove_file(&job.output) {
                    tracing::debug!(path = %job.output.display(), error = %e, "Could not remove partial archive");
                }
            }
            db.fail_zip(&job.album_id, &message)?;
        }
    }
    Ok(())
}

/// Zip every file under `folder` (recursive, sorted by path) into `output`.
/// Returns the archive size in bytes.
fn build_zip(folder: &Path, output: &Path) -> anyhow::Result<u64> {
    if !folder.is_dir() {
        anyhow::bail!("album folder {} does not exist", folder.display());
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.path() == output {
            continue;
        }

        let relative = entry.path().strip_prefix(folder)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        let mut source = BufReader::new(
            File::open(entry.path()).with_context(|| format!("reading {}", entry.path().display()))?,
        );
        std::io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip.finish()?;
    std::io::Write::flush(&mut writer)?;
    drop(writer);

    Ok(std::fs::metadata(output)?.len())
}
