//! Execution of one job inside a worker thread.

use anyhow::Context;

use super::{ImageJob, Job, TaskStatus, TaskType, WorkerContext};
use crate::archive;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::faces::crop_face;

/// Run a job to completion, writing its final status.
///
/// Adapter failures end up in the task's status; the returned error is
/// only for failures of the status store itself.
pub(crate) fn execute(ctx: &WorkerContext, job: &Job) -> Result<()> {
    match job {
        Job::Thumbnail(image) => run_tracked(&ctx.db, image, TaskType::Thumbnail, || {
            let thumbnail = ctx.adapters.thumbnails.generate(&image.source)?;
            ctx.db
                .complete_thumbnail(&image.image_path, &thumbnail.to_string_lossy())?;
            Ok(())
        }),
        Job::Metadata(image) => run_tracked(&ctx.db, image, TaskType::Metadata, || {
            let metadata = ctx.adapters.metadata.extract(&image.source)?;
            ctx.db.complete_metadata(&image.image_path, &metadata)?;
            Ok(())
        }),
        Job::Detection(image) => run_tracked(&ctx.db, image, TaskType::Detection, || {
            let bytes = std::fs::read(&image.source)
                .with_context(|| format!("reading {}", image.source.display()))?;
            let detected = ctx.adapters.detector.detect(&bytes)?;
            let inserted = ctx.db.reconcile_faces(&image.image_path, &detected)?;
            tracing::debug!(path = %image.image_path, faces = inserted.len(), "Faces reconciled");

            if !inserted.is_empty() && ctx.adapters.recognizer.is_some() {
                let submitted = ctx.queue.submit(Job::Recognition(image.clone()));
                if !submitted {
                    tracing::debug!(path = %image.image_path, "Recognition not queued, next sync retries");
                }
            }
            Ok(())
        }),
        Job::Recognition(image) => {
            if let Err(e) = run_recognition(ctx, image) {
                tracing::warn!(path = %image.image_path, error = %format!("{:#}", e), "Recognition failed");
            }
            Ok(())
        }
        Job::Zip(zip) => archive::run_zip_job(&ctx.db, zip),
    }
}

/// Drive a tracked task through `processing` to `done` or `error`.
///
/// `work` writes the outputs and `done` itself (in one UPDATE, or in the
/// reconciliation transaction for detection). Any error it returns is
/// recorded as the task's error.
fn run_tracked(
    db: &Database,
    image: &ImageJob,
    task: TaskType,
    work: impl FnOnce() -> anyhow::Result<()>,
) -> Result<()> {
    let span = tracing::info_span!("task", path = %image.image_path, %task, mtime = image.mtime);
    let _enter = span.enter();

    if let Err(e) = db.set_task_status(&image.image_path, task, TaskStatus::Processing) {
        if e.is_not_found() {
            // Record deleted after submission
            tracing::debug!("Image record gone, skipping");
            return Ok(());
        }
        return Err(e);
    }

    match work() {
        Ok(()) => {
            tracing::debug!("Task done");
            Ok(())
        }
        Err(e) => {
            // Store errors keep their own variant; everything else came from an adapter
            let failure = match e.downcast::<Error>() {
                Ok(store) => store,
                Err(adapter) => Error::adapter(adapter),
            };
            let message = failure.to_string();
            tracing::warn!(error = %message, "Task failed");
            db.fail_task(&image.image_path, task, &message)
        }
    }
}

/// Embed every face of the image that has no embedding yet.
fn run_recognition(ctx: &WorkerContext, image: &ImageJob) -> anyhow::Result<()> {
    let recognizer = match &ctx.adapters.recognizer {
        Some(recognizer) => recognizer,
        None => return Ok(()),
    };

    let faces = ctx.db.faces_without_embeddings(&image.image_path)?;
    if faces.is_empty() {
        return Ok(());
    }

    let img = image::ImageReader::open(&image.source)
        .with_context(|| format!("opening {}", image.source.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("decoding {}", image.source.display()))?;

    let mut stored = 0;
    for face in &faces {
        let crop = crop_face(&img, &face.bbox());
        let embedding = recognizer
            .embed(&crop)
            .with_context(|| format!("embedding face {}", face.id))?;
        if ctx.db.store_face_embedding(face.id, &embedding)? {
            stored += 1;
        }
    }

    tracing::debug!(path = %image.image_path, stored, "Face embeddings stored");
    Ok(())
}

/// Record a job whose execution panicked as failed.
pub(crate) fn record_panic(ctx: &WorkerContext, job: &Job, message: &str) {
    let error = format!("worker panicked: {}", message);
    let result = match job {
        Job::Thumbnail(image) | Job::Metadata(image) | Job::Detection(image) => {
            ctx.db
                .fail_task(&image.image_path, job.task_type(), &error)
        }
        Job::Recognition(_) => Ok(()),
        Job::Zip(zip) => ctx.db.fail_zip(&zip.album_id, &error),
    };
    if let Err(e) = result {
        tracing::error!(job = %job.key(), error = %e, "Could not record panic");
    }
}
