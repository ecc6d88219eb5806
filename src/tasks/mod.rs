//! Job model, queue and worker pool.
//!
//! A job names one task type against one target (an image path or an album
//! id). The queue admits at most one in-flight job per `(target, task type)`
//! and rejects instead of blocking when it is full; workers drive the task
//! status columns through `pending -> processing -> done | error`.

pub mod policy;
pub mod pool;
pub mod queue;
mod runner;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;
use std::path::PathBuf;

pub use pool::{WorkerContext, WorkerPool};
pub use queue::{JobQueue, Rejection};

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Thumbnail,
    Metadata,
    Detection,
    /// Embeds detected faces. Not tracked by a status triple.
    Recognition,
    Zip,
}

impl TaskType {
    /// Tasks with a status triple on every image record.
    pub const IMAGE_TASKS: [TaskType; 3] =
        [TaskType::Thumbnail, TaskType::Metadata, TaskType::Detection];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Thumbnail => "thumbnail",
            TaskType::Metadata => "metadata",
            TaskType::Detection => "detection",
            TaskType::Recognition => "recognition",
            TaskType::Zip => "zip",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "thumbnail" => Some(TaskType::Thumbnail),
            "metadata" => Some(TaskType::Metadata),
            "detection" => Some(TaskType::Detection),
            "recognition" => Some(TaskType::Recognition),
            "zip" => Some(TaskType::Zip),
            _ => None,
        }
    }

    /// Column prefix of the status triple on `images`, if the task has one.
    pub(crate) fn status_columns(&self) -> Option<&'static str> {
        match self {
            TaskType::Thumbnail => Some("thumbnail"),
            TaskType::Metadata => Some("metadata"),
            TaskType::Detection => Some("detection"),
            TaskType::Recognition | TaskType::Zip => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one task on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Error,
    NotRequired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::NotRequired => "not_required",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "done" => Some(TaskStatus::Done),
            "error" => Some(TaskStatus::Error),
            "not_required" => Some(TaskStatus::NotRequired),
            _ => None,
        }
    }

    /// Nothing left to do unless the source changes.
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::NotRequired)
    }

    /// A job for this task is queued or running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TaskStatus::from_str(s).ok_or_else(|| {
            FromSqlError::Other(format!("unknown task status '{}'", s).into())
        })
    }
}

/// The entity a job works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobTarget {
    /// Normalized relative image path.
    Image(String),
    /// Album id.
    Album(String),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Image(path) => write!(f, "image:{}", path),
            JobTarget::Album(id) => write!(f, "album:{}", id),
        }
    }
}

/// Dedup key: at most one job per key is queued or executing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub target: JobTarget,
    pub task: TaskType,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.task)
    }
}

/// Everything a worker needs to run an image task without further lookups.
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub image_path: String,
    pub source: PathBuf,
    /// Source mtime (seconds) recorded when the job was submitted.
    pub mtime: i64,
}

impl ImageJob {
    pub fn new(image_path: impl Into<String>, source: impl Into<PathBuf>, mtime: i64) -> Self {
        Self {
            image_path: image_path.into(),
            source: source.into(),
            mtime,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZipJob {
    pub album_id: String,
    pub folder: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub enum Job {
    Thumbnail(ImageJob),
    Metadata(ImageJob),
    Detection(ImageJob),
    Recognition(ImageJob),
    Zip(ZipJob),
}

impl Job {
    /// Build the job for one of the per-image task types.
    pub fn for_image(task: TaskType, job: ImageJob) -> Option<Job> {
        match task {
            TaskType::Thumbnail => Some(Job::Thumbnail(job)),
            TaskType::Metadata => Some(Job::Metadata(job)),
            TaskType::Detection => Some(Job::Detection(job)),
            TaskType::Recognition => Some(Job::Recognition(job)),
            TaskType::Zip => None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Job::Thumbnail(_) => TaskType::Thumbnail,
            Job::Metadata(_) => TaskType::Metadata,
            Job::Detection(_) => TaskType::Detection,
            Job::Recognition(_) => TaskType::Recognition,
            Job::Zip(_) => TaskType::Zip,
        }
    }

    pub fn target(&self) -> JobTarget {
        match self {
            Job::Thumbnail(j) | Job::Metadata(j) | Job::Detection(j) | Job::Recognition(j) => {
                JobTarget::Image(j.image_path.clone())
            }
            Job::Zip(z) => JobTarget::Album(z.album_id.clone()),
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            target: self.target(),
            task: self.task_type(),
        }
    }
}
