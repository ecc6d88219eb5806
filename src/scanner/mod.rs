//! Library sync: walks the photo root, keeps image and album records in
//! step with the files, and submits the jobs the re-submission policy asks
//! for.

pub mod discovery;
pub mod metadata;
pub mod thumbnails;

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::tasks::policy::{self, Plan};
use crate::tasks::{ImageJob, Job, JobQueue, TaskStatus, TaskType};

pub use discovery::discover_images;
pub use metadata::{ExifExtractor, ImageMetadata};
pub use thumbnails::ImageThumbnailer;

/// What one observation of an image did.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub image_path: String,
    pub plan: Plan,
    pub submitted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub scanned: usize,
    pub created: usize,
    pub rerun: usize,
    pub resubmitted: usize,
    pub submitted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub pruned: usize,
    pub albums: usize,
    pub recognition: usize,
}

pub struct LibrarySync {
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    root: PathBuf,
    extensions: Vec<String>,
    detection: bool,
    recognition: bool,
}

impl LibrarySync {
    pub fn new(db: Arc<Database>, queue: Arc<JobQueue>, config: &Config) -> Self {
        Self {
            db,
            queue,
            root: config.library.root.clone(),
            extensions: config.library.image_extensions.clone(),
            detection: config.faces.enabled,
            recognition: config.faces.enabled,
        }
    }

    /// Whether to submit recognition jobs for faces without embeddings.
    pub fn with_recognition(mut self, enabled: bool) -> Self {
        self.recognition = enabled && self.detection;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring one image's record up to date and submit what it needs.
    pub fn observe(&self, source: &Path) -> Result<Observation> {
        let image_path = normalize_path(&self.root, source)?;
        let mtime = modified_secs(source)?;
        let mut record = self.db.get_image(&image_path)?;
        if let Some(existing) = record.as_mut() {
            if !self.detection && existing.detection.status != TaskStatus::NotRequired {
                self.db
                    .set_task_status(&image_path, TaskType::Detection, TaskStatus::NotRequired)?;
                existing.detection.status = TaskStatus::NotRequired;
                existing.detection.error = None;
            }
        }
        let plan = policy::plan(record.as_ref(), mtime);

        let tasks: Vec<TaskType> = match &plan {
            Plan::Create => {
                if self.db.create_image(&image_path, mtime)? && !self.detection {
                    self.db.set_task_status(
                        &image_path,
                        TaskType::Detection,
                        TaskStatus::NotRequired,
                    )?;
                }
                self.applicable_tasks()
            }
            Plan::RerunAll => {
                tracing::info!(path = %image_path, mtime, "Source changed, re-running tasks");
                self.db.reset_tasks_for_rerun(&image_path)?;
                match &record {
                    Some(record) => TaskType::IMAGE_TASKS
                        .into_iter()
                        .filter(|task| {
                            record
                                .task(*task)
                                .map(|s| s.status != TaskStatus::NotRequired)
                                .unwrap_or(false)
                        })
                        .collect(),
                    None => self.applicable_tasks(),
                }
            }
            Plan::Resubmit(tasks) => tasks.clone(),
            Plan::UpToDate => Vec::new(),
        };
        let tasks = tasks
            .into_iter()
            .filter(|task| self.detection || *task != TaskType::Detection);

        let mut submitted = 0;
        let mut rejected = 0;
        for task in tasks {
            let job = ImageJob::new(image_path.clone(), source, mtime);
            match Job::for_image(task, job).map(|job| self.queue.submit(job)) {
                Some(true) => submitted += 1,
                _ => rejected += 1,
            }
        }

        // Only advance the recorded mtime once every re-run is queued, so a
        // rejected task is re-run by the next pass
        if plan == Plan::RerunAll && rejected == 0 {
            self.db.set_last_modified(&image_path, mtime)?;
        }

        Ok(Observation {
            image_path,
            plan,
            submitted,
            rejected,
        })
    }

    /// One full pass over the library.
    pub fn run(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        let mut albums = BTreeSet::new();

        for source in discover_images(&self.root, &self.extensions) {
            report.scanned += 1;
            match self.observe(&source) {
                Ok(observation) => {
                    match observation.plan {
                        Plan::Create => report.created += 1,
                        Plan::RerunAll => report.rerun += 1,
                        Plan::Resubmit(_) => report.resubmitted += 1,
                        Plan::UpToDate => {}
                    }
                    report.submitted += observation.submitted;
                    report.rejected += observation.rejected;
                    if let Some(album) = album_of(&observation.image_path) {
                        albums.insert(album.to_string());
                    }
                    seen.insert(observation.image_path);
                }
                Err(e) => {
                    tracing::warn!(path = %source.display(), error = %e, "Could not sync image");
                    report.failed += 1;
                }
            }
        }

        for album in &albums {
            self.db.ensure_album(album, album)?;
        }
        report.albums = albums.len();

        for path in self.db.list_image_paths()? {
            if !seen.contains(&path) && !self.root.join(&path).exists() {
                tracing::info!(path = %path, "Source removed, deleting record");
                self.db.delete_image(&path)?;
                report.pruned += 1;
            }
        }

        if self.recognition {
            report.recognition = self.submit_recognition()?;
        }

        tracing::info!(
            scanned = report.scanned,
            created = report.created,
            rerun = report.rerun,
            submitted = report.submitted,
            rejected = report.rejected,
            pruned = report.pruned,
            "Library sync finished"
        );
        Ok(report)
    }

    /// Queue recognition for images whose faces lack embeddings.
    fn submit_recognition(&self) -> Result<usize> {
        let mut submitted = 0;
        for path in self.db.images_missing_embeddings()? {
            let mtime = match self.db.get_image(&path)? {
                Some(record) => record.last_modified,
                None => continue,
            };
            let job = ImageJob::new(path.clone(), self.root.join(&path), mtime);
            if self.queue.submit(Job::Recognition(job)) {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    fn applicable_tasks(&self) -> Vec<TaskType> {
        TaskType::IMAGE_TASKS
            .into_iter()
            .filter(|task| self.detection || *task != TaskType::Detection)
            .collect()
    }
}

/// Record key of a file under `root`: relative, `/`-separated, without `.`
/// components. Paths outside the root or containing `..` are rejected.
pub fn normalize_path(root: &Path, source: &Path) -> Result<String> {
    let relative = source.strip_prefix(root).map_err(|_| Error::InvalidPath {
        path: source.to_path_buf(),
        reason: "outside the library root",
    })?;
    normalize_relative(relative)
}

/// Normalize an already-relative path the same way as [`normalize_path`].
pub fn normalize_relative(relative: &Path) -> Result<String> {
    let invalid = |reason| Error::InvalidPath {
        path: relative.to_path_buf(),
        reason,
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or_else(|| invalid("not valid UTF-8"))?)
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("contains '..'")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
        }
    }

    if parts.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(parts.join("/"))
}

/// Album of an image: its directory relative to the root. Images directly
/// in the root belong to no album.
pub fn album_of(image_path: &str) -> Option<&str> {
    image_path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Modification time in whole seconds since the epoch.
fn modified_secs(source: &Path) -> Result<i64> {
    let modified = std::fs::metadata(source)?.modified()?;
    Ok(chrono::DateTime::<chrono::Utc>::from(modified).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::tasks::{JobKey, JobTarget};
    use crate::testing;
    use std::fs::{File, FileTimes};
    use std::time::{Duration, SystemTime};
    use tempfile::{tempdir, TempDir};

    struct Library {
        dir: TempDir,
        db: Arc<Database>,
        queue: Arc<JobQueue>,
        sync: LibrarySync,
    }

    impl Library {
        fn root(&self) -> PathBuf {
            self.dir.path().to_path_buf()
        }

        fn add(&self, relative: &str, mtime: u64) -> PathBuf {
            let path = testing::write_source_image(self.dir.path(), relative);
            set_mtime(&path, mtime);
            path
        }

        /// Drop queued jobs as if workers had picked them up and finished.
        fn drain(&self) {
            self.queue.abandon_queued();
        }
    }

    fn library(capacity: usize, faces: bool) -> Library {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.library.root = dir.path().to_path_buf();
        config.faces.enabled = faces;
        let db = Arc::new(test_db());
        let queue = Arc::new(JobQueue::new(capacity));
        let sync = LibrarySync::new(db.clone(), queue.clone(), &config);
        Library {
            dir,
            db,
            queue,
            sync,
        }
    }

    fn set_mtime(path: &Path, secs: u64) {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(time))
            .unwrap();
    }

    #[test]
    fn test_normalize_path() {
        let root = Path::new("/photos");
        assert_eq!(normalize_path(root, Path::new("/photos/a/b.jpg")).unwrap(), "a/b.jpg");
        assert_eq!(normalize_path(root, Path::new("/photos/./a//b.jpg")).unwrap(), "a/b.jpg");
        assert!(normalize_path(root, Path::new("/elsewhere/b.jpg")).is_err());
        assert!(normalize_path(root, Path::new("/photos/a/../../etc/passwd")).is_err());
        assert!(normalize_path(root, Path::new("/photos")).is_err());

        assert_eq!(normalize_relative(Path::new("./a/./b.jpg")).unwrap(), "a/b.jpg");
        assert!(matches!(
            normalize_relative(Path::new("../b.jpg")),
            Err(Error::InvalidPath { .. })
        ));
        assert!(normalize_relative(Path::new("/a/b.jpg")).is_err());
    }

    #[test]
    fn test_album_of() {
        assert_eq!(album_of("a/b.jpg"), Some("a"));
        assert_eq!(album_of("trips/2024/x.jpg"), Some("trips/2024"));
        assert_eq!(album_of("root.jpg"), None);
    }

    #[test]
    fn test_first_observation_creates_record_and_submits_all() {
        let lib = library(16, true);
        let source = lib.add("a/b.jpg", 100);

        let observation = lib.sync.observe(&source).unwrap();

        assert_eq!(observation.image_path, "a/b.jpg");
        assert_eq!(observation.plan, Plan::Create);
        assert_eq!(observation.submitted, 3);
        let record = lib.db.get_image("a/b.jpg").unwrap().unwrap();
        assert_eq!(record.last_modified, 100);
        for task in TaskType::IMAGE_TASKS {
            assert_eq!(record.task(task).unwrap().status, TaskStatus::Pending);
        }
        assert_eq!(lib.queue.in_flight(), 3);
    }

    #[test]
    fn test_repeat_observation_is_deduplicated() {
        let lib = library(16, true);
        let source = lib.add("a/b.jpg", 100);
        lib.sync.observe(&source).unwrap();

        let again = lib.sync.observe(&source).unwrap();

        assert_eq!(again.plan, Plan::Resubmit(TaskType::IMAGE_TASKS.to_vec()));
        assert_eq!(again.submitted, 0);
        assert_eq!(again.rejected, 3);
        assert_eq!(lib.queue.in_flight(), 3);
    }

    #[test]
    fn test_newer_source_reruns_and_advances_mtime() {
        let lib = library(16, true);
        let source = lib.add("a/b.jpg", 100);
        lib.sync.observe(&source).unwrap();
        lib.drain();
        lib.db.complete_thumbnail("a/b.jpg", "/thumbs/b.jpg").unwrap();

        set_mtime(&source, 200);
        let observation = lib.sync.observe(&source).unwrap();

        assert_eq!(observation.plan, Plan::RerunAll);
        assert_eq!(observation.submitted, 3);
        let record = lib.db.get_image("a/b.jpg").unwrap().unwrap();
        assert_eq!(record.last_modified, 200);
        assert_eq!(record.thumbnail.status, TaskStatus::Pending);
    }

    #[test]
    fn test_rejected_rerun_keeps_old_mtime() {
        let lib = library(2, true);
        let source = lib.add("a/b.jpg", 100);
        lib.sync.observe(&source).unwrap();
        lib.drain();

        set_mtime(&source, 200);
        let observation = lib.sync.observe(&source).unwrap();

        assert_eq!(observation.submitted, 2);
        assert_eq!(observation.rejected, 1);
        assert_eq!(lib.db.get_image("a/b.jpg").unwrap().unwrap().last_modified, 100);

        lib.drain();
        let retry = lib.sync.observe(&source).unwrap();
        assert_eq!(retry.plan, Plan::RerunAll);
    }

    #[test]
    fn test_detection_disabled_is_not_required() {
        let lib = library(16, false);
        let source = lib.add("b.jpg", 100);

        let observation = lib.sync.observe(&source).unwrap();

        assert_eq!(observation.submitted, 2);
        let record = lib.db.get_image("b.jpg").unwrap().unwrap();
        assert_eq!(record.detection.status, TaskStatus::NotRequired);
    }

    #[test]
    fn test_disabling_faces_retires_existing_detection() {
        let lib = library(16, true);
        let pending = lib.add("a/pending.jpg", 100);
        let failed = lib.add("a/failed.jpg", 100);
        let done = lib.add("a/done.jpg", 100);
        for source in [&pending, &failed, &done] {
            lib.sync.observe(source).unwrap();
        }
        lib.drain();
        lib.db
            .fail_task("a/failed.jpg", TaskType::Detection, "model missing")
            .unwrap();
        lib.db.reconcile_faces("a/done.jpg", &[]).unwrap();

        let sync = LibrarySync::new(lib.db.clone(), lib.queue.clone(), &{
            let mut config = Config::default();
            config.library.root = lib.root();
            config.faces.enabled = false;
            config
        });

        // Pending and failed detection is retired instead of resubmitted
        for source in [&pending, &failed] {
            let observation = sync.observe(source).unwrap();
            assert_eq!(
                observation.plan,
                Plan::Resubmit(vec![TaskType::Thumbnail, TaskType::Metadata])
            );
            assert_eq!(observation.submitted, 2);
        }
        lib.drain();

        // A changed source re-runs everything except detection
        set_mtime(&done, 200);
        let observation = sync.observe(&done).unwrap();
        assert_eq!(observation.plan, Plan::RerunAll);
        assert_eq!(observation.submitted, 2);
        assert_eq!(observation.rejected, 0);

        assert!(!lib.queue.contains(&JobKey {
            target: JobTarget::Image("a/done.jpg".to_string()),
            task: TaskType::Detection,
        }));
        for path in ["a/pending.jpg", "a/failed.jpg", "a/done.jpg"] {
            let record = lib.db.get_image(path).unwrap().unwrap();
            assert_eq!(record.detection.status, TaskStatus::NotRequired);
            assert!(record.detection.error.is_none());
        }
    }

    #[test]
    fn test_run_registers_albums_and_prunes() {
        let lib = library(64, true);
        lib.add("a/b.jpg", 100);
        lib.add("a/c.jpg", 100);
        lib.add("trips/2024/d.jpg", 100);
        lib.add("top.jpg", 100);
        std::fs::write(lib.root().join("a/notes.txt"), b"x").unwrap();

        let report = lib.sync.run().unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.created, 4);
        assert_eq!(report.albums, 2);
        assert!(lib.db.get_album("a").unwrap().is_some());
        assert!(lib.db.get_album("trips/2024").unwrap().is_some());
        assert!(lib.db.get_album("trips").unwrap().is_none());

        lib.drain();
        std::fs::remove_file(lib.root().join("a/c.jpg")).unwrap();
        let report = lib.sync.run().unwrap();
        assert_eq!(report.pruned, 1);
        assert!(lib.db.get_image("a/c.jpg").unwrap().is_none());
        assert_eq!(lib.db.list_image_paths().unwrap().len(), 3);
    }

    #[test]
    fn test_run_submits_recognition_for_missing_embeddings() {
        let lib = library(64, true);
        lib.add("a/b.jpg", 100);
        lib.sync.run().unwrap();
        lib.drain();
        lib.db
            .reconcile_faces("a/b.jpg", &[testing::face(0, 0, 10, 10)])
            .unwrap();

        let report = lib.sync.run().unwrap();
        assert_eq!(report.recognition, 1);

        let disabled = LibrarySync::new(lib.db.clone(), lib.queue.clone(), &{
            let mut config = Config::default();
            config.library.root = lib.root();
            config
        })
        .with_recognition(false);
        lib.drain();
        assert_eq!(disabled.run().unwrap().recognition, 0);
    }
}
