//! End-to-end pipeline tests: library sync, worker pool, reconciliation and
//! tagging working together on a real directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::{tempdir, TempDir};

use crate::adapters::Adapters;
use crate::config::Config;
use crate::db::{test_db, Database};
use crate::faces::SimilarityEngine;
use crate::scanner::LibrarySync;
use crate::tasks::policy::Plan;
use crate::tasks::{JobQueue, TaskStatus, TaskType, WorkerContext, WorkerPool};
use crate::testing::{self, FailingDetector, FixedDetector};

struct Pipeline {
    dir: TempDir,
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    sync: LibrarySync,
}

impl Pipeline {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.library.root = dir.path().to_path_buf();
        let db = Arc::new(test_db());
        let queue = Arc::new(JobQueue::new(64));
        let sync = LibrarySync::new(db.clone(), queue.clone(), &config);
        Self {
            dir,
            db,
            queue,
            sync,
        }
    }

    fn add(&self, relative: &str, mtime: u64) -> PathBuf {
        let path = testing::write_source_image(self.dir.path(), relative);
        set_mtime(&path, mtime);
        path
    }

    /// Sync once and let a pool with `adapters` work the queue dry.
    fn process(&self, adapters: Adapters) {
        let pool = WorkerPool::start(
            2,
            WorkerContext {
                db: self.db.clone(),
                queue: self.queue.clone(),
                adapters,
            },
        )
        .unwrap();
        self.sync.run().unwrap();
        assert!(self.queue.wait_idle(Duration::from_secs(10)));
        pool.shutdown();
    }

    fn corners(&self, path: &str) -> Vec<(i32, i32, i32, i32)> {
        let mut corners: Vec<_> = self
            .db
            .get_faces_for_image(path)
            .unwrap()
            .iter()
            .map(|f| (f.x1, f.y1, f.x2, f.y2))
            .collect();
        corners.sort();
        corners
    }
}

fn set_mtime(path: &Path, secs: u64) {
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_times(std::fs::FileTimes::new().set_modified(time))
        .unwrap();
}

fn with_detector(adapters: Adapters, detector: FixedDetector) -> Adapters {
    Adapters {
        detector: Arc::new(detector),
        ..adapters
    }
}

#[test]
fn test_new_image_is_fully_processed() {
    let pipeline = Pipeline::new();
    let source = pipeline.add("a/b.jpg", 100);

    // Observed before any worker runs: record exists, everything pending
    let observation = pipeline.sync.observe(&source).unwrap();
    assert_eq!(observation.plan, Plan::Create);
    let record = pipeline.db.get_image("a/b.jpg").unwrap().unwrap();
    assert_eq!(record.last_modified, 100);
    for task in TaskType::IMAGE_TASKS {
        assert_eq!(record.task(task).unwrap().status, TaskStatus::Pending);
    }

    pipeline.process(testing::adapters(2));

    let record = pipeline.db.get_image("a/b.jpg").unwrap().unwrap();
    for task in TaskType::IMAGE_TASKS {
        let state = record.task(task).unwrap();
        assert_eq!(state.status, TaskStatus::Done, "{} not done", task);
        assert!(state.processed_at.is_some());
        assert!(state.error.is_none());
    }
    assert_eq!(record.thumbnail_path.as_deref(), Some("/thumbs/b.jpg"));
    assert_eq!(record.exif.camera_make.as_deref(), Some("Canon"));

    let faces = pipeline.db.get_faces_for_image("a/b.jpg").unwrap();
    assert_eq!(faces.len(), 2);
    assert!(faces.iter().all(|f| f.person_id.is_none()));
    assert!(pipeline.db.faces_without_embeddings("a/b.jpg").unwrap().is_empty());
    assert!(pipeline.db.get_album("a").unwrap().is_some());

    // Nothing left to do on the next pass
    assert_eq!(pipeline.sync.observe(&source).unwrap().plan, Plan::UpToDate);
}

#[test]
fn test_rerun_of_detection_is_idempotent() {
    let pipeline = Pipeline::new();
    let source = pipeline.add("a/b.jpg", 100);
    pipeline.process(testing::adapters(3));
    let before = pipeline.corners("a/b.jpg");

    set_mtime(&source, 200);
    pipeline.process(testing::adapters(3));

    assert_eq!(pipeline.corners("a/b.jpg"), before);
    let record = pipeline.db.get_image("a/b.jpg").unwrap().unwrap();
    assert_eq!(record.last_modified, 200);
    assert_eq!(record.detection.status, TaskStatus::Done);
}

#[test]
fn test_tags_survive_redetection() {
    let pipeline = Pipeline::new();
    let source = pipeline.add("a/b.jpg", 100);
    pipeline.process(testing::adapters(2));

    let faces = pipeline.db.get_faces_for_image("a/b.jpg").unwrap();
    let alice = pipeline.db.create_person("Alice").unwrap();
    let engine = SimilarityEngine::new(pipeline.db.clone(), 0.8);

    // Identical embeddings: tagging one propagates to the other
    let propagated = engine.tag_face(faces[0].id, alice).unwrap();
    assert_eq!(propagated, vec![faces[1].id]);
    pipeline.db.untag_face(faces[1].id).unwrap();

    set_mtime(&source, 200);
    let redetect = with_detector(
        testing::adapters(0),
        FixedDetector(vec![testing::face(30, 30, 8, 8)]),
    );
    pipeline.process(redetect);

    let after = pipeline.db.get_faces_for_image("a/b.jpg").unwrap();
    assert_eq!(after.len(), 2);
    let tagged = pipeline.db.get_face(faces[0].id).unwrap().unwrap();
    assert_eq!(tagged.person_id, Some(alice));
    assert_eq!(tagged.bbox(), faces[0].bbox());
    assert!(pipeline.db.get_face_embedding(faces[0].id).unwrap().is_some());
    assert!(pipeline.db.get_face(faces[1].id).unwrap().is_none());
    assert!(after
        .iter()
        .any(|f| f.person_id.is_none() && (f.x1, f.y1, f.x2, f.y2) == (30, 30, 38, 38)));
}

#[test]
fn test_detector_failure_is_recorded_and_retried() {
    let pipeline = Pipeline::new();
    pipeline.add("a/b.jpg", 100);
    pipeline.process(testing::adapters(1));
    let before = pipeline.corners("a/b.jpg");

    // Force a new detection run that fails
    pipeline
        .db
        .set_task_status("a/b.jpg", TaskType::Detection, TaskStatus::Pending)
        .unwrap();
    let failing = Adapters {
        detector: Arc::new(FailingDetector),
        ..testing::adapters(0)
    };
    pipeline.process(failing);

    let record = pipeline.db.get_image("a/b.jpg").unwrap().unwrap();
    assert_eq!(record.detection.status, TaskStatus::Error);
    assert!(record
        .detection
        .error
        .as_deref()
        .unwrap()
        .contains("detector model missing"));
    assert_eq!(record.thumbnail.status, TaskStatus::Done);
    assert_eq!(pipeline.corners("a/b.jpg"), before);

    // The next pass resubmits only the failed task
    pipeline.process(testing::adapters(1));
    let record = pipeline.db.get_image("a/b.jpg").unwrap().unwrap();
    assert_eq!(record.detection.status, TaskStatus::Done);
    assert!(record.detection.error.is_none());
}

#[test]
fn test_unreadable_source_fails_only_its_tasks() {
    let pipeline = Pipeline::new();
    pipeline.add("a/good.jpg", 100);
    let broken = pipeline.dir.path().join("a/broken.jpg");
    std::fs::write(&broken, b"definitely not a jpeg").unwrap();

    let cache = tempdir().unwrap();
    let adapters = Adapters {
        thumbnails: Arc::new(crate::scanner::ImageThumbnailer::new(
            &crate::config::ThumbnailConfig {
                path: cache.path().to_path_buf(),
                size: 32,
            },
        )),
        ..testing::adapters(1)
    };
    pipeline.process(adapters);

    let good = pipeline.db.get_image("a/good.jpg").unwrap().unwrap();
    assert_eq!(good.thumbnail.status, TaskStatus::Done);
    let bad = pipeline.db.get_image("a/broken.jpg").unwrap().unwrap();
    assert_eq!(bad.thumbnail.status, TaskStatus::Error);
    assert!(bad.thumbnail.error.is_some());
    // Every task ended in a settled or error state
    for record in [good, bad] {
        for task in TaskType::IMAGE_TASKS {
            let status = record.task(task).unwrap().status;
            assert!(matches!(status, TaskStatus::Done | TaskStatus::Error));
        }
    }
}
