//! Image task records: one row per image, one status triple per task type.

use rusqlite::{params, OptionalExtension, Row};

use super::{now, Database};
use crate::error::{Error, Result};
use crate::scanner::metadata::ImageMetadata;
use crate::tasks::{TaskStatus, TaskType};

/// Status, completion time and last error of one task on one image.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: TaskStatus,
    pub processed_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageTaskRecord {
    pub path: String,
    pub last_modified: i64,
    pub thumbnail: TaskState,
    pub metadata: TaskState,
    pub detection: TaskState,
    pub thumbnail_path: Option<String>,
    pub exif: ImageMetadata,
}

impl ImageTaskRecord {
    /// State of a tracked task; `None` for task types without a status triple.
    pub fn task(&self, task: TaskType) -> Option<&TaskState> {
        match task {
            TaskType::Thumbnail => Some(&self.thumbnail),
            TaskType::Metadata => Some(&self.metadata),
            TaskType::Detection => Some(&self.detection),
            TaskType::Recognition | TaskType::Zip => None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get("path")?,
            last_modified: row.get("last_modified")?,
            thumbnail: TaskState {
                status: row.get("thumbnail_status")?,
                processed_at: row.get("thumbnail_processed_at")?,
                error: row.get("thumbnail_error")?,
            },
            metadata: TaskState {
                status: row.get("metadata_status")?,
                processed_at: row.get("metadata_processed_at")?,
                error: row.get("metadata_error")?,
            },
            detection: TaskState {
                status: row.get("detection_status")?,
                processed_at: row.get("detection_processed_at")?,
                error: row.get("detection_error")?,
            },
            thumbnail_path: row.get("thumbnail_path")?,
            exif: ImageMetadata {
                width: row.get("width")?,
                height: row.get("height")?,
                aperture: row.get("aperture")?,
                shutter_speed: row.get("shutter_speed")?,
                iso: row.get("iso")?,
                focal_length: row.get("focal_length")?,
                lens_make: row.get("lens_make")?,
                lens_model: row.get("lens_model")?,
                camera_make: row.get("camera_make")?,
                camera_model: row.get("camera_model")?,
                taken_at: row.get("taken_at")?,
            },
        })
    }
}

/// Columns of the status triple for a tracked task type.
fn status_columns(task: TaskType) -> Result<&'static str> {
    task.status_columns()
        .ok_or_else(|| Error::not_found("task status", task))
}

impl Database {
    // ========================================================================
    // Record lifecycle
    // ========================================================================

    /// Create a record with every task `pending`. Returns `false` if one
    /// already exists for this path (the existing record is left untouched).
    pub fn create_image(&self, path: &str, last_modified: i64) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO images (path, last_modified) VALUES (?, ?)",
            params![path, last_modified],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_image(&self, path: &str) -> Result<Option<ImageTaskRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT * FROM images WHERE path = ?",
                [path],
                ImageTaskRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All recorded image paths, sorted.
    pub fn list_image_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT path FROM images ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Delete an image record together with its faces and their embeddings.
    pub fn delete_image(&self, path: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM face_embeddings WHERE face_id IN (SELECT id FROM faces WHERE image_path = ?)",
            [path],
        )?;
        tx.execute("DELETE FROM faces WHERE image_path = ?", [path])?;
        tx.execute("DELETE FROM images WHERE path = ?", [path])?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_last_modified(&self, path: &str, last_modified: i64) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE images SET last_modified = ? WHERE path = ?",
            params![last_modified, path],
        )?;
        expect_row(updated, path)
    }

    /// Put every applicable task back to `pending` ahead of a full re-run.
    /// Tasks marked `not_required` stay that way.
    pub fn reset_tasks_for_rerun(&self, path: &str) -> Result<()> {
        let updated = self.conn().execute(
            r#"
            UPDATE images SET
                thumbnail_status = CASE thumbnail_status WHEN 'not_required' THEN 'not_required' ELSE 'pending' END,
                metadata_status = CASE metadata_status WHEN 'not_required' THEN 'not_required' ELSE 'pending' END,
                detection_status = CASE detection_status WHEN 'not_required' THEN 'not_required' ELSE 'pending' END
            WHERE path = ?
            "#,
            [path],
        )?;
        expect_row(updated, path)
    }

    // ========================================================================
    // Task transitions (each one a single UPDATE of that task's columns)
    // ========================================================================

    /// Set a bare status (`pending`, `processing`, `not_required`) and clear
    /// the last error.
    pub fn set_task_status(&self, path: &str, task: TaskType, status: TaskStatus) -> Result<()> {
        let prefix = status_columns(task)?;
        let sql = format!(
            "UPDATE images SET {p}_status = ?, {p}_error = NULL WHERE path = ?",
            p = prefix
        );
        let updated = self.conn().execute(&sql, params![status, path])?;
        expect_row(updated, path)
    }

    pub fn fail_task(&self, path: &str, task: TaskType, error: &str) -> Result<()> {
        let prefix = status_columns(task)?;
        let sql = format!(
            "UPDATE images SET {p}_status = ?, {p}_processed_at = ?, {p}_error = ? WHERE path = ?",
            p = prefix
        );
        let updated = self
            .conn()
            .execute(&sql, params![TaskStatus::Error, now(), error, path])?;
        expect_row(updated, path)
    }

    pub fn complete_thumbnail(&self, path: &str, thumbnail_path: &str) -> Result<()> {
        let updated = self.conn().execute(
            r#"
            UPDATE images SET
                thumbnail_status = ?, thumbnail_processed_at = ?, thumbnail_error = NULL,
                thumbnail_path = ?
            WHERE path = ?
            "#,
            params![TaskStatus::Done, now(), thumbnail_path, path],
        )?;
        expect_row(updated, path)
    }

    pub fn complete_metadata(&self, path: &str, exif: &ImageMetadata) -> Result<()> {
        let updated = self.conn().execute(
            r#"
            UPDATE images SET
                metadata_status = ?, metadata_processed_at = ?, metadata_error = NULL,
                width = ?, height = ?, aperture = ?, shutter_speed = ?, iso = ?,
                focal_length = ?, lens_make = ?, lens_model = ?,
                camera_make = ?, camera_model = ?, taken_at = ?
            WHERE path = ?
            "#,
            params![
                TaskStatus::Done,
                now(),
                exif.width,
                exif.height,
                exif.aperture,
                exif.shutter_speed,
                exif.iso,
                exif.focal_length,
                exif.lens_make,
                exif.lens_model,
                exif.camera_make,
                exif.camera_model,
                exif.taken_at,
                path,
            ],
        )?;
        expect_row(updated, path)
    }
}

fn expect_row(updated: usize, path: &str) -> Result<()> {
    if updated == 0 {
        Err(Error::not_found("image", path))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, DetectedFace};

    #[test]
    fn test_new_record_has_all_tasks_pending() {
        let db = test_db();
        assert!(db.create_image("a/b.jpg", 100).unwrap());

        let record = db.get_image("a/b.jpg").unwrap().unwrap();
        assert_eq!(record.last_modified, 100);
        for task in TaskType::IMAGE_TASKS {
            let state = record.task(task).unwrap();
            assert_eq!(state.status, TaskStatus::Pending);
            assert!(state.processed_at.is_none());
            assert!(state.error.is_none());
        }
    }

    #[test]
    fn test_create_does_not_overwrite() {
        let db = test_db();
        db.create_image("a.jpg", 100).unwrap();
        db.complete_thumbnail("a.jpg", "/cache/a.jpg").unwrap();

        assert!(!db.create_image("a.jpg", 200).unwrap());
        let record = db.get_image("a.jpg").unwrap().unwrap();
        assert_eq!(record.last_modified, 100);
        assert_eq!(record.thumbnail.status, TaskStatus::Done);
    }

    #[test]
    fn test_fail_then_complete_clears_error() {
        let db = test_db();
        db.create_image("a.jpg", 1).unwrap();

        db.set_task_status("a.jpg", TaskType::Thumbnail, TaskStatus::Processing).unwrap();
        db.fail_task("a.jpg", TaskType::Thumbnail, "decoder exploded").unwrap();
        let record = db.get_image("a.jpg").unwrap().unwrap();
        assert_eq!(record.thumbnail.status, TaskStatus::Error);
        assert_eq!(record.thumbnail.error.as_deref(), Some("decoder exploded"));

        db.complete_thumbnail("a.jpg", "/cache/a.jpg").unwrap();
        let record = db.get_image("a.jpg").unwrap().unwrap();
        assert_eq!(record.thumbnail.status, TaskStatus::Done);
        assert!(record.thumbnail.error.is_none());
        assert!(record.thumbnail.processed_at.is_some());
        assert_eq!(record.thumbnail_path.as_deref(), Some("/cache/a.jpg"));
        // Other tasks untouched
        assert_eq!(record.metadata.status, TaskStatus::Pending);
    }

    #[test]
    fn test_complete_metadata_stores_fields() {
        let db = test_db();
        db.create_image("a.jpg", 1).unwrap();
        let exif = ImageMetadata {
            width: Some(4000),
            height: Some(3000),
            aperture: Some(1.8),
            iso: Some(200),
            lens_model: Some("50mm F1.8".to_string()),
            camera_make: Some("Canon".to_string()),
            ..Default::default()
        };

        db.complete_metadata("a.jpg", &exif).unwrap();

        let record = db.get_image("a.jpg").unwrap().unwrap();
        assert_eq!(record.metadata.status, TaskStatus::Done);
        assert_eq!(record.exif, exif);
    }

    #[test]
    fn test_reset_keeps_not_required() {
        let db = test_db();
        db.create_image("a.jpg", 1).unwrap();
        db.complete_thumbnail("a.jpg", "/cache/a.jpg").unwrap();
        db.set_task_status("a.jpg", TaskType::Detection, TaskStatus::NotRequired).unwrap();

        db.reset_tasks_for_rerun("a.jpg").unwrap();

        let record = db.get_image("a.jpg").unwrap().unwrap();
        assert_eq!(record.thumbnail.status, TaskStatus::Pending);
        assert_eq!(record.metadata.status, TaskStatus::Pending);
        assert_eq!(record.detection.status, TaskStatus::NotRequired);
    }

    #[test]
    fn test_untracked_task_and_missing_record() {
        let db = test_db();
        assert!(db
            .set_task_status("missing.jpg", TaskType::Thumbnail, TaskStatus::Processing)
            .unwrap_err()
            .is_not_found());

        db.create_image("a.jpg", 1).unwrap();
        assert!(db
            .set_task_status("a.jpg", TaskType::Zip, TaskStatus::Processing)
            .is_err());
    }

    #[test]
    fn test_delete_image_removes_faces() {
        let db = test_db();
        db.create_image("a.jpg", 1).unwrap();
        db.create_image("b.jpg", 1).unwrap();
        db.reconcile_faces("a.jpg", &[DetectedFace::new(0, 0, 10, 10, 0.9)]).unwrap();
        db.reconcile_faces("b.jpg", &[DetectedFace::new(0, 0, 10, 10, 0.9)]).unwrap();

        db.delete_image("a.jpg").unwrap();

        assert!(db.get_image("a.jpg").unwrap().is_none());
        assert!(db.get_faces_for_image("a.jpg").unwrap().is_empty());
        assert_eq!(db.get_faces_for_image("b.jpg").unwrap().len(), 1);
        assert_eq!(db.list_image_paths().unwrap(), vec!["b.jpg".to_string()]);
    }
}
