//! Album archive records.

use rusqlite::{params, OptionalExtension, Row};

use super::{now, Database};
use crate::error::{Error, Result};
use crate::tasks::TaskStatus;

#[derive(Debug, Clone)]
pub struct AlbumZipRecord {
    pub album_id: String,
    /// Album folder relative to the library root.
    pub folder: String,
    pub status: TaskStatus,
    pub path: Option<String>,
    pub size: Option<u64>,
    pub error: Option<String>,
    pub last_requested_at: Option<String>,
    pub last_generated_at: Option<String>,
}

impl AlbumZipRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            album_id: row.get("id")?,
            folder: row.get("folder")?,
            status: row.get("zip_status")?,
            path: row.get("zip_path")?,
            size: row.get("zip_size")?,
            error: row.get("zip_error")?,
            last_requested_at: row.get("last_requested_at")?,
            last_generated_at: row.get("last_generated_at")?,
        })
    }
}

impl Database {
    /// Register an album (archive status `not_required`), or update the
    /// folder of an existing one.
    pub fn ensure_album(&self, album_id: &str, folder: &str) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO albums (id, folder) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET folder = excluded.folder
            "#,
            params![album_id, folder],
        )?;
        Ok(())
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<AlbumZipRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT * FROM albums WHERE id = ?",
                [album_id],
                AlbumZipRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Move an album to `pending` for a new archive build.
    ///
    /// The status check and the write are one UPDATE, so two concurrent
    /// requests cannot both succeed. Fails with `Conflict` while a build is
    /// `pending` or `processing`, and `NotFound` for an unknown album.
    pub fn begin_zip_request(&self, album_id: &str, output_path: &str) -> Result<()> {
        let conn = self.conn();
        let updated = conn.execute(
            r#"
            UPDATE albums SET
                zip_status = ?, zip_path = ?, zip_error = NULL, last_requested_at = ?
            WHERE id = ? AND zip_status NOT IN ('pending', 'processing')
            "#,
            params![TaskStatus::Pending, output_path, now(), album_id],
        )?;
        if updated > 0 {
            return Ok(());
        }

        let status: Option<TaskStatus> = conn
            .query_row("SELECT zip_status FROM albums WHERE id = ?", [album_id], |row| {
                row.get(0)
            })
            .optional()?;
        match status {
            Some(status) => Err(Error::Conflict(format!(
                "archive for album '{}' is already {}",
                album_id, status
            ))),
            None => Err(Error::not_found("album", album_id)),
        }
    }

    /// Put back the status and error an album had before a request whose
    /// job never reached the queue. Only touches a record still `pending`.
    pub fn restore_zip_status(
        &self,
        album_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE albums SET zip_status = ?, zip_error = ? WHERE id = ? AND zip_status = ?",
            params![status, error, album_id, TaskStatus::Pending],
        )?;
        Ok(())
    }

    pub fn mark_zip_processing(&self, album_id: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE albums SET zip_status = ? WHERE id = ?",
            params![TaskStatus::Processing, album_id],
        )?;
        expect_album(updated, album_id)
    }

    pub fn complete_zip(&self, album_id: &str, path: &str, size: u64) -> Result<()> {
        let updated = self.conn().execute(
            r#"
            UPDATE albums SET
                zip_status = ?, zip_path = ?, zip_size = ?, zip_error = NULL,
                last_generated_at = ?
            WHERE id = ?
            "#,
            params![TaskStatus::Done, path, size, now(), album_id],
        )?;
        expect_album(updated, album_id)
    }

    pub fn fail_zip(&self, album_id: &str, error: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE albums SET zip_status = ?, zip_error = ? WHERE id = ?",
            params![TaskStatus::Error, error, album_id],
        )?;
        expect_album(updated, album_id)
    }
}

fn expect_album(updated: usize, album_id: &str) -> Result<()> {
    if updated == 0 {
        Err(Error::not_found("album", album_id))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_new_album_not_required() {
        let db = test_db();
        db.ensure_album("trips/2024", "trips/2024").unwrap();

        let album = db.get_album("trips/2024").unwrap().unwrap();
        assert_eq!(album.status, TaskStatus::NotRequired);
        assert!(album.path.is_none());
        assert!(album.last_requested_at.is_none());
    }

    #[test]
    fn test_ensure_album_keeps_status() {
        let db = test_db();
        db.ensure_album("x", "x").unwrap();
        db.begin_zip_request("x", "/zips/x.zip").unwrap();

        db.ensure_album("x", "renamed/x").unwrap();

        let album = db.get_album("x").unwrap().unwrap();
        assert_eq!(album.status, TaskStatus::Pending);
        assert_eq!(album.folder, "renamed/x");
    }

    #[test]
    fn test_request_while_in_flight_conflicts() {
        let db = test_db();
        db.ensure_album("x", "x").unwrap();

        db.begin_zip_request("x", "/zips/x.zip").unwrap();
        assert!(matches!(
            db.begin_zip_request("x", "/zips/x.zip"),
            Err(Error::Conflict(_))
        ));

        db.mark_zip_processing("x").unwrap();
        assert!(matches!(
            db.begin_zip_request("x", "/zips/x.zip"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_request_allowed_again_after_done_or_error() {
        let db = test_db();
        db.ensure_album("x", "x").unwrap();

        db.begin_zip_request("x", "/zips/x.zip").unwrap();
        db.mark_zip_processing("x").unwrap();
        db.complete_zip("x", "/zips/x.zip", 1234).unwrap();

        let album = db.get_album("x").unwrap().unwrap();
        assert_eq!(album.status, TaskStatus::Done);
        assert_eq!(album.size, Some(1234));
        assert!(album.last_generated_at.is_some());

        db.begin_zip_request("x", "/zips/x.zip").unwrap();
        db.mark_zip_processing("x").unwrap();
        db.fail_zip("x", "disk full").unwrap();
        let album = db.get_album("x").unwrap().unwrap();
        assert_eq!(album.status, TaskStatus::Error);
        assert_eq!(album.error.as_deref(), Some("disk full"));

        db.begin_zip_request("x", "/zips/x.zip").unwrap();
        let album = db.get_album("x").unwrap().unwrap();
        assert_eq!(album.status, TaskStatus::Pending);
        assert!(album.error.is_none());
    }

    #[test]
    fn test_unknown_album() {
        let db = test_db();
        assert!(db
            .begin_zip_request("nope", "/zips/nope.zip")
            .unwrap_err()
            .is_not_found());
    }
}
