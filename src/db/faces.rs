//! Faces, people and aliases, plus detection reconciliation.

use rusqlite::{params, OptionalExtension, Row};

use super::{now, Database};
use crate::error::{Error, Result};
use crate::tasks::TaskStatus;

/// Bounding box as produced by a detector, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Boxes with no area cannot be stored.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// `(x1, y1, x2, y2)` corners.
    pub fn corners(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }
}

/// One detector hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl DetectedFace {
    pub fn new(x: i32, y: i32, width: i32, height: i32, confidence: f32) -> Self {
        Self {
            bbox: BoundingBox::new(x, y, width, height),
            confidence,
        }
    }
}

/// A stored face.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub id: i64,
    pub person_id: Option<i64>,
    pub image_path: String,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: Option<f32>,
}

impl Face {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x1, self.y1, self.x2 - self.x1, self.y2 - self.y1)
    }

    pub fn is_tagged(&self) -> bool {
        self.person_id.is_some()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            person_id: row.get("person_id")?,
            image_path: row.get("image_path")?,
            x1: row.get("x1")?,
            y1: row.get("y1")?,
            x2: row.get("x2")?,
            y2: row.get("y2")?,
            confidence: row.get("confidence")?,
        })
    }
}

/// A person with the number of faces tagged with them.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub face_count: i64,
}

impl Person {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            face_count: row.get(2)?,
        })
    }
}

const FACE_COLUMNS: &str = "id, person_id, image_path, x1, y1, x2, y2, confidence";

impl Database {
    // ========================================================================
    // People management
    // ========================================================================

    pub fn create_person(&self, name: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute("INSERT INTO people (name) VALUES (?)", [name])?;
        Ok(conn.last_insert_rowid())
    }

    /// Find a person by name or alias (case-insensitive)
    pub fn find_person_by_name(&self, name: &str) -> Result<Option<Person>> {
        let person = self
            .conn()
            .query_row(
                r#"
                SELECT p.id, p.name, (SELECT COUNT(*) FROM faces f WHERE f.person_id = p.id)
                FROM people p
                WHERE LOWER(p.name) = LOWER(?1)
                   OR EXISTS (
                       SELECT 1 FROM person_aliases a
                       WHERE a.person_id = p.id AND LOWER(a.alias) = LOWER(?1)
                   )
                ORDER BY LOWER(p.name) = LOWER(?1) DESC, p.id
                LIMIT 1
                "#,
                [name],
                Person::from_row,
            )
            .optional()?;
        Ok(person)
    }

    pub fn find_or_create_person(&self, name: &str) -> Result<i64> {
        match self.find_person_by_name(name)? {
            Some(person) => Ok(person.id),
            None => self.create_person(name),
        }
    }

    /// Returns `false` if the person already had this alias.
    pub fn add_alias(&self, person_id: i64, alias: &str) -> Result<bool> {
        if self.get_person(person_id)?.is_none() {
            return Err(Error::not_found("person", person_id));
        }
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO person_aliases (person_id, alias) VALUES (?, ?)",
            params![person_id, alias],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_aliases(&self, person_id: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT alias FROM person_aliases WHERE person_id = ? ORDER BY alias")?;
        let aliases = stmt
            .query_map([person_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(aliases)
    }

    pub fn get_person(&self, person_id: i64) -> Result<Option<Person>> {
        let person = self
            .conn()
            .query_row(
                r#"
                SELECT p.id, p.name, (SELECT COUNT(*) FROM faces f WHERE f.person_id = p.id)
                FROM people p
                WHERE p.id = ?
                "#,
                [person_id],
                Person::from_row,
            )
            .optional()?;
        Ok(person)
    }

    /// All people with face counts, ordered by name.
    pub fn list_people(&self) -> Result<Vec<Person>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.name, COUNT(f.id) AS face_count
            FROM people p
            LEFT JOIN faces f ON f.person_id = p.id
            GROUP BY p.id
            ORDER BY p.name
            "#,
        )?;
        let people = stmt
            .query_map([], Person::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(people)
    }

    /// Delete a person. Their faces become untagged; embeddings are kept.
    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE faces SET person_id = NULL WHERE person_id = ?",
            [person_id],
        )?;
        tx.execute("DELETE FROM person_aliases WHERE person_id = ?", [person_id])?;
        let deleted = tx.execute("DELETE FROM people WHERE id = ?", [person_id])?;
        if deleted == 0 {
            return Err(Error::not_found("person", person_id));
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Face management
    // ========================================================================

    pub fn get_face(&self, face_id: i64) -> Result<Option<Face>> {
        let sql = format!("SELECT {} FROM faces WHERE id = ?", FACE_COLUMNS);
        let face = self
            .conn()
            .query_row(&sql, [face_id], Face::from_row)
            .optional()?;
        Ok(face)
    }

    pub fn get_faces_for_image(&self, image_path: &str) -> Result<Vec<Face>> {
        let sql = format!(
            "SELECT {} FROM faces WHERE image_path = ? ORDER BY id",
            FACE_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let faces = stmt
            .query_map([image_path], Face::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn get_faces_for_person(&self, person_id: i64) -> Result<Vec<Face>> {
        let sql = format!(
            "SELECT {} FROM faces WHERE person_id = ? ORDER BY image_path, id",
            FACE_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let faces = stmt
            .query_map([person_id], Face::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Faces of one image that have no embedding yet.
    pub fn faces_without_embeddings(&self, image_path: &str) -> Result<Vec<Face>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT f.id, f.person_id, f.image_path, f.x1, f.y1, f.x2, f.y2, f.confidence
            FROM faces f
            LEFT JOIN face_embeddings e ON e.face_id = f.id
            WHERE f.image_path = ? AND e.face_id IS NULL
            ORDER BY f.id
            "#,
        )?;
        let faces = stmt
            .query_map([image_path], Face::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Image paths that have at least one face without an embedding.
    pub fn images_missing_embeddings(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT f.image_path
            FROM faces f
            LEFT JOIN face_embeddings e ON e.face_id = f.id
            WHERE e.face_id IS NULL
            ORDER BY f.image_path
            "#,
        )?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Tag a face, replacing any previous tag.
    pub fn assign_face_to_person(&self, face_id: i64, person_id: i64) -> Result<()> {
        if self.get_person(person_id)?.is_none() {
            return Err(Error::not_found("person", person_id));
        }
        let updated = self.conn().execute(
            "UPDATE faces SET person_id = ? WHERE id = ?",
            params![person_id, face_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found("face", face_id));
        }
        Ok(())
    }

    /// Tag a face only if it is still untagged. Returns whether it was written.
    pub fn assign_if_untagged(&self, face_id: i64, person_id: i64) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE faces SET person_id = ? WHERE id = ? AND person_id IS NULL",
            params![person_id, face_id],
        )?;
        Ok(updated > 0)
    }

    pub fn untag_face(&self, face_id: i64) -> Result<()> {
        let updated = self
            .conn()
            .execute("UPDATE faces SET person_id = NULL WHERE id = ?", [face_id])?;
        if updated == 0 {
            return Err(Error::not_found("face", face_id));
        }
        Ok(())
    }

    // ========================================================================
    // Detection reconciliation
    // ========================================================================

    /// Replace the untagged faces of an image with a fresh detection result
    /// and mark detection `done`, all in one transaction.
    ///
    /// Tagged faces are never touched. Boxes with no area are dropped.
    /// Returns the ids of the inserted faces.
    pub fn reconcile_faces(&self, image_path: &str, detected: &[DetectedFace]) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::TransactionFailure)?;

        tx.execute(
            r#"
            DELETE FROM face_embeddings WHERE face_id IN (
                SELECT id FROM faces WHERE image_path = ? AND person_id IS NULL
            )
            "#,
            [image_path],
        )
        .map_err(Error::TransactionFailure)?;
        tx.execute(
            "DELETE FROM faces WHERE image_path = ? AND person_id IS NULL",
            [image_path],
        )
        .map_err(Error::TransactionFailure)?;

        let mut inserted = Vec::with_capacity(detected.len());
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO faces (image_path, x1, y1, x2, y2, confidence)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .map_err(Error::TransactionFailure)?;
            for face in detected.iter().filter(|f| f.bbox.is_valid()) {
                let (x1, y1, x2, y2) = face.bbox.corners();
                stmt.execute(params![image_path, x1, y1, x2, y2, face.confidence])
                    .map_err(Error::TransactionFailure)?;
                inserted.push(tx.last_insert_rowid());
            }
        }

        let updated = tx
            .execute(
                r#"
                UPDATE images SET
                    detection_status = ?, detection_processed_at = ?, detection_error = NULL
                WHERE path = ?
                "#,
                params![TaskStatus::Done, now(), image_path],
            )
            .map_err(Error::TransactionFailure)?;
        if updated == 0 {
            return Err(Error::not_found("image", image_path));
        }

        tx.commit().map_err(Error::TransactionFailure)?;
        Ok(inserted)
    }
}
