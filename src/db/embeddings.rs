//! Face embedding storage.

use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::Result;

/// Embedding of one face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub face_id: i64,
    pub embedding: Vec<f32>,
}

/// Embedding together with the current tag of its face, as scanned by the
/// similarity engine.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub face_id: i64,
    pub person_id: Option<i64>,
    pub embedding: Vec<f32>,
}

/// Which faces an embedding scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingScope {
    All,
    Tagged,
    Untagged,
}

impl EmbeddingScope {
    fn filter(self) -> &'static str {
        match self {
            EmbeddingScope::All => "",
            EmbeddingScope::Tagged => "WHERE f.person_id IS NOT NULL",
            EmbeddingScope::Untagged => "WHERE f.person_id IS NULL",
        }
    }
}

impl Database {
    /// Store the embedding of a face. Embeddings are written once; returns
    /// `false` if the face already had one.
    pub fn store_face_embedding(&self, face_id: i64, embedding: &[f32]) -> Result<bool> {
        let inserted = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO face_embeddings (face_id, embedding, embedding_dim)
            VALUES (?, ?, ?)
            "#,
            params![face_id, embedding_to_bytes(embedding), embedding.len() as i64],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_face_embedding(&self, face_id: i64) -> Result<Option<FaceEmbedding>> {
        let embedding = self
            .conn()
            .query_row(
                "SELECT face_id, embedding FROM face_embeddings WHERE face_id = ?",
                [face_id],
                |row| {
                    let bytes: Vec<u8> = row.get(1)?;
                    Ok(FaceEmbedding {
                        face_id: row.get(0)?,
                        embedding: bytes_to_embedding(&bytes),
                    })
                },
            )
            .optional()?;
        Ok(embedding)
    }

    /// Snapshot of stored embeddings joined with the faces' current tags.
    pub fn embeddings(&self, scope: EmbeddingScope) -> Result<Vec<StoredEmbedding>> {
        let sql = format!(
            r#"
            SELECT f.id, f.person_id, e.embedding
            FROM face_embeddings e
            JOIN faces f ON f.id = e.face_id
            {}
            ORDER BY f.id
            "#,
            scope.filter()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(2)?;
                Ok(StoredEmbedding {
                    face_id: row.get(0)?,
                    person_id: row.get(1)?,
                    embedding: bytes_to_embedding(&bytes),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Convert f32 slice to little-endian bytes for storage
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Convert bytes back to f32 vector. Trailing bytes that do not form a full
/// value are ignored.
fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity of two vectors; 0 for mismatched lengths or zero norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
