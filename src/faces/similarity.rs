//! Brute-force nearest-neighbour search over face embeddings, person
//! suggestion, and one-level auto-tag propagation.

use rayon::prelude::*;
use std::sync::Arc;

use crate::config::FaceConfig;
use crate::db::{cosine_similarity, Database, EmbeddingScope, StoredEmbedding};
use crate::error::{Error, Result};

/// A face ranked by similarity to a query face.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarFace {
    pub face_id: i64,
    pub person_id: Option<i64>,
    pub similarity: f32,
}

/// Best-matching person for a face, if any tagged face is close enough.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonSuggestion {
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub confidence: f32,
}

impl PersonSuggestion {
    fn none(confidence: f32) -> Self {
        Self {
            person_id: None,
            person_name: None,
            confidence,
        }
    }
}

pub struct SimilarityEngine {
    db: Arc<Database>,
    threshold: f32,
}

impl SimilarityEngine {
    pub fn new(db: Arc<Database>, threshold: f32) -> Self {
        Self { db, threshold }
    }

    /// Engine using the configured similarity threshold.
    pub fn from_config(db: Arc<Database>, config: &FaceConfig) -> Self {
        Self::new(db, config.similarity_threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// The `k` faces most similar to `face_id`, best first. The face itself
    /// is never part of the result.
    pub fn find_similar(&self, face_id: i64, k: usize) -> Result<Vec<SimilarFace>> {
        let query = self.query_embedding(face_id)?;
        let candidates = self.db.embeddings(EmbeddingScope::All)?;

        let mut ranked = rank(&query, face_id, &candidates);
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Suggest a person from the closest tagged face. Returns no person when
    /// the best score does not exceed the threshold.
    pub fn suggest_person(&self, face_id: i64) -> Result<PersonSuggestion> {
        let query = self.query_embedding(face_id)?;
        let tagged = self.db.embeddings(EmbeddingScope::Tagged)?;

        let best = match rank(&query, face_id, &tagged).into_iter().next() {
            Some(best) => best,
            None => return Ok(PersonSuggestion::none(0.0)),
        };
        if best.similarity <= self.threshold {
            return Ok(PersonSuggestion::none(best.similarity));
        }

        // The person may have been deleted since the scan
        let person = match best.person_id {
            Some(person_id) => self.db.get_person(person_id)?,
            None => None,
        };
        Ok(match person {
            Some(person) => PersonSuggestion {
                person_id: Some(person.id),
                person_name: Some(person.name),
                confidence: best.similarity,
            },
            None => PersonSuggestion::none(best.similarity),
        })
    }

    /// Tag a face, then tag every untagged face whose embedding is above the
    /// threshold relative to it. Propagated faces do not propagate further.
    ///
    /// Returns the ids of the faces tagged by propagation. A face without an
    /// embedding is tagged without propagation.
    pub fn tag_face(&self, face_id: i64, person_id: i64) -> Result<Vec<i64>> {
        self.db.assign_face_to_person(face_id, person_id)?;

        let query = match self.db.get_face_embedding(face_id)? {
            Some(stored) => stored.embedding,
            None => {
                tracing::debug!(face_id, "Tagged face has no embedding, skipping propagation");
                return Ok(Vec::new());
            }
        };

        let untagged = self.db.embeddings(EmbeddingScope::Untagged)?;
        let matches: Vec<i64> = rank(&query, face_id, &untagged)
            .into_iter()
            .filter(|m| m.similarity > self.threshold)
            .map(|m| m.face_id)
            .collect();

        let mut propagated = Vec::with_capacity(matches.len());
        for candidate in matches {
            // Skips faces tagged by someone else since the scan
            if self.db.assign_if_untagged(candidate, person_id)? {
                propagated.push(candidate);
            }
        }

        if !propagated.is_empty() {
            tracing::info!(face_id, person_id, count = propagated.len(), "Auto-tagged similar faces");
        }
        Ok(propagated)
    }

    fn query_embedding(&self, face_id: i64) -> Result<Vec<f32>> {
        self.db
            .get_face_embedding(face_id)?
            .map(|stored| stored.embedding)
            .ok_or_else(|| Error::not_found("face embedding", face_id))
    }
}

/// Score every candidate except `exclude` against `query`, best first.
fn rank(query: &[f32], exclude: i64, candidates: &[StoredEmbedding]) -> Vec<SimilarFace> {
    let mut scored: Vec<SimilarFace> = candidates
        .par_iter()
        .filter(|c| c.face_id != exclude)
        .map(|c| {
            // A broken vector ranks last instead of poisoning the order
            let similarity = cosine_similarity(query, &c.embedding);
            SimilarFace {
                face_id: c.face_id,
                person_id: c.person_id,
                similarity: if similarity.is_finite() {
                    similarity
                } else {
                    f32::NEG_INFINITY
                },
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.face_id.cmp(&b.face_id))
    });
    scored
}
