//! Vector-index seam and a bundled brute-force implementation.
//!
//! The real deployment talks to an external ANN index; everything here is
//! expressed against the [`VectorIndex`] trait so the store and the
//! suggestion searcher never know which one they got. [`MemoryIndex`] is
//! the reference implementation used by tests and the CLI.

use async_trait::async_trait;
use kindred_core::types::{cosine, PersonId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("query dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// What a stored vector represents. Face vectors are search targets;
/// centroid vectors are stored for other consumers and filtered out of
/// suggestion searches by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Face,
    Centroid,
}

/// Filterable metadata stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPayload {
    pub kind: IndexKind,
    /// Assigned person, `None` for unlabeled faces.
    pub person_id: Option<PersonId>,
    /// Prototype faces are exemplar crops, never suggestion candidates.
    pub is_prototype: bool,
}

/// Payload predicate applied before scoring cutoffs.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub kind: Option<IndexKind>,
    /// Never suggest a person's own faces back to them.
    pub exclude_person: Option<PersonId>,
    pub exclude_prototypes: bool,
    /// Restrict to faces with no assigned person.
    pub unassigned_only: bool,
}

impl SearchFilter {
    pub fn matches(&self, payload: &IndexPayload) -> bool {
        if let Some(kind) = self.kind {
            if payload.kind != kind {
                return false;
            }
        }
        if let Some(person_id) = self.exclude_person {
            if payload.person_id == Some(person_id) {
                return false;
            }
        }
        if self.exclude_prototypes && payload.is_prototype {
            return false;
        }
        if self.unassigned_only && payload.person_id.is_some() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct IndexHit {
    pub key: String,
    pub score: f32,
    pub payload: IndexPayload,
}

/// External vector index: upsert/search/delete with payload filtering.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        payload: IndexPayload,
    ) -> Result<(), IndexError>;

    /// Top `limit` entries by cosine similarity to `query`, restricted to
    /// payloads passing `filter` and scores at or above `score_threshold`.
    /// Ordering must be deterministic for identical contents.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<IndexHit>, IndexError>;

    async fn delete(&self, key: &str) -> Result<(), IndexError>;
}

/// Brute-force in-memory index. Scans every entry per query; fine for the
/// CLI and tests, not a production ANN substitute.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    entries: Arc<RwLock<HashMap<String, (Vec<f32>, IndexPayload)>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("index rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .expect("index rwlock poisoned")
            .contains_key(key)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        payload: IndexPayload,
    ) -> Result<(), IndexError> {
        self.entries
            .write()
            .expect("index rwlock poisoned")
            .insert(key.to_string(), (vector.to_vec(), payload));
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<IndexHit>, IndexError> {
        let entries = self.entries.read().expect("index rwlock poisoned");
        let mut hits: Vec<IndexHit> = entries
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .map(|(key, (vector, payload))| IndexHit {
                key: key.clone(),
                score: cosine(query, vector),
                payload: payload.clone(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();

        // Deterministic: score descending, key ascending on ties.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, key: &str) -> Result<(), IndexError> {
        self.entries
            .write()
            .expect("index rwlock poisoned")
            .remove(key);
        Ok(())
    }
}
