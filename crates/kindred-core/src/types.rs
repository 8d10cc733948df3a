use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type PersonId = Uuid;
pub type FaceId = Uuid;

/// A labeled, unit-norm face embedding (typically 512-dimensional for ArcFace).
///
/// Immutable once created: the vector is produced by the embedding model and
/// never rewritten. Callers are responsible for L2-normalizing before handing
/// embeddings to the centroid computer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub face_id: FaceId,
    pub vector: Vec<f32>,
}

impl FaceEmbedding {
    /// Cosine similarity to another embedding. For unit vectors this is the
    /// dot product; the full form is kept so non-normalized probes degrade
    /// gracefully instead of silently mis-scoring.
    pub fn similarity(&self, other: &[f32]) -> f32 {
        cosine(&self.vector, other)
    }
}

/// Cosine similarity between two vectors, in [-1, 1]. Zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// Whether a centroid aggregates the whole face set or one appearance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentroidType {
    Global,
    Cluster,
}

impl CentroidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Cluster => "cluster",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TypeParseError> {
        match value {
            "global" => Ok(Self::Global),
            "cluster" => Ok(Self::Cluster),
            _ => Err(TypeParseError::CentroidType(value.to_string())),
        }
    }
}

/// Lifecycle state of a stored centroid record.
///
/// `Building → Active` on success, `Building → Failed` on computation error
/// (terminal). `Active → Deprecated` when a newer rebuild supersedes it;
/// deprecated records are retained for audit, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentroidStatus {
    Building,
    Active,
    Deprecated,
    Failed,
}

impl CentroidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TypeParseError> {
        match value {
            "building" => Ok(Self::Building),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            "failed" => Ok(Self::Failed),
            _ => Err(TypeParseError::Status(value.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum TypeParseError {
    #[error("unknown centroid status: {0}")]
    Status(String),
    #[error("unknown centroid type: {0}")]
    CentroidType(String),
}

/// A derived representative embedding for a person.
///
/// Invariants: `vector` is unit-norm (±ε) for `active` records; at most one
/// `active` record exists per `(person_id, model_version, centroid_version,
/// centroid_type, cluster_label)`; `source_hash` changes iff the contributing
/// face-ID set changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonCentroid {
    pub id: Uuid,
    pub person_id: PersonId,
    /// Embedding model that produced the contributing vectors (e.g. "w600k_r50").
    pub model_version: String,
    /// Aggregation algorithm version; bumped when the trimming/clustering
    /// policy changes so old records read as stale.
    pub centroid_version: u32,
    pub centroid_type: CentroidType,
    /// `"global"` or `"k{K}_{i}"` for cluster centroids.
    pub cluster_label: String,
    pub vector: Vec<f32>,
    pub n_faces: usize,
    /// Truncated content hash of the sorted contributing face IDs.
    pub source_hash: String,
    pub status: CentroidStatus,
    pub created_at: String,
}

impl PersonCentroid {
    /// Key identifying the rebuild unit this record belongs to.
    pub fn staleness_key(&self) -> StalenessKey {
        StalenessKey {
            person_id: self.person_id,
            model_version: self.model_version.clone(),
            centroid_version: self.centroid_version,
        }
    }
}

/// The unit of rebuild mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StalenessKey {
    pub person_id: PersonId,
    pub model_version: String,
    pub centroid_version: u32,
}

/// Result of `compute_or_fetch`: the active centroid records plus what
/// happened to produce them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidSet {
    /// Global centroid first, then cluster centroids in stored label order.
    pub centroids: Vec<PersonCentroid>,
    /// True when this call performed the rebuild (false for cache hits and
    /// for callers that lost the rebuild race).
    pub rebuilt: bool,
    /// True when a rebuild is in progress elsewhere and these records may be
    /// stale (lock-timeout path).
    pub rebuild_pending: bool,
}

impl CentroidSet {
    /// The active global centroid, if present.
    pub fn global(&self) -> Option<&PersonCentroid> {
        self.centroids
            .iter()
            .find(|c| c.centroid_type == CentroidType::Global)
    }
}

/// A candidate face proposed as belonging to a person. Ephemeral: produced
/// per query, never persisted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionCandidate {
    pub face_id: FaceId,
    pub score: f32,
    /// Label of the centroid that produced the winning score.
    pub matched_centroid_label: String,
}

/// Ranked suggestion output for one person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionResult {
    pub candidates: Vec<SuggestionCandidate>,
    /// Carried through from the centroid fetch: true when the suggestions
    /// were served from a possibly-stale set while a rebuild runs.
    pub rebuild_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        assert!((cosine(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CentroidStatus::Building,
            CentroidStatus::Active,
            CentroidStatus::Deprecated,
            CentroidStatus::Failed,
        ] {
            assert_eq!(CentroidStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(CentroidStatus::parse("retired").is_err());
    }

    #[test]
    fn test_centroid_type_round_trip() {
        for ty in [CentroidType::Global, CentroidType::Cluster] {
            assert_eq!(CentroidType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(CentroidType::parse("").is_err());
    }
}
