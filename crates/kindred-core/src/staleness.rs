//! Staleness detection for stored centroid records.
//!
//! A centroid is stale when its model version, algorithm version, or
//! contributing face-ID set no longer match current state. The face-ID set
//! is compared via a truncated content hash; there is no time-based expiry.

use crate::types::{FaceId, PersonCentroid};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Stored length of the source hash, in hex characters (64 bits). Part of
/// the storage contract: collisions only need to be astronomically unlikely,
/// the hash is not load-bearing beyond "did the input set change".
pub const SOURCE_HASH_LEN: usize = 16;

const ID_DELIMITER: &str = ":";

/// Stable content hash over a face-ID set.
///
/// Order-insensitive: IDs are sorted before hashing, so the hash identifies
/// the set, not the sequence it was fetched in.
pub fn compute_source_hash(face_ids: &[FaceId]) -> String {
    let mut ids: Vec<String> = face_ids.iter().map(|id| id.to_string()).collect();
    ids.sort_unstable();

    let digest = Sha256::digest(ids.join(ID_DELIMITER).as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // infallible for String
        let _ = write!(hex, "{byte:02x}");
    }
    hex.truncate(SOURCE_HASH_LEN);
    hex
}

/// Whether `record` is stale relative to the current inputs and versions.
///
/// This is the sole staleness signal: any of model version, centroid
/// (algorithm) version, or source hash differing makes the record stale.
/// A blanked stored hash (see `CentroidStore::invalidate`) can never match
/// a computed one, so invalidated records always read as stale.
pub fn is_stale(
    record: &PersonCentroid,
    current_face_ids: &[FaceId],
    current_model_version: &str,
    current_centroid_version: u32,
) -> bool {
    record.model_version != current_model_version
        || record.centroid_version != current_centroid_version
        || record.source_hash != compute_source_hash(current_face_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CentroidStatus, CentroidType};
    use uuid::Uuid;

    fn record(model_version: &str, centroid_version: u32, source_hash: String) -> PersonCentroid {
        PersonCentroid {
            id: Uuid::new_v4(),
            person_id: Uuid::new_v4(),
            model_version: model_version.to_string(),
            centroid_version,
            centroid_type: CentroidType::Global,
            cluster_label: "global".to_string(),
            vector: vec![1.0, 0.0],
            n_faces: 3,
            source_hash,
            status: CentroidStatus::Active,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_hash_order_insensitive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_eq!(compute_source_hash(&[a, b, c]), compute_source_hash(&[c, a, b]));
    }

    #[test]
    fn test_hash_length_and_stability() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let hash = compute_source_hash(&ids);
        assert_eq!(hash.len(), SOURCE_HASH_LEN);
        assert_eq!(hash, compute_source_hash(&ids));
    }

    #[test]
    fn test_hash_changes_on_set_change() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let original = compute_source_hash(&ids);

        ids.push(Uuid::new_v4());
        let added = compute_source_hash(&ids);
        assert_ne!(original, added);

        ids.truncate(2);
        assert_ne!(original, compute_source_hash(&ids));
    }

    #[test]
    fn test_hash_empty_set() {
        assert_eq!(compute_source_hash(&[]).len(), SOURCE_HASH_LEN);
    }

    #[test]
    fn test_fresh_record_not_stale() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let rec = record("w600k_r50", 2, compute_source_hash(&ids));
        assert!(!is_stale(&rec, &ids, "w600k_r50", 2));
    }

    #[test]
    fn test_stale_on_any_version_or_set_change() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let rec = record("w600k_r50", 2, compute_source_hash(&ids));

        assert!(is_stale(&rec, &ids, "w600k_r51", 2));
        assert!(is_stale(&rec, &ids, "w600k_r50", 3));

        ids.push(Uuid::new_v4());
        assert!(is_stale(&rec, &ids, "w600k_r50", 2));
    }

    #[test]
    fn test_blanked_hash_always_stale() {
        let ids = vec![Uuid::new_v4()];
        let rec = record("w600k_r50", 2, String::new());
        assert!(is_stale(&rec, &ids, "w600k_r50", 2));
    }
}
