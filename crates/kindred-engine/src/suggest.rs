//! Suggestion search: one independent index query per active centroid,
//! then a deterministic merge/dedupe/rank.

use crate::config::SuggestionOptions;
use kindred_core::types::{FaceId, PersonId, SuggestionCandidate};
use kindred_store::index::{IndexHit, IndexKind, SearchFilter, VectorIndex};
use kindred_store::retry::{with_retry, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use kindred_store::IndexError;
use std::collections::HashMap;
use uuid::Uuid;

/// One nearest-neighbor query for a single centroid vector. Read-only and
/// independent of its siblings; the engine fans these out in parallel.
pub(crate) async fn search_centroid(
    index: &dyn VectorIndex,
    person_id: PersonId,
    query: &[f32],
    options: &SuggestionOptions,
) -> Result<Vec<IndexHit>, IndexError> {
    let filter = SearchFilter {
        kind: Some(IndexKind::Face),
        exclude_person: Some(person_id),
        exclude_prototypes: options.exclude_prototypes,
        unassigned_only: options.unassigned_only,
    };
    with_retry(
        "suggestion search",
        DEFAULT_MAX_ATTEMPTS,
        DEFAULT_BASE_DELAY,
        || index.search(query, &filter, options.per_centroid_limit, options.min_similarity),
    )
    .await
}

/// Merge per-centroid hit lists into one ranked candidate list.
///
/// Dedupes by face id, keeping the highest score and the label of the
/// centroid that produced it. The final sort is score-descending and
/// stable, so ties keep first-seen order across the centroid iteration
/// (global first, then clusters in stored label order). Truncates to
/// `max_results`.
pub(crate) fn merge_and_rank(
    per_centroid: &[(String, Vec<IndexHit>)],
    max_results: usize,
) -> Vec<SuggestionCandidate> {
    let mut by_face: HashMap<FaceId, usize> = HashMap::new();
    let mut candidates: Vec<SuggestionCandidate> = Vec::new();

    for (label, hits) in per_centroid {
        for hit in hits {
            let Ok(face_id) = Uuid::parse_str(&hit.key) else {
                tracing::warn!(key = %hit.key, "non-uuid face key in index; skipping");
                continue;
            };
            match by_face.get(&face_id) {
                Some(&slot) => {
                    if hit.score > candidates[slot].score {
                        candidates[slot].score = hit.score;
                        candidates[slot].matched_centroid_label = label.clone();
                    }
                }
                None => {
                    by_face.insert(face_id, candidates.len());
                    candidates.push(SuggestionCandidate {
                        face_id,
                        score: hit.score,
                        matched_centroid_label: label.clone(),
                    });
                }
            }
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(max_results);
    candidates
}
