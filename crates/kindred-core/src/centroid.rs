//! Trimmed-mean and cluster centroid computation.
//!
//! This is the single shared implementation of the aggregation algorithm.
//! Every call site (request path, background worker, batch job) goes
//! through these functions; there is deliberately no per-caller variant of
//! the trimming or clustering policy.

use crate::types::FaceEmbedding;
use thiserror::Error;

// --- Trimming policy ---
const TRIM_MIN_FACES: usize = 50;
const TRIM_SMALL_SET_MAX: usize = 300;
const TRIM_FRACTION_SMALL: f32 = 0.05;
const TRIM_FRACTION_LARGE: f32 = 0.10;

// --- Clustering ---
const KMEANS_MAX_ITERS: usize = 50;

/// Norm below which an aggregated vector is considered collapsed.
const NORM_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum CentroidError {
    #[error("no embeddings to aggregate")]
    InsufficientInput,
    #[error("aggregated vector collapsed to zero norm")]
    DegenerateVector,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Knobs for cluster-centroid extraction. Defaults match the aggregation
/// policy shipped as `centroid_version` 2.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub min_faces_for_clustering: usize,
    pub min_cluster_fraction: f32,
    pub min_cluster_size_abs: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_faces_for_clustering: 200,
            min_cluster_fraction: 0.08,
            min_cluster_size_abs: 20,
        }
    }
}

/// Compute the global centroid of a person's face embeddings.
///
/// Takes the normalized arithmetic mean, and for sets of `TRIM_MIN_FACES` or
/// more (when `trim_outliers` is set) drops the least-representative vectors
/// by similarity to that initial mean before re-averaging. Input vectors are
/// expected to be unit-norm already; the output always is.
///
/// Deterministic for a fixed input ordering: no randomness anywhere, and the
/// trim boundary is rank-based (see [`trim_count`]).
pub fn compute_global_centroid(
    embeddings: &[FaceEmbedding],
    trim_outliers: bool,
) -> Result<Vec<f32>, CentroidError> {
    let n = embeddings.len();
    if n == 0 {
        return Err(CentroidError::InsufficientInput);
    }
    check_dims(embeddings)?;

    let initial_mean = normalized_mean(embeddings.iter().map(|e| e.vector.as_slice()))?;

    let trim = if trim_outliers { trim_count(n) } else { 0 };
    if trim == 0 {
        return Ok(initial_mean);
    }

    let sims: Vec<f32> = embeddings
        .iter()
        .map(|e| dot(&e.vector, &initial_mean))
        .collect();

    // Rank ascending by similarity, ties broken by input index.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| sims[a].total_cmp(&sims[b]).then(a.cmp(&b)));

    let mut keep = vec![true; n];
    for &i in &order[..trim] {
        keep[i] = false;
    }

    normalized_mean(
        embeddings
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(_, e)| e.vector.as_slice()),
    )
}

/// Extract per-appearance-mode cluster centroids via deterministic k=2
/// spherical k-means.
///
/// Returns an empty list (a logged fallback, not an error) when the face
/// set is too small, when either partition comes out under
/// `max(min_cluster_size_abs, min_cluster_fraction * n)`, or when the
/// partitioning degenerates. Partitions of 50+ faces get the same trimmed
/// mean as the global centroid; smaller partitions a plain normalized mean.
///
/// Labels are `"k2_0"`/`"k2_1"`, with `"k2_0"` assigned to the partition
/// containing the earliest input index, so identical input yields identical
/// labeling across runs.
pub fn compute_cluster_centroids(
    embeddings: &[FaceEmbedding],
    params: &ClusterParams,
) -> Vec<(String, Vec<f32>)> {
    let n = embeddings.len();
    if n < params.min_faces_for_clustering {
        return Vec::new();
    }
    if check_dims(embeddings).is_err() {
        tracing::warn!(n_faces = n, "mixed embedding dimensions; skipping clustering");
        return Vec::new();
    }

    let Some(assignment) = kmeans2(embeddings) else {
        tracing::info!(n_faces = n, "k-means degenerated; falling back to global-only");
        return Vec::new();
    };

    let size1 = assignment.iter().filter(|&&a| a == 1).count();
    let sizes = [n - size1, size1];
    let min_cluster_size = params
        .min_cluster_size_abs
        .max((params.min_cluster_fraction * n as f32).ceil() as usize);
    if sizes[0] < min_cluster_size || sizes[1] < min_cluster_size {
        tracing::info!(
            n_faces = n,
            cluster_sizes = ?sizes,
            min_cluster_size,
            "cluster partition below minimum size; falling back to global-only"
        );
        return Vec::new();
    }

    // The partition holding the earliest input gets label k2_0.
    let first_cluster = assignment[0];
    let mut out = Vec::with_capacity(2);
    for (label_idx, cluster) in [first_cluster, 1 - first_cluster].into_iter().enumerate() {
        let members: Vec<FaceEmbedding> = embeddings
            .iter()
            .zip(&assignment)
            .filter(|(_, &a)| a == cluster)
            .map(|(e, _)| e.clone())
            .collect();
        match compute_global_centroid(&members, true) {
            Ok(vector) => out.push((format!("k2_{label_idx}"), vector)),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    cluster_size = members.len(),
                    "cluster centroid computation failed; falling back to global-only"
                );
                return Vec::new();
            }
        }
    }
    out
}

/// Number of vectors the trimming policy drops for an input of size `n`.
///
/// Sets under `TRIM_MIN_FACES` are never trimmed. At or above it the
/// fraction is 5% up to 300 faces and 10% beyond, and the count is
/// `floor(n * fraction)`: a rank-based boundary rather than an interpolated
/// percentile, so independent implementations of this rule agree
/// bit-for-bit on which vectors go.
fn trim_count(n: usize) -> usize {
    if n < TRIM_MIN_FACES {
        return 0;
    }
    let fraction = if n <= TRIM_SMALL_SET_MAX {
        TRIM_FRACTION_SMALL
    } else {
        TRIM_FRACTION_LARGE
    };
    (n as f32 * fraction).floor() as usize
}

/// Deterministic k=2 spherical k-means over unit vectors.
///
/// Seeds from the first vector and the vector least similar to it, then
/// iterates assign/re-mean until stable. Returns `None` when all vectors
/// coincide, a partition empties, or a partition mean collapses.
fn kmeans2(embeddings: &[FaceEmbedding]) -> Option<Vec<usize>> {
    let n = embeddings.len();
    let c0 = embeddings[0].vector.clone();

    let mut seed1 = 0usize;
    let mut worst = f32::INFINITY;
    for (i, e) in embeddings.iter().enumerate() {
        let sim = dot(&e.vector, &c0);
        if sim < worst {
            worst = sim;
            seed1 = i;
        }
    }
    if seed1 == 0 {
        // Every vector is at least as close to the first as the first is to
        // itself: the set has no second mode to find.
        return None;
    }

    let mut centroids = [c0, embeddings[seed1].vector.clone()];
    let mut assignment = vec![0usize; n];

    for _ in 0..KMEANS_MAX_ITERS {
        let mut changed = false;
        for (i, e) in embeddings.iter().enumerate() {
            let s0 = dot(&e.vector, &centroids[0]);
            let s1 = dot(&e.vector, &centroids[1]);
            let cluster = usize::from(s1 > s0);
            if assignment[i] != cluster {
                assignment[i] = cluster;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        for cluster in 0..2 {
            let members = embeddings
                .iter()
                .zip(&assignment)
                .filter(|(_, &a)| a == cluster)
                .map(|(e, _)| e.vector.as_slice());
            match normalized_mean(members) {
                Ok(mean) => centroids[cluster] = mean,
                Err(_) => return None,
            }
        }
    }

    Some(assignment)
}

/// Arithmetic mean of the given vectors, L2-normalized.
fn normalized_mean<'a, I>(vectors: I) -> Result<Vec<f32>, CentroidError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut iter = vectors.into_iter();
    let first = iter.next().ok_or(CentroidError::InsufficientInput)?;
    let mut acc: Vec<f32> = first.to_vec();
    let mut count = 1usize;
    for v in iter {
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
        count += 1;
    }
    let inv = 1.0 / count as f32;
    for a in acc.iter_mut() {
        *a *= inv;
    }
    l2_normalize(&mut acc)?;
    Ok(acc)
}

fn l2_normalize(v: &mut [f32]) -> Result<(), CentroidError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= NORM_EPSILON {
        return Err(CentroidError::DegenerateVector);
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(())
}

fn check_dims(embeddings: &[FaceEmbedding]) -> Result<(), CentroidError> {
    let expected = embeddings[0].vector.len();
    for e in &embeddings[1..] {
        if e.vector.len() != expected {
            return Err(CentroidError::DimensionMismatch {
                expected,
                got: e.vector.len(),
            });
        }
    }
    Ok(())
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn emb(vector: Vec<f32>) -> FaceEmbedding {
        FaceEmbedding {
            face_id: Uuid::new_v4(),
            vector,
        }
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        l2_normalize(&mut v).unwrap();
        v
    }

    /// `count` near-duplicates of the x axis with small deterministic jitter.
    fn x_cluster(count: usize) -> Vec<FaceEmbedding> {
        (0..count)
            .map(|i| emb(unit(vec![1.0, 0.01 * (i % 7) as f32, 0.005 * (i % 3) as f32, 0.0])))
            .collect()
    }

    /// `count` near-duplicates of the y axis.
    fn y_cluster(count: usize) -> Vec<FaceEmbedding> {
        (0..count)
            .map(|i| emb(unit(vec![0.01 * (i % 5) as f32, 1.0, 0.0, 0.01 * (i % 2) as f32])))
            .collect()
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_global_output_unit_norm() {
        for n in [1, 2, 5, 13] {
            let embeddings = x_cluster(n);
            let centroid = compute_global_centroid(&embeddings, true).unwrap();
            assert!((norm(&centroid) - 1.0).abs() < 1e-5, "n={n}");
        }
    }

    #[test]
    fn test_global_empty_input() {
        assert!(matches!(
            compute_global_centroid(&[], true),
            Err(CentroidError::InsufficientInput)
        ));
    }

    #[test]
    fn test_global_degenerate_cancelling_inputs() {
        let embeddings = vec![emb(vec![1.0, 0.0]), emb(vec![-1.0, 0.0])];
        assert!(matches!(
            compute_global_centroid(&embeddings, true),
            Err(CentroidError::DegenerateVector)
        ));
    }

    #[test]
    fn test_global_dimension_mismatch() {
        let embeddings = vec![emb(vec![1.0, 0.0, 0.0]), emb(vec![0.0, 1.0])];
        assert!(matches!(
            compute_global_centroid(&embeddings, false),
            Err(CentroidError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_trim_count_boundaries() {
        assert_eq!(trim_count(49), 0);
        assert_eq!(trim_count(50), 2);
        assert_eq!(trim_count(300), 15);
        assert_eq!(trim_count(301), 30);
    }

    #[test]
    fn test_global_reproducible() {
        let embeddings = x_cluster(120);
        let a = compute_global_centroid(&embeddings, true).unwrap();
        let b = compute_global_centroid(&embeddings, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_outlier_trimmed_at_60_faces() {
        let mut embeddings = x_cluster(59);
        embeddings.push(emb(vec![0.0, 0.0, 0.0, 1.0])); // clear outlier

        let untrimmed = compute_global_centroid(&embeddings, false).unwrap();
        let trimmed = compute_global_centroid(&embeddings, true).unwrap();

        // The outlier pulls the untrimmed mean off-axis; trimming removes it.
        assert!(untrimmed[3] > 0.01);
        assert!(trimmed[3].abs() < 1e-6);
        assert!(1.0 - dot(&trimmed, &untrimmed) > 1e-4);
    }

    #[test]
    fn test_outlier_kept_under_50_faces() {
        let mut embeddings = x_cluster(39);
        embeddings.push(emb(vec![0.0, 0.0, 0.0, 1.0]));

        // Below the trimming floor the flag makes no difference.
        let untrimmed = compute_global_centroid(&embeddings, false).unwrap();
        let trimmed = compute_global_centroid(&embeddings, true).unwrap();
        assert_eq!(trimmed, untrimmed);
        assert!(trimmed[3] > 0.01);
    }

    #[test]
    fn test_clustering_below_min_faces() {
        let mut embeddings = x_cluster(100);
        embeddings.extend(y_cluster(99));
        assert!(compute_cluster_centroids(&embeddings, &ClusterParams::default()).is_empty());
    }

    #[test]
    fn test_clustering_imbalanced_fallback() {
        // 190/10 at n=200: min cluster size is max(20, 16) = 20 > 10.
        let mut embeddings = x_cluster(190);
        embeddings.extend(y_cluster(10));
        assert!(compute_cluster_centroids(&embeddings, &ClusterParams::default()).is_empty());
    }

    #[test]
    fn test_clustering_balanced_split() {
        let mut embeddings = x_cluster(100);
        embeddings.extend(y_cluster(100));
        let clusters = compute_cluster_centroids(&embeddings, &ClusterParams::default());
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].0, "k2_0");
        assert_eq!(clusters[1].0, "k2_1");
        // k2_0 belongs to the partition containing input index 0 (the x group).
        assert!(clusters[0].1[0] > 0.99);
        assert!(clusters[1].1[1] > 0.99);
        for (_, vector) in &clusters {
            assert!((norm(vector) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_clustering_deterministic() {
        let mut embeddings = x_cluster(120);
        embeddings.extend(y_cluster(110));
        let a = compute_cluster_centroids(&embeddings, &ClusterParams::default());
        let b = compute_cluster_centroids(&embeddings, &ClusterParams::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_clustering_identical_inputs_fall_back() {
        let embeddings: Vec<FaceEmbedding> =
            (0..200).map(|_| emb(vec![1.0, 0.0, 0.0, 0.0])).collect();
        assert!(compute_cluster_centroids(&embeddings, &ClusterParams::default()).is_empty());
    }
}
