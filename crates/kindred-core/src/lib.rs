//! kindred-core — person-centroid computation and staleness tracking.
//!
//! Pure and I/O-free: everything in this crate is deterministic CPU work,
//! usable unchanged from synchronous batch jobs and async request handlers.

pub mod centroid;
pub mod staleness;
pub mod types;

pub use centroid::{compute_cluster_centroids, compute_global_centroid, CentroidError, ClusterParams};
pub use staleness::{compute_source_hash, is_stale};
pub use types::{
    CentroidSet, CentroidStatus, CentroidType, FaceEmbedding, FaceId, PersonCentroid, PersonId,
    StalenessKey, SuggestionCandidate, SuggestionResult,
};
