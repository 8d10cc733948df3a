//! Per-call configuration. Versions are explicit values handed to every
//! facade call, never ambient process globals: two callers can only
//! disagree about the algorithm by visibly passing different configs.

use kindred_core::centroid::ClusterParams;
use kindred_store::store::RebuildOptions;
use kindred_store::DEFAULT_PAGE_SIZE;
use std::time::Duration;

/// Aggregation algorithm revision implemented by this crate. v1 predates
/// the n-based trimming policy; bumping this makes v1 records read as stale
/// and rebuild on next use.
pub const CURRENT_CENTROID_VERSION: u32 = 2;

/// Default embedding model identifier (ArcFace w600k_r50).
pub const DEFAULT_MODEL_VERSION: &str = "w600k_r50";

/// Identity and policy for one centroid fetch/rebuild.
#[derive(Debug, Clone)]
pub struct CentroidConfig {
    /// Embedding model whose vectors feed this centroid.
    pub model_version: String,
    /// Aggregation algorithm version.
    pub centroid_version: u32,
    pub trim_outliers: bool,
    pub enable_clustering: bool,
    /// Rebuild even when the stored source hash still matches.
    pub force_rebuild: bool,
    /// Bound on waiting for a rebuild already running elsewhere; on expiry
    /// the caller gets the most recent active set flagged `rebuild_pending`.
    pub rebuild_timeout: Option<Duration>,
    pub cluster_params: ClusterParams,
    /// Embedding fetch page size.
    pub page_size: usize,
}

impl Default for CentroidConfig {
    fn default() -> Self {
        Self {
            model_version: DEFAULT_MODEL_VERSION.to_string(),
            centroid_version: CURRENT_CENTROID_VERSION,
            trim_outliers: true,
            enable_clustering: true,
            force_rebuild: false,
            rebuild_timeout: None,
            cluster_params: ClusterParams::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl CentroidConfig {
    pub(crate) fn rebuild_options(&self) -> RebuildOptions {
        RebuildOptions {
            trim_outliers: self.trim_outliers,
            enable_clustering: self.enable_clustering,
            force_rebuild: self.force_rebuild,
            lock_timeout: self.rebuild_timeout,
            cluster_params: self.cluster_params.clone(),
            page_size: self.page_size,
        }
    }
}

/// Knobs for one suggestion query.
#[derive(Debug, Clone)]
pub struct SuggestionOptions {
    /// Minimum cosine similarity for a candidate.
    pub min_similarity: f32,
    /// Cap on the merged, ranked result list.
    pub max_results: usize,
    /// Only faces with no assigned person.
    pub unassigned_only: bool,
    /// Prototype faces are exemplars, not candidates.
    pub exclude_prototypes: bool,
    /// Cap per centroid query, before merging.
    pub per_centroid_limit: usize,
    /// Centroid fetch settings; a stale set is rebuilt before searching.
    pub centroid: CentroidConfig,
}

impl Default for SuggestionOptions {
    fn default() -> Self {
        Self {
            min_similarity: 0.5,
            max_results: 50,
            unassigned_only: true,
            exclude_prototypes: true,
            per_centroid_limit: 100,
            centroid: CentroidConfig::default(),
        }
    }
}
