use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding model identifier stamped on centroid records.
    pub model_version: String,
    /// Minimum cosine similarity for suggestion candidates.
    pub min_similarity: f32,
    /// Maximum suggestions returned per query.
    pub max_results: usize,
    /// Embedding fetch page size.
    pub page_size: usize,
}

impl Config {
    /// Load configuration from `KINDRED_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("kindred");

        let db_path = std::env::var("KINDRED_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("kindred.db"));

        Self {
            db_path,
            model_version: std::env::var("KINDRED_MODEL_VERSION")
                .unwrap_or_else(|_| kindred_engine::DEFAULT_MODEL_VERSION.to_string()),
            min_similarity: env_f32("KINDRED_MIN_SIMILARITY", 0.5),
            max_results: env_usize("KINDRED_MAX_RESULTS", 50),
            page_size: env_usize("KINDRED_PAGE_SIZE", kindred_store::DEFAULT_PAGE_SIZE),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
