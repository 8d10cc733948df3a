use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kindred_engine::{CentroidConfig, Engine, SuggestionOptions};
use kindred_store::index::{IndexKind, IndexPayload};
use kindred_store::{CentroidStore, FaceRecord, MemoryIndex, SqliteEmbeddingSource, VectorIndex};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "kindred", about = "kindred person-centroid and suggestion CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import face embeddings from a JSON file
    Import {
        /// JSON array of {face_id?, person_id?, embedding, is_prototype?, confirmed?}
        file: PathBuf,
    },
    /// Rebuild (or fetch) a person's centroids
    Rebuild {
        person_id: Uuid,
        /// Rebuild even if the face set is unchanged
        #[arg(long)]
        force: bool,
        /// Skip cluster centroids, compute the global one only
        #[arg(long)]
        no_clusters: bool,
    },
    /// Suggest faces that may belong to a person
    Suggest {
        person_id: Uuid,
        /// Cap the result list (default from KINDRED_MAX_RESULTS)
        #[arg(long)]
        limit: Option<usize>,
        /// Minimum similarity (default from KINDRED_MIN_SIMILARITY)
        #[arg(long)]
        min_similarity: Option<f32>,
        /// Also consider faces already assigned to other persons
        #[arg(long)]
        include_assigned: bool,
    },
    /// Force the next rebuild for a person, regardless of input changes
    Invalidate { person_id: Uuid },
    /// Show store statistics
    Status,
}

/// One face in an import file.
#[derive(Deserialize)]
struct ImportFace {
    face_id: Option<Uuid>,
    person_id: Option<Uuid>,
    embedding: Vec<f32>,
    #[serde(default)]
    is_prototype: bool,
    #[serde(default)]
    confirmed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = CentroidStore::open(&config.db_path).await?;
    let source = SqliteEmbeddingSource::attach(store.connection()).await?;

    match cli.command {
        Commands::Import { file } => {
            let data = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let faces: Vec<ImportFace> =
                serde_json::from_str(&data).context("parsing import file")?;
            let records: Vec<FaceRecord> = faces
                .into_iter()
                .map(|f| FaceRecord {
                    face_id: f.face_id.unwrap_or_else(Uuid::new_v4),
                    person_id: f.person_id,
                    vector: f.embedding,
                    is_prototype: f.is_prototype,
                    confirmed: f.confirmed,
                })
                .collect();
            let imported = source.insert_faces(records).await?;
            println!("imported {imported} faces into {}", config.db_path.display());
        }
        Commands::Rebuild {
            person_id,
            force,
            no_clusters,
        } => {
            let engine = build_engine(&store, &source).await?;
            let centroid_config = CentroidConfig {
                model_version: config.model_version.clone(),
                force_rebuild: force,
                enable_clustering: !no_clusters,
                page_size: config.page_size,
                ..Default::default()
            };
            let set = engine
                .compute_or_fetch_centroids(person_id, &centroid_config)
                .await?;
            println!(
                "{} centroids for {person_id} ({})",
                set.centroids.len(),
                if set.rebuilt { "rebuilt" } else { "cached" }
            );
            for record in &set.centroids {
                println!(
                    "  {:<8} n_faces={:<5} hash={} created={}",
                    record.cluster_label, record.n_faces, record.source_hash, record.created_at
                );
            }
        }
        Commands::Suggest {
            person_id,
            limit,
            min_similarity,
            include_assigned,
        } => {
            let engine = build_engine(&store, &source).await?;
            let options = SuggestionOptions {
                min_similarity: min_similarity.unwrap_or(config.min_similarity),
                max_results: limit.unwrap_or(config.max_results),
                unassigned_only: !include_assigned,
                centroid: CentroidConfig {
                    model_version: config.model_version.clone(),
                    page_size: config.page_size,
                    ..Default::default()
                },
                ..Default::default()
            };
            let result = engine.get_suggestions(person_id, &options).await?;
            if result.rebuild_pending {
                println!("note: served from a stale centroid set; a rebuild is in progress");
            }
            if result.candidates.is_empty() {
                println!("no candidate faces above similarity {}", options.min_similarity);
            }
            for candidate in &result.candidates {
                println!(
                    "{}  score={:.4}  via={}",
                    candidate.face_id, candidate.score, candidate.matched_centroid_label
                );
            }
        }
        Commands::Invalidate { person_id } => {
            let engine = build_engine(&store, &source).await?;
            let invalidated = engine.invalidate(person_id).await?;
            println!("invalidated {invalidated} active centroid records for {person_id}");
        }
        Commands::Status => {
            let faces = source.all_faces().await?;
            let confirmed = faces.iter().filter(|f| f.confirmed).count();
            let unassigned = faces.iter().filter(|f| f.person_id.is_none()).count();
            let mut centroids = serde_json::Map::new();
            for (status, count) in store.status_counts().await? {
                centroids.insert(status, count.into());
            }
            println!(
                "{}",
                serde_json::json!({
                    "db_path": config.db_path.display().to_string(),
                    "model_version": config.model_version,
                    "faces": faces.len(),
                    "confirmed": confirmed,
                    "unassigned": unassigned,
                    "centroid_records": centroids,
                })
            );
        }
    }

    Ok(())
}

/// Assemble the facade: the store's SQLite file backs both metadata and the
/// face table, and the brute-force index is loaded from that table.
async fn build_engine(store: &CentroidStore, source: &SqliteEmbeddingSource) -> Result<Engine> {
    let index = MemoryIndex::new();
    let faces = source.all_faces().await?;
    let n_faces = faces.len();
    for face in faces {
        index
            .upsert(
                &face.face_id.to_string(),
                &face.vector,
                IndexPayload {
                    kind: IndexKind::Face,
                    person_id: face.person_id,
                    is_prototype: face.is_prototype,
                },
            )
            .await?;
    }
    tracing::debug!(faces = n_faces, "loaded in-memory face index");
    Ok(Engine::new(
        store.clone(),
        Arc::new(source.clone()),
        Arc::new(index),
    ))
}
