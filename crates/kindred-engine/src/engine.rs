use crate::config::{CentroidConfig, SuggestionOptions};
use crate::suggest;
use futures::future::try_join_all;
use kindred_core::types::{CentroidSet, PersonId, SuggestionResult};
use kindred_store::{CentroidStore, EmbeddingSource, IndexError, StoreError, VectorIndex};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("suggestion search, retries exhausted: {0}")]
    Search(#[from] IndexError),
    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl EngineError {
    /// Transient errors may be retried, or answered by serving stale data.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Search(_) => true,
            Self::Runtime(_) => false,
        }
    }
}

/// The canonical facade. Every caller (request handler, worker, batch
/// job) resolves centroids and suggestions through these three
/// operations and nothing else.
#[derive(Clone)]
pub struct Engine {
    store: CentroidStore,
    source: Arc<dyn EmbeddingSource>,
    index: Arc<dyn VectorIndex>,
}

impl Engine {
    pub fn new(
        store: CentroidStore,
        source: Arc<dyn EmbeddingSource>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self { store, source, index }
    }

    /// The person's active centroid set, rebuilt first when stale.
    pub async fn compute_or_fetch_centroids(
        &self,
        person_id: PersonId,
        config: &CentroidConfig,
    ) -> Result<CentroidSet, EngineError> {
        let set = self
            .store
            .compute_or_fetch(
                person_id,
                &config.model_version,
                config.centroid_version,
                self.source.as_ref(),
                self.index.as_ref(),
                &config.rebuild_options(),
            )
            .await?;
        Ok(set)
    }

    /// Ranked candidate faces for a person.
    ///
    /// Fetches (and if needed rebuilds) the active centroid set, then
    /// issues one read-only index query per centroid in parallel before
    /// merging into a single deduped, ranked list.
    pub async fn get_suggestions(
        &self,
        person_id: PersonId,
        options: &SuggestionOptions,
    ) -> Result<SuggestionResult, EngineError> {
        let set = self
            .compute_or_fetch_centroids(person_id, &options.centroid)
            .await?;

        let searches = set.centroids.iter().map(|centroid| {
            let label = centroid.cluster_label.clone();
            async move {
                suggest::search_centroid(self.index.as_ref(), person_id, &centroid.vector, options)
                    .await
                    .map(|hits| (label, hits))
            }
        });
        let per_centroid = try_join_all(searches).await?;

        let candidates = suggest::merge_and_rank(&per_centroid, options.max_results);
        tracing::debug!(
            person_id = %person_id,
            n_centroids = per_centroid.len(),
            n_candidates = candidates.len(),
            rebuild_pending = set.rebuild_pending,
            "suggestions ready"
        );
        Ok(SuggestionResult {
            candidates,
            rebuild_pending: set.rebuild_pending,
        })
    }

    /// Force the next centroid fetch for this person to rebuild, regardless
    /// of hash match. Returns the number of records invalidated.
    pub async fn invalidate(&self, person_id: PersonId) -> Result<u64, EngineError> {
        Ok(self.store.invalidate(person_id).await?)
    }
}

/// Synchronous wrapper for batch callers that have no runtime of their own.
///
/// The pure computation never suspends, so nothing algorithmic changes
/// between this and the async surface; the wrapper only parks the caller
/// on the store's I/O.
pub struct BlockingEngine {
    runtime: tokio::runtime::Runtime,
    engine: Engine,
}

impl BlockingEngine {
    pub fn new(engine: Engine) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, engine })
    }

    pub fn compute_or_fetch_centroids(
        &self,
        person_id: PersonId,
        config: &CentroidConfig,
    ) -> Result<CentroidSet, EngineError> {
        self.runtime
            .block_on(self.engine.compute_or_fetch_centroids(person_id, config))
    }

    pub fn get_suggestions(
        &self,
        person_id: PersonId,
        options: &SuggestionOptions,
    ) -> Result<SuggestionResult, EngineError> {
        self.runtime
            .block_on(self.engine.get_suggestions(person_id, options))
    }

    pub fn invalidate(&self, person_id: PersonId) -> Result<u64, EngineError> {
        self.runtime.block_on(self.engine.invalidate(person_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_core::centroid::CentroidError;
    use kindred_core::types::FaceId;
    use kindred_store::index::{IndexKind, IndexPayload};
    use kindred_store::{FaceRecord, MemoryIndex, SqliteEmbeddingSource};
    use uuid::Uuid;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
        v
    }

    fn x_vector(i: usize) -> Vec<f32> {
        unit(vec![1.0, 0.01 * (i % 7) as f32, 0.0, 0.0])
    }

    struct Fixture {
        engine: Engine,
        person_id: PersonId,
        own_face_ids: Vec<FaceId>,
        index: MemoryIndex,
    }

    /// Person with 60 confirmed faces near the x axis; index seeded with
    /// their own faces plus assorted candidates and non-candidates.
    async fn fixture() -> Fixture {
        let store = CentroidStore::open_in_memory().await.unwrap();
        let source = SqliteEmbeddingSource::attach(store.connection()).await.unwrap();
        let index = MemoryIndex::new();
        let person_id = Uuid::new_v4();

        let faces: Vec<FaceRecord> = (0..60)
            .map(|i| FaceRecord {
                face_id: Uuid::new_v4(),
                person_id: Some(person_id),
                vector: x_vector(i),
                is_prototype: false,
                confirmed: true,
            })
            .collect();
        for face in &faces {
            index
                .upsert(
                    &face.face_id.to_string(),
                    &face.vector,
                    IndexPayload {
                        kind: IndexKind::Face,
                        person_id: Some(person_id),
                        is_prototype: false,
                    },
                )
                .await
                .unwrap();
        }
        let own_face_ids: Vec<FaceId> = faces.iter().map(|f| f.face_id).collect();
        source.insert_faces(faces).await.unwrap();

        let engine = Engine::new(store, Arc::new(source), Arc::new(index.clone()));
        Fixture {
            engine,
            person_id,
            own_face_ids,
            index,
        }
    }

    async fn seed_face(
        index: &MemoryIndex,
        vector: Vec<f32>,
        person_id: Option<PersonId>,
        is_prototype: bool,
    ) -> FaceId {
        let face_id = Uuid::new_v4();
        index
            .upsert(
                &face_id.to_string(),
                &vector,
                IndexPayload {
                    kind: IndexKind::Face,
                    person_id,
                    is_prototype,
                },
            )
            .await
            .unwrap();
        face_id
    }

    #[tokio::test]
    async fn test_suggestions_end_to_end() {
        let fx = fixture().await;

        let near_a = seed_face(&fx.index, unit(vec![1.0, 0.02, 0.0, 0.0]), None, false).await;
        let near_b = seed_face(&fx.index, unit(vec![1.0, 0.2, 0.0, 0.0]), None, false).await;
        // Must not surface: prototype, off-axis, someone else's face.
        seed_face(&fx.index, unit(vec![1.0, 0.01, 0.0, 0.0]), None, true).await;
        seed_face(&fx.index, unit(vec![0.0, 1.0, 0.0, 0.0]), None, false).await;
        seed_face(
            &fx.index,
            unit(vec![1.0, 0.03, 0.0, 0.0]),
            Some(Uuid::new_v4()),
            false,
        )
        .await;

        let result = fx
            .engine
            .get_suggestions(fx.person_id, &SuggestionOptions::default())
            .await
            .unwrap();

        assert!(!result.rebuild_pending);
        let ids: Vec<FaceId> = result.candidates.iter().map(|c| c.face_id).collect();
        assert_eq!(ids, [near_a, near_b]);
        assert!(result.candidates[0].score > result.candidates[1].score);
        for candidate in &result.candidates {
            assert_eq!(candidate.matched_centroid_label, "global");
            assert!(candidate.score >= 0.5);
        }
    }

    #[tokio::test]
    async fn test_suggestions_can_include_assigned_faces() {
        let fx = fixture().await;
        let other_person = seed_face(
            &fx.index,
            unit(vec![1.0, 0.03, 0.0, 0.0]),
            Some(Uuid::new_v4()),
            false,
        )
        .await;

        let options = SuggestionOptions {
            unassigned_only: false,
            ..Default::default()
        };
        let result = fx.engine.get_suggestions(fx.person_id, &options).await.unwrap();
        assert!(result.candidates.iter().any(|c| c.face_id == other_person));
        // Own faces stay excluded even when assigned faces are allowed.
        assert!(result
            .candidates
            .iter()
            .all(|c| !fx.own_face_ids.contains(&c.face_id)));
    }

    #[tokio::test]
    async fn test_centroid_fetch_is_cached_between_calls() {
        let fx = fixture().await;
        let config = CentroidConfig::default();

        let first = fx
            .engine
            .compute_or_fetch_centroids(fx.person_id, &config)
            .await
            .unwrap();
        assert!(first.rebuilt);

        let second = fx
            .engine
            .compute_or_fetch_centroids(fx.person_id, &config)
            .await
            .unwrap();
        assert!(!second.rebuilt);
        assert_eq!(
            second.global().unwrap().id,
            first.global().unwrap().id
        );
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild_through_facade() {
        let fx = fixture().await;
        let config = CentroidConfig::default();

        fx.engine
            .compute_or_fetch_centroids(fx.person_id, &config)
            .await
            .unwrap();
        assert_eq!(fx.engine.invalidate(fx.person_id).await.unwrap(), 1);

        let after = fx
            .engine
            .compute_or_fetch_centroids(fx.person_id, &config)
            .await
            .unwrap();
        assert!(after.rebuilt);
    }

    #[tokio::test]
    async fn test_unlabeled_person_surfaces_typed_error() {
        let fx = fixture().await;
        let err = fx
            .engine
            .compute_or_fetch_centroids(Uuid::new_v4(), &CentroidConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::Centroid(CentroidError::InsufficientInput))
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_blocking_engine_smoke() {
        let setup = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (engine, person_id) = setup.block_on(async {
            let fx = fixture().await;
            (fx.engine, fx.person_id)
        });
        drop(setup);

        let blocking = BlockingEngine::new(engine).unwrap();
        let set = blocking
            .compute_or_fetch_centroids(person_id, &CentroidConfig::default())
            .unwrap();
        assert!(set.rebuilt);

        let result = blocking
            .get_suggestions(person_id, &SuggestionOptions::default())
            .unwrap();
        assert!(!result.rebuild_pending);
    }
}
