//! SQLite-backed centroid metadata store.
//!
//! The store exclusively owns the write path for centroid status
//! transitions; every other component only reads. `compute_or_fetch` is the
//! single rebuild path: per-key lock, double-checked staleness, compute,
//! persist, and an atomic active/deprecated flip that readers can never
//! observe half-done.

use crate::blob::{vector_from_blob, vector_to_blob};
use crate::index::{IndexKind, IndexPayload, VectorIndex};
use crate::lock::KeyedLocks;
use crate::retry::{with_retry, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::source::{conv_err, fetch_all_faces, parse_uuid, EmbeddingSource, SourceError, DEFAULT_PAGE_SIZE};
use chrono::Utc;
use kindred_core::centroid::{self, CentroidError, ClusterParams};
use kindred_core::staleness::{compute_source_hash, is_stale};
use kindred_core::types::{
    CentroidSet, CentroidStatus, CentroidType, FaceEmbedding, FaceId, PersonCentroid, PersonId,
    StalenessKey,
};
use rusqlite::params;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS person_centroids (
    id               TEXT PRIMARY KEY,
    person_id        TEXT NOT NULL,
    model_version    TEXT NOT NULL,
    centroid_version INTEGER NOT NULL,
    centroid_type    TEXT NOT NULL,
    cluster_label    TEXT NOT NULL,
    -- little-endian f32 bytes; empty for failed attempts
    vector           BLOB NOT NULL,
    n_faces          INTEGER NOT NULL,
    source_hash      TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_centroids_key
    ON person_centroids (person_id, model_version, centroid_version, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_centroids_one_active
    ON person_centroids (person_id, model_version, centroid_version, centroid_type, cluster_label)
    WHERE status = 'active';
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("centroid computation failed: {0}")]
    Centroid(#[from] CentroidError),
    #[error("embedding source: {0}")]
    Source(#[from] SourceError),
    #[error("vector index, retries exhausted: {0}")]
    Index(#[from] crate::index::IndexError),
    #[error("timed out waiting for rebuild lock and no active centroid exists")]
    LockContentionTimeout,
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

impl StoreError {
    /// Transient failures may be retried or answered with stale data; the
    /// rest are permanent until the inputs change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Index(_) | Self::LockContentionTimeout)
    }
}

/// Per-call rebuild knobs. Versions are not here: they are identity, passed
/// explicitly to every call, never ambient process state.
#[derive(Debug, Clone)]
pub struct RebuildOptions {
    pub trim_outliers: bool,
    pub enable_clustering: bool,
    /// Rebuild even when the source hash matches.
    pub force_rebuild: bool,
    /// Bound on waiting for another caller's in-progress rebuild. When it
    /// elapses, the most recent active set is served with
    /// `rebuild_pending = true` instead of blocking.
    pub lock_timeout: Option<Duration>,
    pub cluster_params: ClusterParams,
    pub page_size: usize,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            trim_outliers: true,
            enable_clustering: true,
            force_rebuild: false,
            lock_timeout: None,
            cluster_params: ClusterParams::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Stable vector-index key for a centroid record, so rebuilds overwrite the
/// same entry instead of accumulating one per attempt.
pub fn centroid_index_key(record: &PersonCentroid) -> String {
    format!(
        "centroid:{}:{}:v{}:{}",
        record.person_id, record.model_version, record.centroid_version, record.cluster_label
    )
}

#[derive(Clone)]
pub struct CentroidStore {
    conn: Connection,
    locks: KeyedLocks,
}

impl CentroidStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // Owned path: the connection moves it onto its dedicated thread.
        Self::init(Connection::open(path.as_ref().to_path_buf()).await?).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self {
            conn,
            locks: KeyedLocks::default(),
        })
    }

    /// The underlying connection, for collaborators sharing the same file
    /// (e.g. a [`SqliteEmbeddingSource`](crate::source::SqliteEmbeddingSource)).
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Current active records for a key: empty, one global, or one global
    /// plus N cluster records. Global first, clusters in label order.
    pub async fn get_active(
        &self,
        person_id: PersonId,
        model_version: &str,
        centroid_version: u32,
    ) -> Result<Vec<PersonCentroid>, StoreError> {
        let person = person_id.to_string();
        let model = model_version.to_string();
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, person_id, model_version, centroid_version, centroid_type,
                            cluster_label, vector, n_faces, source_hash, status, created_at
                     FROM person_centroids
                     WHERE person_id = ?1 AND model_version = ?2 AND centroid_version = ?3
                       AND status = 'active'
                     ORDER BY CASE centroid_type WHEN 'global' THEN 0 ELSE 1 END, cluster_label",
                )?;
                let records = stmt
                    .query_map(params![person, model, centroid_version], row_to_centroid)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    /// Fetch the current active set, rebuilding it first if stale.
    ///
    /// Two concurrent callers for the same key produce exactly one rebuild:
    /// the loser blocks on the key lock, then passes the double-checked
    /// staleness read and returns the winner's rows unchanged.
    pub async fn compute_or_fetch(
        &self,
        person_id: PersonId,
        model_version: &str,
        centroid_version: u32,
        source: &dyn EmbeddingSource,
        index: &dyn VectorIndex,
        options: &RebuildOptions,
    ) -> Result<CentroidSet, StoreError> {
        let key = StalenessKey {
            person_id,
            model_version: model_version.to_string(),
            centroid_version,
        };

        let _guard = match options.lock_timeout {
            None => self.locks.acquire(&key).await,
            Some(timeout) => match self.locks.acquire_timeout(&key, timeout).await {
                Some(guard) => guard,
                None => {
                    // A rebuild is running elsewhere; serve what we have and
                    // let it finish on its own.
                    let active = self
                        .get_active(person_id, model_version, centroid_version)
                        .await?;
                    if active.is_empty() {
                        return Err(StoreError::LockContentionTimeout);
                    }
                    tracing::debug!(
                        person_id = %person_id,
                        "rebuild in progress elsewhere; serving current active set"
                    );
                    return Ok(CentroidSet {
                        centroids: active,
                        rebuilt: false,
                        rebuild_pending: true,
                    });
                }
            },
        };

        let active = self
            .get_active(person_id, model_version, centroid_version)
            .await?;

        // One paged fetch feeds both the staleness check and, if stale, the
        // rebuild. This is the only suspension point besides index I/O.
        let faces = fetch_all_faces(source, person_id, options.page_size).await?;
        let face_ids: Vec<FaceId> = faces.iter().map(|f| f.face_id).collect();

        let fresh = !active.is_empty()
            && !options.force_rebuild
            && active
                .iter()
                .all(|r| !is_stale(r, &face_ids, model_version, centroid_version));
        if fresh {
            tracing::debug!(
                person_id = %person_id,
                n_active = active.len(),
                "centroids fresh; serving without rebuild"
            );
            return Ok(CentroidSet {
                centroids: active,
                rebuilt: false,
                rebuild_pending: false,
            });
        }

        self.rebuild(
            person_id,
            model_version,
            centroid_version,
            faces,
            &face_ids,
            &active,
            index,
            options,
        )
        .await
    }

    /// Force the next `compute_or_fetch` for this person to rebuild, across
    /// all model/algorithm versions: a blanked hash never matches a
    /// computed one.
    pub async fn invalidate(&self, person_id: PersonId) -> Result<u64, StoreError> {
        let person = person_id.to_string();
        let invalidated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE person_centroids SET source_hash = ''
                     WHERE person_id = ?1 AND status = 'active'",
                    params![person],
                )?;
                Ok(n)
            })
            .await?;
        tracing::info!(person_id = %person_id, invalidated, "invalidated active centroids");
        Ok(invalidated as u64)
    }

    /// Record counts per status, for diagnostics.
    pub async fn status_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let counts = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM person_centroids GROUP BY status ORDER BY status",
                )?;
                let counts = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }

    #[allow(clippy::too_many_arguments)]
    async fn rebuild(
        &self,
        person_id: PersonId,
        model_version: &str,
        centroid_version: u32,
        faces: Vec<FaceEmbedding>,
        face_ids: &[FaceId],
        previous_active: &[PersonCentroid],
        index: &dyn VectorIndex,
        options: &RebuildOptions,
    ) -> Result<CentroidSet, StoreError> {
        let n_faces = faces.len();
        let source_hash = compute_source_hash(face_ids);

        let global = match centroid::compute_global_centroid(&faces, options.trim_outliers) {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(
                    person_id = %person_id,
                    n_faces,
                    error = %err,
                    "centroid computation failed; prior active set left untouched"
                );
                self.record_failed_attempt(
                    person_id,
                    model_version,
                    centroid_version,
                    n_faces,
                    &source_hash,
                )
                .await?;
                return Err(err.into());
            }
        };

        let clusters = if options.enable_clustering {
            centroid::compute_cluster_centroids(&faces, &options.cluster_params)
        } else {
            Vec::new()
        };

        let created_at = Utc::now().to_rfc3339();
        let mut records = Vec::with_capacity(1 + clusters.len());
        records.push(PersonCentroid {
            id: Uuid::new_v4(),
            person_id,
            model_version: model_version.to_string(),
            centroid_version,
            centroid_type: CentroidType::Global,
            cluster_label: "global".to_string(),
            vector: global,
            n_faces,
            source_hash: source_hash.clone(),
            status: CentroidStatus::Building,
            created_at: created_at.clone(),
        });
        for (cluster_label, vector) in clusters {
            records.push(PersonCentroid {
                id: Uuid::new_v4(),
                person_id,
                model_version: model_version.to_string(),
                centroid_version,
                centroid_type: CentroidType::Cluster,
                cluster_label,
                vector,
                n_faces,
                source_hash: source_hash.clone(),
                status: CentroidStatus::Building,
                created_at: created_at.clone(),
            });
        }

        self.insert_records(records.clone()).await?;

        for record in &records {
            let index_key = centroid_index_key(record);
            let payload = IndexPayload {
                kind: IndexKind::Centroid,
                person_id: Some(person_id),
                is_prototype: false,
            };
            let upserted = with_retry(
                "centroid index upsert",
                DEFAULT_MAX_ATTEMPTS,
                DEFAULT_BASE_DELAY,
                || index.upsert(&index_key, &record.vector, payload.clone()),
            )
            .await;
            if let Err(err) = upserted {
                self.mark_failed(records.iter().map(|r| r.id).collect())
                    .await?;
                return Err(err.into());
            }
        }

        // Index entries for labels this rebuild no longer produces (e.g. a
        // cluster split that went away) are best-effort deletes: the
        // metadata rows stay authoritative either way.
        let new_keys: HashSet<String> = records.iter().map(centroid_index_key).collect();
        for old in previous_active {
            let old_key = centroid_index_key(old);
            if new_keys.contains(&old_key) {
                continue;
            }
            if let Err(err) = with_retry(
                "centroid index delete",
                DEFAULT_MAX_ATTEMPTS,
                DEFAULT_BASE_DELAY,
                || index.delete(&old_key),
            )
            .await
            {
                tracing::warn!(key = %old_key, error = %err, "failed to delete superseded index entry");
            }
        }

        self.activate(person_id, model_version, centroid_version, &records)
            .await?;

        tracing::info!(
            person_id = %person_id,
            n_faces,
            n_clusters = records.len() - 1,
            source_hash = %source_hash,
            "rebuilt centroids"
        );

        let centroids = self
            .get_active(person_id, model_version, centroid_version)
            .await?;
        Ok(CentroidSet {
            centroids,
            rebuilt: true,
            rebuild_pending: false,
        })
    }

    async fn insert_records(&self, records: Vec<PersonCentroid>) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO person_centroids
                         (id, person_id, model_version, centroid_version, centroid_type,
                          cluster_label, vector, n_faces, source_hash, status, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    )?;
                    for r in &records {
                        stmt.execute(params![
                            r.id.to_string(),
                            r.person_id.to_string(),
                            r.model_version,
                            r.centroid_version,
                            r.centroid_type.as_str(),
                            r.cluster_label,
                            vector_to_blob(&r.vector),
                            r.n_faces as i64,
                            r.source_hash,
                            r.status.as_str(),
                            r.created_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// The single ordering-sensitive transition: deprecate old actives and
    /// activate the new rows in one transaction, so readers see either the
    /// previous set or the new one, never neither.
    async fn activate(
        &self,
        person_id: PersonId,
        model_version: &str,
        centroid_version: u32,
        records: &[PersonCentroid],
    ) -> Result<(), StoreError> {
        let person = person_id.to_string();
        let model = model_version.to_string();
        let new_ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE person_centroids SET status = 'deprecated'
                     WHERE person_id = ?1 AND model_version = ?2 AND centroid_version = ?3
                       AND status = 'active'",
                    params![person, model, centroid_version],
                )?;
                for id in &new_ids {
                    tx.execute(
                        "UPDATE person_centroids SET status = 'active'
                         WHERE id = ?1 AND status = 'building'",
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record a rebuild attempt that could not produce a valid vector.
    /// Terminal; the prior active set is untouched.
    async fn record_failed_attempt(
        &self,
        person_id: PersonId,
        model_version: &str,
        centroid_version: u32,
        n_faces: usize,
        source_hash: &str,
    ) -> Result<(), StoreError> {
        self.insert_records(vec![PersonCentroid {
            id: Uuid::new_v4(),
            person_id,
            model_version: model_version.to_string(),
            centroid_version,
            centroid_type: CentroidType::Global,
            cluster_label: "global".to_string(),
            vector: Vec::new(),
            n_faces,
            source_hash: source_hash.to_string(),
            status: CentroidStatus::Failed,
            created_at: Utc::now().to_rfc3339(),
        }])
        .await
    }

    async fn mark_failed(&self, ids: Vec<Uuid>) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE person_centroids SET status = 'failed'
                         WHERE id = ?1 AND status = 'building'",
                        params![id.to_string()],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn row_to_centroid(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersonCentroid> {
    let id: String = row.get(0)?;
    let person_id: String = row.get(1)?;
    let centroid_version: i64 = row.get(3)?;
    let centroid_type: String = row.get(4)?;
    let blob: Vec<u8> = row.get(6)?;
    let n_faces: i64 = row.get(7)?;
    let status: String = row.get(9)?;
    Ok(PersonCentroid {
        id: parse_uuid(0, &id)?,
        person_id: parse_uuid(1, &person_id)?,
        model_version: row.get(2)?,
        centroid_version: centroid_version as u32,
        centroid_type: CentroidType::parse(&centroid_type).map_err(|e| conv_err(4, e))?,
        cluster_label: row.get(5)?,
        vector: vector_from_blob(&blob).map_err(|e| conv_err(6, e))?,
        n_faces: n_faces as usize,
        source_hash: row.get(8)?,
        status: CentroidStatus::parse(&status).map_err(|e| conv_err(9, e))?,
        created_at: row.get(10)?,
    })
}
