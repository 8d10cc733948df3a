//! Embedding-source seam: where labeled face embeddings come from.
//!
//! Centroid computation only ever sees confirmed labels. Faces whose
//! assignment is still pending human review are excluded at the source, so
//! suggested-but-unreviewed faces can never feed back into the centroid
//! that suggested them.

use crate::blob::{vector_from_blob, vector_to_blob};
use async_trait::async_trait;
use kindred_core::types::{FaceEmbedding, FaceId, PersonId};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// Default page size for embedding fetches. Bounded paging keeps rebuild
/// memory proportional to one page, not one person's whole face history.
pub const DEFAULT_PAGE_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("embedding source unavailable: {0}")]
    Unavailable(String),
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

/// Read-only, paginated access to a person's confirmed face embeddings.
#[async_trait]
pub trait EmbeddingSource: Send + Sync {
    /// One page, ordered stably by face id. Offsets are in faces.
    async fn face_page(
        &self,
        person_id: PersonId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FaceEmbedding>, SourceError>;
}

/// Drain every page for `person_id`. The page size bounds each fetch; the
/// result is still the full set, in the source's stable order.
pub async fn fetch_all_faces(
    source: &dyn EmbeddingSource,
    person_id: PersonId,
    page_size: usize,
) -> Result<Vec<FaceEmbedding>, SourceError> {
    let page_size = page_size.max(1);
    let mut faces = Vec::new();
    let mut offset = 0;
    loop {
        let page = source.face_page(person_id, offset, page_size).await?;
        let got = page.len();
        faces.extend(page);
        if got < page_size {
            return Ok(faces);
        }
        offset += got;
    }
}

/// One stored face row: embedding plus the labeling state around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub face_id: FaceId,
    pub person_id: Option<PersonId>,
    pub vector: Vec<f32>,
    pub is_prototype: bool,
    /// Confirmed labels feed centroids; pending ones never do.
    pub confirmed: bool,
}

/// [`EmbeddingSource`] backed by a `faces` table in SQLite. Shares a
/// connection with [`CentroidStore`](crate::store::CentroidStore) when both
/// live in one file.
#[derive(Clone)]
pub struct SqliteEmbeddingSource {
    conn: Connection,
}

const FACES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    face_id      TEXT PRIMARY KEY,
    person_id    TEXT,
    embedding    BLOB NOT NULL,
    is_prototype INTEGER NOT NULL DEFAULT 0,
    confirmed    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces (person_id, confirmed);
";

impl SqliteEmbeddingSource {
    /// Attach to (and if needed create) the faces table on `conn`.
    pub async fn attach(conn: Connection) -> Result<Self, SourceError> {
        conn.call(|conn| {
            conn.execute_batch(FACES_SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn insert_faces(&self, faces: Vec<FaceRecord>) -> Result<usize, SourceError> {
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR REPLACE INTO faces
                         (face_id, person_id, embedding, is_prototype, confirmed)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for face in &faces {
                        stmt.execute(params![
                            face.face_id.to_string(),
                            face.person_id.map(|id| id.to_string()),
                            vector_to_blob(&face.vector),
                            face.is_prototype,
                            face.confirmed,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(faces.len())
            })
            .await?;
        Ok(inserted)
    }

    /// Every stored face, for index loading and diagnostics.
    pub async fn all_faces(&self) -> Result<Vec<FaceRecord>, SourceError> {
        let faces = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT face_id, person_id, embedding, is_prototype, confirmed
                     FROM faces ORDER BY face_id",
                )?;
                let faces = stmt
                    .query_map([], row_to_face)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(faces)
            })
            .await?;
        Ok(faces)
    }
}

#[async_trait]
impl EmbeddingSource for SqliteEmbeddingSource {
    async fn face_page(
        &self,
        person_id: PersonId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FaceEmbedding>, SourceError> {
        let person = person_id.to_string();
        let faces = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT face_id, embedding FROM faces
                     WHERE person_id = ?1 AND confirmed = 1
                     ORDER BY face_id LIMIT ?2 OFFSET ?3",
                )?;
                let faces = stmt
                    .query_map(params![person, limit as i64, offset as i64], |row| {
                        let face_id: String = row.get(0)?;
                        let blob: Vec<u8> = row.get(1)?;
                        Ok(FaceEmbedding {
                            face_id: parse_uuid(0, &face_id)?,
                            vector: vector_from_blob(&blob).map_err(|e| conv_err(1, e))?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(faces)
            })
            .await?;
        Ok(faces)
    }
}

fn row_to_face(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceRecord> {
    let face_id: String = row.get(0)?;
    let person_id: Option<String> = row.get(1)?;
    let blob: Vec<u8> = row.get(2)?;
    Ok(FaceRecord {
        face_id: parse_uuid(0, &face_id)?,
        person_id: person_id
            .map(|id| parse_uuid(1, &id))
            .transpose()?,
        vector: vector_from_blob(&blob).map_err(|e| conv_err(2, e))?,
        is_prototype: row.get(3)?,
        confirmed: row.get(4)?,
    })
}

pub(crate) fn parse_uuid(idx: usize, value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| conv_err(idx, e))
}

pub(crate) fn conv_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
