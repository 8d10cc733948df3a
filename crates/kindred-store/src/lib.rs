//! kindred-store — centroid persistence and the I/O seams around it.
//!
//! Holds the SQLite-backed [`CentroidStore`] (the sole owner of centroid
//! status transitions), the consumed external interfaces ([`EmbeddingSource`],
//! [`VectorIndex`]) with bundled reference implementations, and the per-key
//! locking that makes concurrent rebuilds race-free.

mod blob;
pub mod index;
pub mod lock;
pub mod retry;
pub mod source;
pub mod store;

pub use index::{IndexError, IndexHit, IndexKind, IndexPayload, MemoryIndex, SearchFilter, VectorIndex};
pub use source::{
    fetch_all_faces, EmbeddingSource, FaceRecord, SourceError, SqliteEmbeddingSource,
    DEFAULT_PAGE_SIZE,
};
pub use store::{centroid_index_key, CentroidStore, RebuildOptions, StoreError};
