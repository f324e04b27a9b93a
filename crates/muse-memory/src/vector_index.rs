//! Vector recall store.
//!
//! [`VectorIndex`] is the seam between the recall path and whatever answers
//! nearest-neighbour queries. Two backends ship with the crate:
//!
//! * [`crate::qdrant::QdrantIndex`] talks to a Qdrant server over REST.
//! * [`SqliteVectorIndex`] is a local brute-force cosine index, used for
//!   tests and offline runs.
//!
//! Both honour the same contract: an index records its dimensionality when
//! first created, every vector written to or queried against it must match
//! that dimensionality, and upserts are keyed by record id.
//!
//! # Storage layout (SQLite backend)
//!
//! | table            | column         | type    | description                       |
//! |------------------|----------------|---------|-----------------------------------|
//! | `vector_indexes` | name           | TEXT    | Index (collection) name           |
//! |                  | dimensionality | INTEGER | Fixed vector size                 |
//! | `vector_records` | index_name     | TEXT    | Owning index                      |
//! |                  | id             | INTEGER | Record id (u64 bit pattern)       |
//! |                  | owner          | TEXT    | Owner used for filtering          |
//! |                  | text           | TEXT    | Embedded text                     |
//! |                  | metadata       | TEXT    | JSON object                       |
//! |                  | embedding      | BLOB    | Little-endian f32 (4 × N bytes)   |
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use muse_memory::vector_index::{SqliteVectorIndex, VectorIndex};
//! use muse_types::EmbeddedRecord;
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let index = SqliteVectorIndex::open_in_memory().unwrap();
//!     index.ensure_index("forum_posts", 2).await.unwrap();
//!     index
//!         .upsert("forum_posts", &[EmbeddedRecord {
//!             id: 1,
//!             owner: "naoki".into(),
//!             text: "The war was long.".into(),
//!             vector: vec![1.0, 0.0],
//!             metadata: BTreeMap::new(),
//!         }])
//!         .await
//!         .unwrap();
//!
//!     let hits = index.query("forum_posts", &[1.0, 0.0], Some("naoki"), 5).await.unwrap();
//!     assert_eq!(hits[0].record.id, 1);
//! });
//! ```

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use muse_types::{EmbeddedRecord, MuseError, ScoredRecord};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Index not found: {0}")]
    IndexNotFound(String),
    #[error("Unexpected response from vector index: {0}")]
    BadResponse(String),
    #[error("Vector index unavailable: {0}")]
    Unavailable(String),
}

impl From<VectorIndexError> for MuseError {
    fn from(e: VectorIndexError) -> Self {
        match e {
            VectorIndexError::DimensionMismatch { .. } => MuseError::DataIntegrity(e.to_string()),
            VectorIndexError::Sqlite(_) | VectorIndexError::Unavailable(_) => {
                MuseError::StoreUnavailable(e.to_string())
            }
            _ => MuseError::ExternalService(e.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Approximate nearest-neighbour index over [`EmbeddedRecord`] vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create `name` if absent. An existing index with another
    /// dimensionality is an error.
    async fn ensure_index(&self, name: &str, dimensionality: usize) -> Result<(), VectorIndexError>;

    /// Insert or replace `records` by id. Fails as a whole.
    async fn upsert(&self, name: &str, records: &[EmbeddedRecord]) -> Result<(), VectorIndexError>;

    /// Up to `top_k` records ranked by cosine similarity, highest first,
    /// optionally restricted to one owner.
    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        owner: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Numeric record id for a post id.
///
/// Numeric post ids are used as-is; anything else goes through a
/// deterministic string hash.
pub fn record_id(post_id: &str) -> u64 {
    post_id.parse::<u64>().unwrap_or_else(|_| hash_string(post_id))
}

/// `h = 31 * h + c` over the characters, as a non-negative value.
pub fn hash_string(s: &str) -> u64 {
    let h = s
        .chars()
        .fold(0i64, |h, c| h.wrapping_mul(31).wrapping_add(c as i64));
    h.wrapping_abs() as u64
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteVectorIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Brute-force cosine index persisted in SQLite.
pub struct SqliteVectorIndex {
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    pub fn open(path: &str) -> Result<Self, VectorIndexError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, VectorIndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, VectorIndexError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vector_indexes (
                name           TEXT NOT NULL PRIMARY KEY,
                dimensionality INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vector_records (
                index_name TEXT NOT NULL,
                id         INTEGER NOT NULL,
                owner      TEXT NOT NULL,
                text       TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                PRIMARY KEY (index_name, id)
            );
            CREATE INDEX IF NOT EXISTS vector_records_owner ON vector_records (index_name, owner);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, VectorIndexError> {
        self.conn
            .lock()
            .map_err(|_| VectorIndexError::Unavailable("connection lock poisoned".into()))
    }

    fn dimensionality(conn: &Connection, name: &str) -> Result<Option<usize>, VectorIndexError> {
        let dim: Option<i64> = conn
            .query_row(
                "SELECT dimensionality FROM vector_indexes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(dim.map(|d| d as usize))
    }

    fn require_dimensionality(conn: &Connection, name: &str) -> Result<usize, VectorIndexError> {
        Self::dimensionality(conn, name)?.ok_or_else(|| VectorIndexError::IndexNotFound(name.into()))
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_index(&self, name: &str, dimensionality: usize) -> Result<(), VectorIndexError> {
        let conn = self.lock()?;
        match Self::dimensionality(&conn, name)? {
            Some(existing) if existing != dimensionality => Err(VectorIndexError::DimensionMismatch {
                expected: existing,
                actual: dimensionality,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO vector_indexes (name, dimensionality) VALUES (?1, ?2)",
                    params![name, dimensionality as i64],
                )?;
                Ok(())
            }
        }
    }

    async fn upsert(&self, name: &str, records: &[EmbeddedRecord]) -> Result<(), VectorIndexError> {
        let mut conn = self.lock()?;
        let dim = Self::require_dimensionality(&conn, name)?;
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dim) {
            return Err(VectorIndexError::DimensionMismatch {
                expected: dim,
                actual: bad.vector.len(),
            });
        }
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO vector_records
                     (index_name, id, owner, text, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                stmt.execute(params![
                    name,
                    r.id as i64,
                    r.owner,
                    r.text,
                    serde_json::to_string(&r.metadata)?,
                    vector_to_blob(&r.vector),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        owner: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError> {
        let conn = self.lock()?;
        let dim = Self::require_dimensionality(&conn, name)?;
        if vector.len() != dim {
            return Err(VectorIndexError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, owner, text, metadata, embedding FROM vector_records
             WHERE index_name = ?1 AND (?2 IS NULL OR owner = ?2)",
        )?;
        let rows = stmt.query_map(params![name, owner], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, owner, text, metadata, blob) = row?;
            let embedding = blob_to_vector(&blob);
            let score = cosine_similarity(&embedding, vector);
            let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&metadata)?;
            scored.push(ScoredRecord {
                record: EmbeddedRecord {
                    id: id as u64,
                    owner,
                    text,
                    vector: embedding,
                    metadata,
                },
                score,
            });
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, owner: &str, vector: Vec<f32>) -> EmbeddedRecord {
        EmbeddedRecord {
            id,
            owner: owner.into(),
            text: format!("post {id}"),
            vector,
            metadata: BTreeMap::new(),
        }
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn cosine_identical_and_orthogonal() {
        let v = [1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn numeric_post_ids_are_kept() {
        assert_eq!(record_id("12345"), 12345);
    }

    #[test]
    fn non_numeric_post_ids_hash_deterministically() {
        assert_eq!(record_id("p-abc"), record_id("p-abc"));
        assert_ne!(record_id("p-abc"), record_id("p-abd"));
        // 31 * 'a' + 'b' = 31 * 97 + 98
        assert_eq!(hash_string("ab"), 3105);
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.5f32, -0.25, 42.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }

    // ── SqliteVectorIndex ────────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_index_is_idempotent() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 3).await.unwrap();
        idx.ensure_index("posts", 3).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_index_rejects_other_dimensionality() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 3).await.unwrap();
        let err = idx.ensure_index("posts", 4).await.unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::DimensionMismatch { expected: 3, actual: 4 }
        ));
    }

    #[tokio::test]
    async fn upsert_into_missing_index_fails() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        let err = idx.upsert("nope", &[record(1, "a", vec![1.0])]).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::IndexNotFound(_)));
    }

    #[tokio::test]
    async fn upsert_with_wrong_dimension_writes_nothing() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 2).await.unwrap();
        let batch = [record(1, "a", vec![1.0, 0.0]), record(2, "a", vec![1.0])];
        assert!(idx.upsert("posts", &batch).await.is_err());
        assert!(idx.query("posts", &[1.0, 0.0], None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_ranks_and_filters_by_owner() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 2).await.unwrap();
        idx.upsert(
            "posts",
            &[
                record(1, "naoki", vec![1.0, 0.0]),
                record(2, "naoki", vec![0.7, 0.7]),
                record(3, "naoki", vec![0.0, 1.0]),
                record(4, "puck", vec![1.0, 0.0]),
            ],
        )
        .await
        .unwrap();

        let hits = idx.query("posts", &[1.0, 0.0], Some("naoki"), 2).await.unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.record.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(hits[0].score >= hits[1].score);

        let all = idx.query("posts", &[1.0, 0.0], None, 10).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn query_unknown_owner_is_empty() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 2).await.unwrap();
        idx.upsert("posts", &[record(1, "puck", vec![1.0, 0.0])]).await.unwrap();
        let hits = idx.query("posts", &[1.0, 0.0], Some("naoki"), 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 2).await.unwrap();
        idx.upsert("posts", &[record(1, "a", vec![1.0, 0.0])]).await.unwrap();
        let mut updated = record(1, "a", vec![0.0, 1.0]);
        updated.text = "edited".into();
        idx.upsert("posts", &[updated]).await.unwrap();
        let hits = idx.query("posts", &[0.0, 1.0], None, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "edited");
    }

    #[tokio::test]
    async fn query_with_wrong_dimension_fails() {
        let idx = SqliteVectorIndex::open_in_memory().unwrap();
        idx.ensure_index("posts", 2).await.unwrap();
        let err = idx.query("posts", &[1.0, 0.0, 0.0], None, 5).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::DimensionMismatch { .. }));
        let mapped: MuseError = err.into();
        assert!(matches!(mapped, MuseError::DataIntegrity(_)));
    }
}
