//! Offline ingestion of archived forum posts into the vector index.
//!
//! Posts are embedded and upserted batch by batch. Every record of one run
//! carries the same `batch_id` so a run can be traced back in the index.

use muse_types::{EmbeddedRecord, MuseError};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::archive::ForumPost;
use crate::recall::Embedder;
use crate::vector_index::{VectorIndex, VectorIndexError, record_id};

/// Default number of posts embedded and upserted together.
pub const DEFAULT_INGEST_BATCH: usize = 100;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Could not prepare index: {0}")]
    Index(#[from] VectorIndexError),
    #[error("Batch of posts {start}..{end} failed: {source}")]
    Batch {
        start: usize,
        end: usize,
        source: MuseError,
    },
}

/// Summary of a completed ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub batch_id: Uuid,
    pub batches: usize,
    pub records: usize,
}

/// Where and how posts are written.
#[derive(Debug, Clone)]
pub struct IngestTarget<'a> {
    pub collection: &'a str,
    pub dimensionality: usize,
    pub batch_size: usize,
}

/// Build the index record for `post`.
pub fn post_to_record(post: &ForumPost, vector: Vec<f32>, batch_id: Uuid) -> EmbeddedRecord {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("post_id".to_string(), json!(post.post_id));
    metadata.insert("thread_id".to_string(), json!(post.thread_path));
    metadata.insert("timestamp".to_string(), json!(post.timestamp));
    metadata.insert("batch_id".to_string(), json!(batch_id.to_string()));
    EmbeddedRecord {
        id: record_id(&post.post_id),
        owner: post.user.clone(),
        text: post.message.clone(),
        vector,
        metadata,
    }
}

/// Embed `posts` and upsert them into `target.collection`.
///
/// The collection is created first if needed. The first failing batch
/// stops the run; batches before it stay written.
pub async fn ingest_posts(
    posts: &[ForumPost],
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    target: IngestTarget<'_>,
) -> Result<IngestReport, IngestError> {
    index
        .ensure_index(target.collection, target.dimensionality)
        .await?;

    let batch_id = Uuid::new_v4();
    let batch_size = target.batch_size.max(1);
    let mut report = IngestReport {
        batch_id,
        batches: 0,
        records: 0,
    };

    for (n, batch) in posts.chunks(batch_size).enumerate() {
        let start = n * batch_size;
        let end = start + batch.len();
        let fail = |source: MuseError| IngestError::Batch { start, end, source };

        let texts: Vec<String> = batch.iter().map(|p| p.message.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await.map_err(fail)?;
        if vectors.len() != batch.len() {
            return Err(fail(MuseError::DataIntegrity(format!(
                "embedder returned {} vectors for {} posts",
                vectors.len(),
                batch.len()
            ))));
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != target.dimensionality) {
            return Err(fail(MuseError::DataIntegrity(format!(
                "embedding has {} dimensions, index expects {}",
                v.len(),
                target.dimensionality
            ))));
        }

        let records: Vec<EmbeddedRecord> = batch
            .iter()
            .zip(vectors)
            .map(|(post, vector)| post_to_record(post, vector, batch_id))
            .collect();
        index
            .upsert(target.collection, &records)
            .await
            .map_err(|e| fail(e.into()))?;

        report.batches += 1;
        report.records += records.len();
        info!(batch = n + 1, start, end, %batch_id, "ingested batch");
    }
    Ok(report)
}
