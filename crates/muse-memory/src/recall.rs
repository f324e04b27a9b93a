//! Recall actor.
//!
//! Serializes every recall request through one worker: embed the query
//! text, then search the vector index for the owner's closest records.
//! Recall is best effort. Any failure along the way is logged and answered
//! with an empty list, and every request gets exactly one answer.

use std::sync::Arc;

use async_trait::async_trait;
use muse_types::{MuseError, ScoredRecord};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::vector_index::VectorIndex;

/// Default number of records returned per recall.
pub const DEFAULT_TOP_K: usize = 5;
/// Default embedding dimensionality (OpenAI `text-embedding-3-small`).
pub const DEFAULT_DIMENSIONALITY: usize = 1536;
/// Default collection holding embedded forum posts.
pub const DEFAULT_COLLECTION: &str = "forum_posts";

/// External text embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MuseError>;

    /// Embed several texts, one vector per text in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MuseError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct RecallConfig {
    pub collection: String,
    /// Expected length of every query embedding.
    pub dimensionality: usize,
    pub top_k: usize,
    /// Capacity of the request mailbox.
    pub mailbox: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.into(),
            dimensionality: DEFAULT_DIMENSIONALITY,
            top_k: DEFAULT_TOP_K,
            mailbox: 32,
        }
    }
}

struct RecallRequest {
    owner: String,
    text: String,
    reply: oneshot::Sender<Vec<ScoredRecord>>,
}

/// Handle to the recall worker.
#[derive(Clone)]
pub struct RecallActor {
    tx: mpsc::Sender<RecallRequest>,
}

impl RecallActor {
    /// Start the worker. Must be called from within a Tokio runtime.
    pub fn spawn(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, config: RecallConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox.max(1));
        tokio::spawn(run(rx, embedder, index, config));
        Self { tx }
    }

    /// The `top_k` records of `owner` closest to `text`.
    ///
    /// Never fails: an embedding error, an index error or a stopped worker
    /// all yield an empty list.
    pub async fn recall(&self, owner: &str, text: &str) -> Vec<ScoredRecord> {
        let (reply, rx) = oneshot::channel();
        let request = RecallRequest {
            owner: owner.to_string(),
            text: text.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            warn!(owner, "recall worker is gone");
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

async fn run(
    mut rx: mpsc::Receiver<RecallRequest>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: RecallConfig,
) {
    let config = Arc::new(config);
    while let Some(req) = rx.recv().await {
        let lookup = tokio::spawn(lookup(
            Arc::clone(&embedder),
            Arc::clone(&index),
            Arc::clone(&config),
            req.owner.clone(),
            req.text,
        ));
        let records = match lookup.await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                warn!(owner = %req.owner, error = %e, "recall failed");
                Vec::new()
            }
            Err(e) => {
                warn!(owner = %req.owner, error = %e, "recall task failed");
                Vec::new()
            }
        };
        debug!(owner = %req.owner, hits = records.len(), "recall answered");
        // The caller may have given up waiting.
        let _ = req.reply.send(records);
    }
}

async fn lookup(
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: Arc<RecallConfig>,
    owner: String,
    text: String,
) -> Result<Vec<ScoredRecord>, MuseError> {
    let vector = embedder.embed(&text).await?;
    if vector.len() != config.dimensionality {
        return Err(MuseError::DataIntegrity(format!(
            "embedding has {} dimensions, index expects {}",
            vector.len(),
            config.dimensionality
        )));
    }
    let hits = index
        .query(&config.collection, &vector, Some(owner.as_str()), config.top_k)
        .await?;
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::SqliteVectorIndex;
    use muse_types::EmbeddedRecord;
    use std::collections::BTreeMap;

    /// Maps text onto a 2-d vector by keyword.
    struct Keyword;

    #[async_trait]
    impl Embedder for Keyword {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, MuseError> {
            Ok(if text.contains("war") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }
    }

    struct Failing;

    #[async_trait]
    impl Embedder for Failing {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, MuseError> {
            Err(MuseError::ExternalService("embedding service down".into()))
        }
    }

    struct WrongSize;

    #[async_trait]
    impl Embedder for WrongSize {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, MuseError> {
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    fn config() -> RecallConfig {
        RecallConfig {
            collection: "posts".into(),
            dimensionality: 2,
            top_k: 5,
            mailbox: 4,
        }
    }

    async fn seeded_index() -> Arc<SqliteVectorIndex> {
        let index = SqliteVectorIndex::open_in_memory().unwrap();
        index.ensure_index("posts", 2).await.unwrap();
        let rec = |id: u64, owner: &str, text: &str, v: Vec<f32>| EmbeddedRecord {
            id,
            owner: owner.into(),
            text: text.into(),
            vector: v,
            metadata: BTreeMap::new(),
        };
        index
            .upsert(
                "posts",
                &[
                    rec(1, "puck", "the war of the fae", vec![1.0, 0.0]),
                    rec(2, "puck", "a quiet feast", vec![0.0, 1.0]),
                    rec(3, "oberon", "war council", vec![1.0, 0.1]),
                ],
            )
            .await
            .unwrap();
        Arc::new(index)
    }

    #[tokio::test]
    async fn recall_returns_owner_records_best_first() {
        let actor = RecallActor::spawn(Arc::new(Keyword), seeded_index().await, config());
        let hits = actor.recall("puck", "tell me about the war").await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.text, "the war of the fae");
        assert!(hits.iter().all(|h| h.record.owner == "puck"));
    }

    #[tokio::test]
    async fn unknown_owner_yields_empty() {
        let actor = RecallActor::spawn(Arc::new(Keyword), seeded_index().await, config());
        assert!(actor.recall("naoki", "tell me about the war").await.is_empty());
    }

    #[tokio::test]
    async fn embedder_failure_yields_empty() {
        let actor = RecallActor::spawn(Arc::new(Failing), seeded_index().await, config());
        assert!(actor.recall("puck", "war").await.is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_yields_empty() {
        let actor = RecallActor::spawn(Arc::new(WrongSize), seeded_index().await, config());
        assert!(actor.recall("puck", "war").await.is_empty());
    }

    #[tokio::test]
    async fn missing_index_yields_empty() {
        let index = Arc::new(SqliteVectorIndex::open_in_memory().unwrap());
        let actor = RecallActor::spawn(Arc::new(Keyword), index, config());
        assert!(actor.recall("puck", "war").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_callers_each_get_one_answer() {
        let actor = RecallActor::spawn(Arc::new(Keyword), seeded_index().await, config());
        let mut handles = Vec::new();
        for i in 0..16 {
            let actor = actor.clone();
            handles.push(tokio::spawn(async move {
                let text = if i % 2 == 0 { "war" } else { "feast" };
                actor.recall("puck", text).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            let hits = h.await.unwrap();
            let expected = if i % 2 == 0 { "the war of the fae" } else { "a quiet feast" };
            assert_eq!(hits[0].record.text, expected);
        }
    }
}
