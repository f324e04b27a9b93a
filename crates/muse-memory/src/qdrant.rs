//! [`QdrantIndex`] – [`VectorIndex`] backed by a Qdrant server.
//!
//! Speaks the Qdrant REST API (`http://{host}:{port}`, port 6333 by
//! default). Collections use cosine distance. Each point carries its text
//! under the `message` payload key and its owner under `user`, next to the
//! record's metadata; owner-scoped queries filter on `user`.
//!
//! # Example
//!
//! ```rust,no_run
//! use muse_memory::qdrant::{QdrantConfig, QdrantIndex};
//! use muse_memory::vector_index::VectorIndex;
//!
//! let index = QdrantIndex::new(QdrantConfig::default());
//!
//! // Requires a running Qdrant instance – skipped in unit tests.
//! // index.ensure_index("forum_posts", 1536).await.unwrap();
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use muse_types::{EmbeddedRecord, ScoredRecord};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::vector_index::{VectorIndex, VectorIndexError, record_id};

/// Payload key holding the record owner.
pub const OWNER_KEY: &str = "user";
/// Payload key holding the embedded text.
pub const TEXT_KEY: &str = "message";

/// Where the Qdrant server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdrantConfig {
    pub host: String,
    pub port: u16,
    /// Sent as the `api-key` header when set.
    pub api_key: Option<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6333,
            api_key: None,
        }
    }
}

impl QdrantConfig {
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Async REST client for one Qdrant server.
pub struct QdrantIndex {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantIndex {
    pub fn new(config: QdrantConfig) -> Self {
        Self {
            base_url: config.base_url(),
            api_key: config.api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Vector parameters of a collection (request and response).
#[derive(Debug, Serialize, Deserialize)]
struct VectorParams {
    size: usize,
    #[serde(default)]
    distance: String,
}

#[derive(Debug, Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

impl CreateCollection {
    fn cosine(dimensionality: usize) -> Self {
        Self {
            vectors: VectorParams {
                size: dimensionality,
                distance: "Cosine".into(),
            },
        }
    }
}

/// `GET /collections/{name}` response, reduced to what is checked.
#[derive(Debug, Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorsConfig,
}

/// Collections hold either one unnamed vector or several named ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VectorsConfig {
    Single(VectorParams),
    Named(BTreeMap<String, VectorParams>),
}

impl CollectionInfoResponse {
    /// Configured size of the unnamed vector.
    fn vector_size(&self) -> Option<usize> {
        match &self.result.config.params.vectors {
            VectorsConfig::Single(params) => Some(params.size),
            VectorsConfig::Named(_) => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct UpsertPoints<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Debug, Serialize)]
struct Point<'a> {
    id: u64,
    vector: &'a [f32],
    payload: Payload<'a>,
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    #[serde(rename = "user")]
    owner: &'a str,
    #[serde(rename = "message")]
    text: &'a str,
    #[serde(flatten)]
    metadata: &'a BTreeMap<String, Value>,
}

impl<'a> UpsertPoints<'a> {
    fn from_records(records: &'a [EmbeddedRecord]) -> Self {
        let points = records
            .iter()
            .map(|r| Point {
                id: r.id,
                vector: &r.vector,
                payload: Payload {
                    owner: &r.owner,
                    text: &r.text,
                    metadata: &r.metadata,
                },
            })
            .collect();
        Self { points }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Filter<'a>>,
}

#[derive(Debug, Serialize)]
struct Filter<'a> {
    must: Vec<FieldCondition<'a>>,
}

#[derive(Debug, Serialize)]
struct FieldCondition<'a> {
    key: &'a str,
    #[serde(rename = "match")]
    matches: MatchValue<'a>,
}

#[derive(Debug, Serialize)]
struct MatchValue<'a> {
    value: &'a str,
}

impl<'a> SearchRequest<'a> {
    fn new(vector: &'a [f32], owner: Option<&'a str>, top_k: usize) -> Self {
        Self {
            vector,
            limit: top_k,
            with_payload: true,
            filter: owner.map(|owner| Filter {
                must: vec![FieldCondition {
                    key: OWNER_KEY,
                    matches: MatchValue { value: owner },
                }],
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: PointId,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Option<BTreeMap<String, Value>>,
}

/// Qdrant point ids are unsigned integers or UUID strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PointId {
    Num(u64),
    Uuid(String),
}

impl PointId {
    fn to_record_id(&self) -> u64 {
        match self {
            PointId::Num(n) => *n,
            PointId::Uuid(s) => record_id(s),
        }
    }
}

impl SearchResponse {
    fn into_records(self) -> Vec<ScoredRecord> {
        self.result
            .into_iter()
            .map(|hit| {
                let mut metadata = hit.payload.unwrap_or_default();
                let owner = take_string(&mut metadata, OWNER_KEY);
                let text = take_string(&mut metadata, TEXT_KEY);
                ScoredRecord {
                    record: EmbeddedRecord {
                        id: hit.id.to_record_id(),
                        owner,
                        text,
                        vector: Vec::new(),
                        metadata,
                    },
                    score: hit.score,
                }
            })
            .collect()
    }
}

fn take_string(map: &mut BTreeMap<String, Value>, key: &str) -> String {
    match map.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex impl
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_index(&self, name: &str, dimensionality: usize) -> Result<(), VectorIndexError> {
        let path = format!("/collections/{name}");
        let response = self.request(reqwest::Method::GET, &path).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            self.request(reqwest::Method::PUT, &path)
                .json(&CreateCollection::cosine(dimensionality))
                .send()
                .await?
                .error_for_status()?;
            info!(collection = name, dimensionality, "created qdrant collection");
            return Ok(());
        }

        let info: CollectionInfoResponse = response.error_for_status()?.json().await?;
        match info.vector_size() {
            Some(size) if size == dimensionality => Ok(()),
            Some(size) => Err(VectorIndexError::DimensionMismatch {
                expected: size,
                actual: dimensionality,
            }),
            None => Err(VectorIndexError::BadResponse(format!(
                "collection {name} has no single vector size"
            ))),
        }
    }

    async fn upsert(&self, name: &str, records: &[EmbeddedRecord]) -> Result<(), VectorIndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = format!("/collections/{name}/points?wait=true");
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&UpsertPoints::from_records(records))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(VectorIndexError::IndexNotFound(name.into()));
        }
        response.error_for_status()?;
        debug!(collection = name, points = records.len(), "upserted points");
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        owner: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError> {
        let path = format!("/collections/{name}/points/search");
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&SearchRequest::new(vector, owner, top_k))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(VectorIndexError::IndexNotFound(name.into()));
        }
        let body: SearchResponse = response.error_for_status()?.json().await?;
        Ok(body.into_records())
    }
}
