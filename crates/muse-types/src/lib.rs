use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One immutable, timestamped piece of text: a forum post, a chat line, a
/// recalled memory. The atom handled by the chunker and the recall path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedRecord {
    pub id: String,
    /// Character/user identity the record belongs to (scopes recall).
    pub owner: String,
    /// Thread path or chat channel the record was written in.
    pub channel: String,
    pub author: String,
    pub text: String,
    /// Unix seconds.
    pub unix_time: i64,
}

/// Kind tag stored alongside every [`ContextEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A message somebody sent in the channel.
    Message,
    /// A memory derived by the system (e.g. a recall summary) and folded
    /// back into the channel log.
    Memory,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Memory => "memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EventKind::Message),
            "memory" => Some(EventKind::Memory),
            _ => None,
        }
    }
}

/// An append-only entry of a channel's context log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEvent {
    /// Store-assigned, strictly increasing.
    pub id: i64,
    pub channel: String,
    pub author_id: String,
    pub username: String,
    pub text: String,
    /// Unix seconds.
    pub time: i64,
    pub kind: EventKind,
}

/// A context event that has not been written yet (no id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContextEvent {
    pub channel: String,
    pub author_id: String,
    pub username: String,
    pub text: String,
    pub time: i64,
    pub kind: EventKind,
}

impl NewContextEvent {
    /// A plain chat message.
    pub fn message(
        channel: impl Into<String>,
        author_id: impl Into<String>,
        username: impl Into<String>,
        text: impl Into<String>,
        time: i64,
    ) -> Self {
        Self {
            channel: channel.into(),
            author_id: author_id.into(),
            username: username.into(),
            text: text.into(),
            time,
            kind: EventKind::Message,
        }
    }
}

/// One version of a channel's rolling summary.
///
/// `covered_event_ids` is cumulative: each snapshot carries every id folded
/// by its predecessors followed by the ids it folded itself, in ascending
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub channel: String,
    pub summary_text: String,
    pub covered_event_ids: Vec<i64>,
    /// Unix seconds at which the snapshot was written.
    pub time: i64,
}

impl SummarySnapshot {
    /// The zero snapshot returned for channels that were never summarized.
    pub fn empty(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Greatest event id already folded into this summary (`0` when none).
    pub fn high_water_mark(&self) -> i64 {
        self.covered_event_ids.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.summary_text.is_empty() && self.covered_event_ids.is_empty()
    }
}

/// A record as stored in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub id: u64,
    pub owner: String,
    pub text: String,
    /// Empty when the index was asked not to return vectors.
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl EmbeddedRecord {
    /// Rebuild the [`TimestampedRecord`] the embedding was made from, using
    /// the ingestion metadata where available.
    pub fn to_timestamped(&self) -> TimestampedRecord {
        let str_field = |key: &str| {
            self.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        TimestampedRecord {
            id: str_field("post_id").unwrap_or_else(|| self.id.to_string()),
            owner: self.owner.clone(),
            channel: str_field("thread_id").unwrap_or_default(),
            author: self.owner.clone(),
            text: self.text.clone(),
            unix_time: self
                .metadata
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        }
    }
}

/// An [`EmbeddedRecord`] returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: EmbeddedRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// A named relationship on a character profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The character sheet a persona is played from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub likes: Vec<String>,
    #[serde(default)]
    pub dislikes: Vec<String>,
    #[serde(default)]
    pub fears: Vec<String>,
    #[serde(default)]
    pub catchphrases: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub affiliations: Vec<String>,
    #[serde(default)]
    pub important_relationships: Vec<Relationship>,
}

/// Shared input handed to every axis of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct AxisInput {
    pub user_text: String,
    pub owner_profile: Option<Arc<CharacterProfile>>,
    pub recent_memory: Vec<TimestampedRecord>,
}

/// The verdict of one axis. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisOutput {
    pub axis: String,
    pub score: i64,
    pub reason: String,
    pub time: DateTime<Utc>,
}

impl AxisOutput {
    pub fn new(axis: impl Into<String>, score: i64, reason: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            score,
            reason: reason.into(),
            time: Utc::now(),
        }
    }

    /// Low-information output standing in for an axis that faulted.
    pub fn degraded(axis: impl Into<String>, fault: impl std::fmt::Display) -> Self {
        Self::new(axis, 0, format!("axis fault: {fault}"))
    }
}

/// Cross-crate error type for the memory and recall subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuseError {
    /// The relational store or vector index cannot be reached or opened.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A summarizer, embedder or index call failed.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Data that would break a store invariant (empty summary, wrong
    /// dimensionality, gap in covered ids).
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    /// The actor behind a handle has stopped.
    #[error("Actor closed: {0}")]
    ActorClosed(String),
}
