//! Built-in axes.
//!
//! | Axis | Score | Source |
//! |------|-------|--------|
//! | [`RecallAxis`] (`recall`) | number of recalled posts | [`RecallActor`] |
//! | [`RelevanceAxis`] (`relevance`) | number of relevant recent posts | [`RelevanceJudge`] |

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use muse_memory::{ChunkBudget, RecallActor, chunk};
use muse_types::{AxisInput, AxisOutput, MuseError, TimestampedRecord};
use tracing::debug;

use crate::axis::{Axis, AxisError};
use crate::llm_driver::RelevanceVerdict;

/// Chunk budget for relevance checks, in characters.
pub const DEFAULT_RELEVANCE_BUDGET: usize = 1_000_000;

/// Reason and reply text used when nothing relevant is remembered.
pub const NO_RELEVANT_MEMORIES: &str = "I do not have any relevant memories about that.";

/// Decides which posts of one chunk bear on a message.
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    async fn judge(&self, query: &str, posts: &[TimestampedRecord]) -> Result<RelevanceVerdict, MuseError>;
}

fn owner_of<'a>(fixed: Option<&'a str>, input: &'a AxisInput) -> Result<&'a str, AxisError> {
    fixed
        .or_else(|| input.owner_profile.as_deref().map(|p| p.name.as_str()))
        .filter(|o| !o.is_empty())
        .ok_or(AxisError::MissingInput("owner"))
}

// ─────────────────────────────────────────────────────────────────────────────
// RecallAxis
// ─────────────────────────────────────────────────────────────────────────────

/// Scores a message by how much of the owner's history it recalls.
pub struct RecallAxis {
    actor: RecallActor,
    owner: Option<String>,
}

impl RecallAxis {
    /// Recall for whichever character the input's profile names.
    pub fn new(actor: RecallActor) -> Self {
        Self { actor, owner: None }
    }

    /// Always recall for `owner`, ignoring the input's profile.
    pub fn for_owner(actor: RecallActor, owner: impl Into<String>) -> Self {
        Self {
            actor,
            owner: Some(owner.into()),
        }
    }
}

#[async_trait]
impl Axis for RecallAxis {
    fn name(&self) -> &str {
        "recall"
    }

    async fn run(&self, input: &AxisInput) -> Result<AxisOutput, AxisError> {
        let owner = owner_of(self.owner.as_deref(), input)?;
        let hits = self.actor.recall(owner, &input.user_text).await;
        let reason = match hits.first() {
            Some(top) => format!("Top recall: {}", top.record.text),
            None => "No relevant posts found".to_string(),
        };
        Ok(AxisOutput::new("recall", hits.len() as i64, reason))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RelevanceAxis
// ─────────────────────────────────────────────────────────────────────────────

/// Scores a message by how many of the input's recent posts a judge finds
/// relevant to it. Chunks are judged concurrently; any judge failure fails
/// the axis.
pub struct RelevanceAxis {
    judge: Arc<dyn RelevanceJudge>,
    budget: ChunkBudget,
}

impl RelevanceAxis {
    pub fn new(judge: Arc<dyn RelevanceJudge>) -> Self {
        Self::with_budget(judge, ChunkBudget::new(DEFAULT_RELEVANCE_BUDGET))
    }

    pub fn with_budget(judge: Arc<dyn RelevanceJudge>, budget: ChunkBudget) -> Self {
        Self { judge, budget }
    }
}

/// The posts of `records` that `judge` finds relevant to `query`, in order.
pub async fn relevant_posts(
    judge: &dyn RelevanceJudge,
    query: &str,
    records: &[TimestampedRecord],
    budget: ChunkBudget,
) -> Result<Vec<TimestampedRecord>, MuseError> {
    let chunks = chunk(records, budget);
    debug!(records = records.len(), chunks = chunks.len(), "judging relevance");
    let verdicts = try_join_all(chunks.iter().map(|c| judge.judge(query, c))).await?;

    let mut relevant = Vec::new();
    for (posts, verdict) in chunks.iter().zip(&verdicts) {
        for idx in verdict.valid_indexes(posts.len()) {
            relevant.push(posts[idx].clone());
        }
    }
    Ok(relevant)
}

#[async_trait]
impl Axis for RelevanceAxis {
    fn name(&self) -> &str {
        "relevance"
    }

    async fn run(&self, input: &AxisInput) -> Result<AxisOutput, AxisError> {
        let relevant = relevant_posts(
            self.judge.as_ref(),
            &input.user_text,
            &input.recent_memory,
            self.budget,
        )
        .await?;
        let reason = match relevant.first() {
            Some(post) => format!("Most relevant: {}", post.text),
            None => NO_RELEVANT_MEMORIES.to_string(),
        };
        Ok(AxisOutput::new("relevance", relevant.len() as i64, reason))
    }
}
