//! [`MemoryCore`] – the surface chat front ends talk to.
//!
//! Bundles a [`MemoryStore`] handle and a [`RecallActor`] handle and adds
//! axis dispatch. Cloning is cheap: both handles are channel senders.
//!
//! | Operation | Backed by |
//! |-----------|-----------|
//! | [`append_message`](MemoryCore::append_message) | memory store append + scheduled refresh |
//! | [`get_summary`](MemoryCore::get_summary) | memory store latest snapshot |
//! | [`recall`](MemoryCore::recall) | recall actor (never fails) |
//! | [`run_immediate_axes`](MemoryCore::run_immediate_axes) | [`run_immediate`] |
//! | [`start_background`](MemoryCore::start_background) | [`BackgroundProcessor`] |
//! | [`prepare_reply`](MemoryCore::prepare_reply) | memory extraction, then all of the above |
//!
//! With a [`MemoryExtraction`] attached, [`prepare_reply`](MemoryCore::prepare_reply)
//! first asks the relevance judge which of the character's archived posts
//! bear on the message, condenses those through the summarizer, and logs
//! the result as a `memory` event ahead of the message. The next summary
//! refresh folds it in like any other event.

use std::sync::Arc;

use muse_memory::{ChunkBudget, MemoryStore, RecallActor, Summarizer};
use muse_types::{
    AxisInput, AxisOutput, ContextEvent, MuseError, NewContextEvent, ScoredRecord, SummarySnapshot,
    TimestampedRecord,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::axes::{DEFAULT_RELEVANCE_BUDGET, NO_RELEVANT_MEMORIES, RelevanceJudge, relevant_posts};
use crate::axis::{SharedAxis, run_immediate};
use crate::background::{BackgroundConfig, BackgroundProcessor};
use crate::persona::format_reply_context;

/// Everything a reply needs besides the character.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    /// The stored form of the incoming message.
    pub event: ContextEvent,
    /// The memory extracted for this message, as logged.
    pub memory: Option<ContextEvent>,
    pub summary: SummarySnapshot,
    pub recalled: Vec<ScoredRecord>,
}

impl ReplyContext {
    /// Text block to place ahead of the user's message.
    pub fn prompt_context(&self) -> String {
        format_reply_context(
            &self.summary,
            self.memory.as_ref().map(|m| m.text.as_str()),
            &self.recalled,
        )
    }
}

/// Render posts for extraction, numbered from 0.
pub fn format_memory_posts(posts: &[TimestampedRecord]) -> String {
    let mut out = String::new();
    for (i, p) in posts.iter().enumerate() {
        out.push_str(&format!("Post {i} by {} at {}:\n{}\n\n", p.author, p.unix_time, p.text));
    }
    out
}

/// Relevance filter plus extraction over a character's archived posts.
#[derive(Clone)]
pub struct MemoryExtraction {
    judge: Arc<dyn RelevanceJudge>,
    summarizer: Arc<dyn Summarizer>,
    budget: ChunkBudget,
}

impl MemoryExtraction {
    pub fn new(judge: Arc<dyn RelevanceJudge>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            judge,
            summarizer,
            budget: ChunkBudget::new(DEFAULT_RELEVANCE_BUDGET),
        }
    }

    pub fn with_budget(mut self, budget: ChunkBudget) -> Self {
        self.budget = budget;
        self
    }

    /// What `posts` say about `query`, or `None` when no post is relevant
    /// or the summarizer reports nothing relevant.
    pub async fn extract(
        &self,
        query: &str,
        posts: &[TimestampedRecord],
    ) -> Result<Option<String>, MuseError> {
        if posts.is_empty() {
            return Ok(None);
        }
        let relevant = relevant_posts(self.judge.as_ref(), query, posts, self.budget).await?;
        debug!(posts = posts.len(), relevant = relevant.len(), "relevance filtered");
        if relevant.is_empty() {
            return Ok(None);
        }
        let memory = self
            .summarizer
            .extract_relevant(query, &format_memory_posts(&relevant))
            .await?;
        let memory = memory.trim();
        if memory.is_empty() || memory == NO_RELEVANT_MEMORIES {
            return Ok(None);
        }
        Ok(Some(memory.to_string()))
    }
}

#[derive(Clone)]
pub struct MemoryCore {
    store: MemoryStore,
    recall: RecallActor,
    extraction: Option<MemoryExtraction>,
}

impl MemoryCore {
    pub fn new(store: MemoryStore, recall: RecallActor) -> Self {
        Self {
            store,
            recall,
            extraction: None,
        }
    }

    /// Extract and log memories in [`prepare_reply`](Self::prepare_reply).
    pub fn with_extraction(mut self, extraction: MemoryExtraction) -> Self {
        self.extraction = Some(extraction);
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn recall_actor(&self) -> &RecallActor {
        &self.recall
    }

    pub async fn append_message(
        &self,
        channel: &str,
        author_id: &str,
        username: &str,
        text: &str,
        time: i64,
    ) -> Result<ContextEvent, MuseError> {
        self.store
            .append_message(channel, author_id, username, text, time)
            .await
    }

    pub async fn get_summary(&self, channel: &str) -> Result<SummarySnapshot, MuseError> {
        self.store.latest_summary(channel).await
    }

    pub async fn recall(&self, owner: &str, text: &str) -> Vec<ScoredRecord> {
        self.recall.recall(owner, text).await
    }

    pub async fn run_immediate_axes(
        &self,
        input: AxisInput,
        axes: &[SharedAxis],
        cancel: CancellationToken,
    ) -> Vec<AxisOutput> {
        run_immediate(input, axes, cancel).await
    }

    pub fn start_background(
        &self,
        axes: Vec<SharedAxis>,
        config: BackgroundConfig,
    ) -> (BackgroundProcessor, mpsc::Receiver<AxisOutput>) {
        BackgroundProcessor::start(axes, config)
    }

    /// Extract a memory from `owner_posts` and log it ahead of the message.
    ///
    /// Best effort: failures are logged and yield `None`.
    async fn remember(
        &self,
        message: &NewContextEvent,
        owner_posts: &[TimestampedRecord],
    ) -> Option<ContextEvent> {
        let extraction = self.extraction.as_ref()?;
        let memory = match extraction.extract(&message.text, owner_posts).await {
            Ok(Some(memory)) => memory,
            Ok(None) => return None,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "memory extraction failed");
                return None;
            }
        };
        match self
            .store
            .append_memory(&message.channel, &memory, message.time)
            .await
        {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "extracted memory not stored");
                None
            }
        }
    }

    /// Log a memory extracted from `owner_posts` (when extraction is
    /// configured), store `message`, schedule a summary refresh, then fetch
    /// the latest summary and `owner`'s recall concurrently.
    ///
    /// The summary is whatever was last committed; it may not yet include
    /// the memory or `message`.
    pub async fn prepare_reply(
        &self,
        message: NewContextEvent,
        owner: &str,
        owner_posts: &[TimestampedRecord],
    ) -> Result<ReplyContext, MuseError> {
        let memory = self.remember(&message, owner_posts).await;

        let channel = message.channel.clone();
        let query = message.text.clone();
        let event = self.store.append(message).await?;
        self.store.schedule_refresh(&channel).await?;

        let (summary, recalled) = tokio::join!(
            self.store.latest_summary(&channel),
            self.recall.recall(owner, &query),
        );
        let summary = summary?;
        debug!(
            channel = %channel,
            owner,
            remembered = memory.is_some(),
            recalled = recalled.len(),
            summarized = summary.covered_event_ids.len(),
            "reply context ready"
        );
        Ok(ReplyContext {
            event,
            memory,
            summary,
            recalled,
        })
    }
}
