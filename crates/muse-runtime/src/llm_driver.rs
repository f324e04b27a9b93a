//! [`LlmDriver`] – OpenAI-compatible chat and embedding client.
//!
//! One driver serves every model-backed collaborator of the memory core:
//!
//! * [`Summarizer`] – folds new channel events into the rolling summary,
//!   summarizes and combines forum thread sections, and extracts what a
//!   set of relevant posts says about a message.
//! * [`Embedder`] – turns text into vectors through `/v1/embeddings`.
//! * [`RelevanceJudge`] – asks which posts of a chunk matter for a message,
//!   with the answer constrained to the [`RelevanceVerdict`] JSON Schema.
//! * [`LlmDriver::generate_reply`] – the in-character reply itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use muse_runtime::llm_driver::{LlmConfig, LlmDriver};
//!
//! let driver = LlmDriver::new(LlmConfig {
//!     api_key: std::env::var("OPENAI_API_KEY").ok(),
//!     ..LlmConfig::default()
//! });
//!
//! // Requires a reachable endpoint – skipped in unit tests.
//! // let vector = driver.embed_texts(&["hello".into()]).await.unwrap();
//! ```

use async_trait::async_trait;
use muse_memory::{Embedder, Summarizer};
use muse_types::{MuseError, TimestampedRecord};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::axes::RelevanceJudge;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for MuseError {
    fn from(e: LlmError) -> Self {
        MuseError::ExternalService(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Structured answer of a relevance check over one chunk of posts.
///
/// Fields the model omits fall back to "not relevant".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RelevanceVerdict {
    /// Whether any post in the chunk helps answer the message.
    #[serde(default)]
    pub relevant: bool,
    /// Short justification.
    #[serde(default)]
    pub reasons: String,
    /// Zero-based indexes of the relevant posts within the chunk.
    #[serde(default)]
    pub post_indexes: Vec<usize>,
}

impl RelevanceVerdict {
    /// Parse a model answer; anything unparseable counts as not relevant.
    pub fn parse_or_irrelevant(raw: &str) -> Self {
        match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable relevance verdict; treating as not relevant");
                Self::default()
            }
        }
    }

    /// Indexes of relevant posts that exist in a chunk of `len` posts,
    /// ascending and without duplicates. Empty unless `relevant` is set.
    pub fn valid_indexes(&self, len: usize) -> Vec<usize> {
        if !self.relevant {
            return Vec::new();
        }
        let mut idx: Vec<usize> = self.post_indexes.iter().copied().filter(|&i| i < len).collect();
        idx.sort_unstable();
        idx.dedup();
        idx
    }
}

/// Structured answer of a memory extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedMemory {
    /// What the posts say that bears on the message.
    #[serde(default)]
    pub summary: String,
}

impl ExtractedMemory {
    /// Parse a model answer. A server that ignores the schema answers in
    /// plain text, which is taken as the summary itself.
    pub fn parse_or_raw(raw: &str) -> Self {
        let raw = raw.trim();
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            summary: raw.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    schema: serde_json::Value,
}

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn relevance_format() -> ResponseFormat {
    ResponseFormat {
        kind: "json_schema",
        json_schema: JsonSchemaFormat {
            name: "is_relevant",
            schema: serde_json::to_value(schema_for!(RelevanceVerdict))
                .unwrap_or(serde_json::Value::Null),
        },
    }
}

fn extract_format() -> ResponseFormat {
    ResponseFormat {
        kind: "json_schema",
        json_schema: JsonSchemaFormat {
            name: "extract_relevant_info",
            schema: serde_json::to_value(schema_for!(ExtractedMemory))
                .unwrap_or(serde_json::Value::Null),
        },
    }
}

/// Put embeddings back in input order and check there is one per input.
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, LlmError> {
    if data.len() != expected {
        return Err(LlmError::BadResponse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

/// Prompt for a summary refresh; an update prompt when a prior summary
/// exists, a fresh one otherwise.
pub fn summary_prompt(prior: &str, new_events: &str) -> String {
    if prior.trim().is_empty() {
        format!(
            "No prior summary.\nNew chat context to remember:\n{new_events}\n\
             Summarize these messages for memory. Keep important facts, events and relationships."
        )
    } else {
        format!(
            "Previous memory summary for this channel:\n{prior}\n\n\
             New chat context:\n{new_events}\n\
             Fold the new messages into the previous summary. Keep important facts, events \
             and relationships, concise and readable."
        )
    }
}

const FORUM_SUMMARIZER: &str = "You are a skilled fantasy forum summarizer.";

/// Prompt for summarizing one section of a forum thread.
pub fn section_prompt(section: &str) -> String {
    format!(
        "Summarize this section of a forum thread by explaining its key events. \
         Stay close to the tone and feel of the original posts.\n\n\
         Thread section:\n{section}"
    )
}

/// Prompt for merging section summaries, in thread order.
pub fn combine_prompt(parts: &[String]) -> String {
    let mut prompt = String::from(
        "Combine these thread section summaries into one concise but thorough \
         summary of the whole conversation:\n\n",
    );
    for part in parts {
        prompt.push_str(part);
        prompt.push('\n');
    }
    prompt
}

/// Prompt for condensing relevant posts down to what bears on `query`.
pub fn extract_prompt(query: &str, posts: &str) -> String {
    format!(
        "User message:\n{query}\n\nRelevant posts from my memory:\n{posts}\n\n\
         Summarize the important information in these posts as it pertains to the \
         user's message. If none of them are directly relevant, say so clearly."
    )
}

/// Number the posts of a chunk so the model can answer with indexes.
pub fn relevance_prompt(query: &str, posts: &[TimestampedRecord]) -> String {
    let mut listing = String::new();
    for (i, p) in posts.iter().enumerate() {
        listing.push_str(&format!("[{i}] {}: {}\n", p.author, p.text));
    }
    format!(
        "User message:\n{query}\n\nPosts:\n{listing}\n\
         Are any of these posts relevant to answering the user's message? \
         If so, set relevant to true and list the indexes of the relevant posts (starting from 0)."
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// e.g. `"https://api.openai.com"` or `"http://localhost:11434"`.
    pub base_url: String,
    pub chat_model: String,
    pub summary_model: String,
    pub embedding_model: String,
    pub api_key: Option<String>,
    pub summary_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            chat_model: "gpt-4.1-nano".into(),
            summary_model: "gpt-4.1-nano".into(),
            embedding_model: "text-embedding-3-small".into(),
            api_key: None,
            summary_max_tokens: 1000,
        }
    }
}

/// An async client for OpenAI-compatible chat-completion and embedding
/// endpoints. Construct once and share.
pub struct LlmDriver {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmDriver {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let req = self.client.post(url);
        match &self.config.api_key {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    /// One call to the summary model.
    async fn summary_call(
        &self,
        system: Option<&str>,
        prompt: String,
        max_tokens: u32,
        response_format: Option<ResponseFormat>,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat(&ChatRequest {
            model: &self.config.summary_model,
            messages: &messages,
            stream: false,
            max_tokens: Some(max_tokens),
            response_format,
        })
        .await
    }

    async fn chat(&self, body: &ChatRequest<'_>) -> Result<String, LlmError> {
        let response: ChatResponse = self
            .post("/v1/chat/completions")
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// Send `messages` to `model` and return the assistant's reply text.
    pub async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.chat(&ChatRequest {
            model,
            messages,
            stream: false,
            max_tokens: None,
            response_format: None,
        })
        .await
    }

    /// Embed `texts` in one request, preserving input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response: EmbeddingResponse = self
            .post("/v1/embeddings")
            .json(&EmbeddingRequest {
                model: &self.config.embedding_model,
                input: texts,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        order_embeddings(response.data, texts.len())
    }

    /// Produce the in-character reply.
    ///
    /// `context` (summary and recalled memories) is placed ahead of the
    /// user's message.
    pub async fn generate_reply(
        &self,
        system_prompt: &str,
        context: &str,
        user_message: &str,
    ) -> Result<String, LlmError> {
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user(format!("{context}{user_message}")),
        ];
        let reply = self.complete(&self.config.chat_model, &messages).await?;
        Ok(reply.trim().to_string())
    }
}

#[async_trait]
impl Summarizer for LlmDriver {
    async fn summarize(&self, prior: &str, new_events: &str) -> Result<String, MuseError> {
        let summary = self
            .summary_call(None, summary_prompt(prior, new_events), self.config.summary_max_tokens, None)
            .await?;
        debug!(chars = summary.len(), "summary received");
        Ok(summary)
    }

    async fn summarize_section(&self, section: &str) -> Result<String, MuseError> {
        Ok(self
            .summary_call(
                Some(FORUM_SUMMARIZER),
                section_prompt(section),
                self.config.summary_max_tokens,
                None,
            )
            .await?)
    }

    async fn combine(&self, parts: &[String]) -> Result<String, MuseError> {
        Ok(self
            .summary_call(
                Some(FORUM_SUMMARIZER),
                combine_prompt(parts),
                self.config.summary_max_tokens,
                None,
            )
            .await?)
    }

    async fn extract_relevant(&self, query: &str, posts: &str) -> Result<String, MuseError> {
        let raw = self
            .summary_call(None, extract_prompt(query, posts), 1024, Some(extract_format()))
            .await?;
        Ok(ExtractedMemory::parse_or_raw(&raw).summary)
    }
}

#[async_trait]
impl Embedder for LlmDriver {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MuseError> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MuseError::ExternalService("no embedding returned".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MuseError> {
        Ok(self.embed_texts(texts).await?)
    }
}

#[async_trait]
impl RelevanceJudge for LlmDriver {
    async fn judge(&self, query: &str, posts: &[TimestampedRecord]) -> Result<RelevanceVerdict, MuseError> {
        let messages = [ChatMessage::user(relevance_prompt(query, posts))];
        let raw = self
            .chat(&ChatRequest {
                model: &self.config.chat_model,
                messages: &messages,
                stream: false,
                max_tokens: Some(512),
                response_format: Some(relevance_format()),
            })
            .await?;
        Ok(RelevanceVerdict::parse_or_irrelevant(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_serializes_role() {
        let json = serde_json::to_string(&ChatMessage::system("hello")).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn verdict_missing_fields_default_to_irrelevant() {
        let v = RelevanceVerdict::parse_or_irrelevant(r#"{"reasons":"unsure"}"#);
        assert!(!v.relevant);
        assert!(v.post_indexes.is_empty());
        assert_eq!(v.reasons, "unsure");
    }

    #[test]
    fn unparseable_verdict_is_irrelevant() {
        let v = RelevanceVerdict::parse_or_irrelevant("Sure! Posts 1 and 3 look relevant.");
        assert_eq!(v, RelevanceVerdict::default());
    }

    #[test]
    fn valid_indexes_drop_out_of_range_and_duplicates() {
        let v = RelevanceVerdict {
            relevant: true,
            reasons: String::new(),
            post_indexes: vec![3, 0, 7, 3],
        };
        assert_eq!(v.valid_indexes(4), vec![0, 3]);

        let not_relevant = RelevanceVerdict {
            relevant: false,
            ..v
        };
        assert!(not_relevant.valid_indexes(4).is_empty());
    }

    #[test]
    fn extracted_memory_accepts_json_or_plain_text() {
        let json = ExtractedMemory::parse_or_raw(r#" {"summary":"The pact was signed at dawn."} "#);
        assert_eq!(json.summary, "The pact was signed at dawn.");
        let plain = ExtractedMemory::parse_or_raw("  The pact was signed at dawn.\n");
        assert_eq!(plain.summary, "The pact was signed at dawn.");
    }

    #[test]
    fn extract_schema_is_named_for_the_call() {
        let format = serde_json::to_value(extract_format()).unwrap();
        assert_eq!(format["json_schema"]["name"], "extract_relevant_info");
        assert!(format["json_schema"]["schema"].to_string().contains("summary"));
    }

    #[test]
    fn forum_prompts_carry_their_inputs() {
        assert!(section_prompt("naoki:\nhello\n").ends_with("naoki:\nhello\n"));
        let combined = combine_prompt(&["first".into(), "second".into()]);
        assert!(combined.ends_with("first\nsecond\n"));
        let extract = extract_prompt("the war?", "Post 0 by naoki");
        assert!(extract.contains("the war?"));
        assert!(extract.contains("Post 0 by naoki"));
    }

    #[test]
    fn relevance_schema_lists_fields() {
        let format = serde_json::to_value(relevance_format()).unwrap();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["name"], "is_relevant");
        let schema = format["json_schema"]["schema"].to_string();
        assert!(schema.contains("relevant"));
        assert!(schema.contains("post_indexes"));
    }

    #[test]
    fn chat_request_omits_unset_options() {
        let messages = [ChatMessage::user("hi")];
        let body = serde_json::to_value(ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            max_tokens: None,
            response_format: None,
        })
        .unwrap();
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn summary_prompt_switches_on_prior() {
        assert!(summary_prompt("", "[x] a: b\n").starts_with("No prior summary."));
        let update = summary_prompt("They met at the inn.", "[x] a: b\n");
        assert!(update.contains("They met at the inn."));
        assert!(update.contains("[x] a: b"));
    }

    #[test]
    fn relevance_prompt_numbers_posts() {
        let post = |text: &str| TimestampedRecord {
            id: "1".into(),
            owner: "naoki".into(),
            channel: "t".into(),
            author: "naoki".into(),
            text: text.into(),
            unix_time: 0,
        };
        let prompt = relevance_prompt("the war?", &[post("first"), post("second")]);
        assert!(prompt.contains("[0] naoki: first"));
        assert!(prompt.contains("[1] naoki: second"));
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let data = vec![
            EmbeddingData { index: 1, embedding: vec![2.0] },
            EmbeddingData { index: 0, embedding: vec![1.0] },
        ];
        assert_eq!(order_embeddings(data, 2).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn embedding_count_mismatch_is_bad_response() {
        let data = vec![EmbeddingData { index: 0, embedding: vec![1.0] }];
        assert!(matches!(order_embeddings(data, 2), Err(LlmError::BadResponse(_))));
    }
}
