//! `muse-memory` – The Memory Core.
//!
//! Long-running conversational memory for a roleplay character: a rolling
//! per-channel summary that stands in for the full chat log, and semantic
//! recall over a character's forum history.
//!
//! # Modules
//!
//! - [`chunker`] – [`chunk`][chunker::chunk]: splits ordered records into
//!   contiguous groups under a character budget.
//! - [`context_log`] – [`ContextLog`][context_log::ContextLog]: the SQLite
//!   event log and summary history behind the memory store.
//! - [`memory_store`] – [`MemoryStore`][memory_store::MemoryStore]: the
//!   single-writer actor that appends events and folds them into summaries
//!   through a [`Summarizer`][memory_store::Summarizer].
//! - [`vector_index`] – the [`VectorIndex`][vector_index::VectorIndex] trait
//!   and a local SQLite cosine index.
//! - [`qdrant`] – [`QdrantIndex`][qdrant::QdrantIndex]: the same contract
//!   over the Qdrant REST API.
//! - [`recall`] – [`RecallActor`][recall::RecallActor]: serialized,
//!   best-effort semantic recall through an [`Embedder`][recall::Embedder].
//! - [`archive`] – [`ForumArchive`][archive::ForumArchive]: scraped forum
//!   posts, per-user conversation windows and their stored summaries.
//! - [`ingest`] – [`ingest_posts`][ingest::ingest_posts]: batch embedding of
//!   archived posts into the vector index.

pub mod archive;
pub mod chunker;
pub mod context_log;
pub mod ingest;
pub mod memory_store;
pub mod qdrant;
pub mod recall;
pub mod vector_index;

pub use archive::{ArchiveError, Conversation, ConversationSummary, ForumArchive, ForumPost};
pub use chunker::{ChunkBudget, chunk};
pub use context_log::ContextLog;
pub use memory_store::{MemoryStore, MemoryStoreConfig, RefreshOutcome, Summarizer};
pub use qdrant::{QdrantConfig, QdrantIndex};
pub use recall::{Embedder, RecallActor, RecallConfig};
pub use vector_index::{SqliteVectorIndex, VectorIndex, VectorIndexError};
