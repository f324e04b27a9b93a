//! `muse-runtime` – Axes, model drivers and the memory core facade.
//!
//! Sits on top of `muse-memory` and turns its actors into something a chat
//! front end can drive.
//!
//! # Modules
//!
//! - [`axis`] – the [`Axis`][axis::Axis] trait and
//!   [`run_immediate`][axis::run_immediate]: concurrent, fault-isolated
//!   evaluation of one input by many axes, with cancellation.
//! - [`background`] – [`BackgroundProcessor`][background::BackgroundProcessor]:
//!   a long-lived axis pipeline with bounded input and output queues that
//!   drains before closing.
//! - [`axes`] – [`RecallAxis`][axes::RecallAxis] and
//!   [`RelevanceAxis`][axes::RelevanceAxis].
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible client implementing the summarizer, embedder and
//!   relevance judge, plus reply generation. Relevance answers are forced
//!   into the [`RelevanceVerdict`][llm_driver::RelevanceVerdict] JSON Schema
//!   through `response_format`.
//! - [`persona`] – system prompt and reply context assembly.
//! - [`session`] – [`SessionStore`][session::SessionStore]: loaded
//!   characters and per-user selection and mode.
//! - [`memory_core`] – [`MemoryCore`][memory_core::MemoryCore]: append, summary, recall
//!   and axes behind one handle, with optional memory extraction from a
//!   character's archived posts.
//! - [`timeline`] – [`summarize_timeline`][timeline::summarize_timeline]:
//!   section-by-section summaries of a user's forum conversations, stored
//!   in the archive.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with an optional OTLP span exporter.

pub mod axes;
pub mod axis;
pub mod background;
pub mod llm_driver;
pub mod memory_core;
pub mod persona;
pub mod session;
pub mod telemetry;
pub mod timeline;

pub use axes::{NO_RELEVANT_MEMORIES, RecallAxis, RelevanceAxis, RelevanceJudge};
pub use axis::{Axis, AxisError, SharedAxis, run_immediate, run_immediate_with_timeout};
pub use background::{BackgroundConfig, BackgroundProcessor, SubmitError};
pub use llm_driver::{
    ChatMessage, ExtractedMemory, LlmConfig, LlmDriver, LlmError, RelevanceVerdict, Role,
};
pub use memory_core::{MemoryCore, MemoryExtraction, ReplyContext};
pub use session::{Character, SessionError, SessionStore};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use timeline::{ConversationDigest, TimelineReport, summarize_conversation, summarize_timeline};
