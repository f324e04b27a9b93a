//! Single-writer memory store.
//!
//! [`MemoryStore`] is a cheap, cloneable handle to one worker task that owns
//! the [`ContextLog`]. Every read and write goes through the worker's
//! mailbox, so the log is only ever touched from one place.
//!
//! Summaries are refreshed incrementally. A refresh reads the newest
//! snapshot, takes the events past its high-water mark (at most
//! `batch_cap` of them), and hands them to the [`Summarizer`] on a separate
//! task. The worker keeps serving appends and reads while the summarizer
//! runs, and commits the new snapshot when the summarizer returns. At most
//! one refresh per channel is in flight; further requests for that channel
//! are coalesced into a single follow-up run.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use muse_memory::context_log::ContextLog;
//! use muse_memory::memory_store::{MemoryStore, MemoryStoreConfig, RefreshOutcome, Summarizer};
//! use muse_types::{MuseError, NewContextEvent};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Summarizer for Echo {
//!     async fn summarize(&self, prior: &str, new_events: &str) -> Result<String, MuseError> {
//!         Ok(format!("{prior}{new_events}"))
//!     }
//! }
//!
//! let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! rt.block_on(async {
//!     let log = ContextLog::open_in_memory().unwrap();
//!     let store = MemoryStore::spawn(log, Arc::new(Echo), MemoryStoreConfig::default());
//!
//!     store
//!         .append(NewContextEvent::message("c1", "u1", "alice", "hello", 0))
//!         .await
//!         .unwrap();
//!     let outcome = store.refresh_summary("c1").await.unwrap();
//!     assert!(matches!(outcome, RefreshOutcome::Folded(_)));
//!     assert!(store.latest_summary("c1").await.unwrap().summary_text.contains("alice: hello"));
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use muse_types::{ContextEvent, EventKind, MuseError, NewContextEvent, SummarySnapshot};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::context_log::ContextLog;

/// Default maximum number of events folded by one refresh.
pub const DEFAULT_BATCH_CAP: usize = 50;

const ACTOR_NAME: &str = "memory store";

// ─────────────────────────────────────────────────────────────────────────────
// Summarizer seam
// ─────────────────────────────────────────────────────────────────────────────

/// External service that folds new events into a running summary.
///
/// Besides channel summaries it condenses forum material: thread sections,
/// merged section summaries and memories extracted for a message. The
/// defaults route those through [`summarize`](Summarizer::summarize) with
/// no prior summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `prior` is empty when the channel was never summarized.
    async fn summarize(&self, prior: &str, new_events: &str) -> Result<String, MuseError>;

    /// Summarize one section of a forum thread on its own.
    async fn summarize_section(&self, section: &str) -> Result<String, MuseError> {
        self.summarize("", section).await
    }

    /// Merge section summaries, in order, into one.
    async fn combine(&self, parts: &[String]) -> Result<String, MuseError> {
        self.summarize("", &parts.join("\n---\n")).await
    }

    /// Condense `posts` down to what bears on `query`.
    async fn extract_relevant(&self, query: &str, posts: &str) -> Result<String, MuseError> {
        self.summarize("", &format!("User message:\n{query}\n\nRelevant posts:\n{posts}"))
            .await
    }
}

/// Render events one per line as `[YYYY-MM-DD HH:MM] username: content`.
pub fn format_events(events: &[ContextEvent]) -> String {
    let mut out = String::new();
    for e in events {
        let stamp = DateTime::<Utc>::from_timestamp(e.time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| e.time.to_string());
        out.push_str(&format!("[{stamp}] {}: {}\n", e.username, e.text));
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum number of new events folded per refresh.
    pub batch_cap: usize,
    /// Capacity of the request mailbox.
    pub mailbox: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            batch_cap: DEFAULT_BATCH_CAP,
            mailbox: 64,
        }
    }
}

/// Result of one summary refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was written.
    Folded(SummarySnapshot),
    /// No event past the high-water mark; nothing was written.
    NothingNew,
}

type Reply<T> = oneshot::Sender<Result<T, MuseError>>;

enum Request {
    Append {
        event: NewContextEvent,
        reply: Reply<ContextEvent>,
    },
    Refresh {
        channel: String,
        reply: Option<Reply<RefreshOutcome>>,
    },
    Latest {
        channel: String,
        reply: Reply<SummarySnapshot>,
    },
    History {
        channel: String,
        reply: Reply<Vec<SummarySnapshot>>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the memory store worker.
#[derive(Clone)]
pub struct MemoryStore {
    tx: mpsc::Sender<Request>,
}

impl MemoryStore {
    /// Open the log at `path` and start the worker.
    ///
    /// Failing to open the log is fatal for the caller: no request could be
    /// served.
    pub fn open(
        path: &str,
        summarizer: Arc<dyn Summarizer>,
        config: MemoryStoreConfig,
    ) -> Result<Self, MuseError> {
        let log = ContextLog::open(path)
            .map_err(|e| MuseError::StoreUnavailable(format!("{path}: {e}")))?;
        Ok(Self::spawn(log, summarizer, config))
    }

    /// Start the worker over an already opened log.
    ///
    /// Must be called from within a Tokio runtime. The worker stops once
    /// every handle is dropped and in-flight refreshes have committed.
    pub fn spawn(log: ContextLog, summarizer: Arc<dyn Summarizer>, config: MemoryStoreConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox.max(1));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            log,
            summarizer,
            batch_cap: config.batch_cap.max(1),
            in_flight: HashMap::new(),
            done_tx,
        };
        tokio::spawn(worker.run(rx, done_rx));
        Self { tx }
    }

    /// Append an event to its channel's log.
    pub async fn append(&self, event: NewContextEvent) -> Result<ContextEvent, MuseError> {
        self.call(|reply| Request::Append { event, reply }).await
    }

    /// Append a chat message and schedule a summary refresh without waiting
    /// for it.
    pub async fn append_message(
        &self,
        channel: &str,
        author_id: &str,
        username: &str,
        text: &str,
        time: i64,
    ) -> Result<ContextEvent, MuseError> {
        let event = self
            .append(NewContextEvent::message(channel, author_id, username, text, time))
            .await?;
        self.schedule_refresh(channel).await?;
        Ok(event)
    }

    /// Append a derived memory (e.g. a recalled post) to a channel.
    pub async fn append_memory(
        &self,
        channel: &str,
        text: &str,
        time: i64,
    ) -> Result<ContextEvent, MuseError> {
        self.append(NewContextEvent {
            channel: channel.to_string(),
            author_id: "memory".to_string(),
            username: "Memory".to_string(),
            text: text.to_string(),
            time,
            kind: EventKind::Memory,
        })
        .await
    }

    /// Refresh the channel's summary and wait for the result.
    ///
    /// When a refresh for the channel is already running, this waits for
    /// the follow-up run queued behind it.
    pub async fn refresh_summary(&self, channel: &str) -> Result<RefreshOutcome, MuseError> {
        let channel = channel.to_string();
        self.call(|reply| Request::Refresh {
            channel,
            reply: Some(reply),
        })
        .await
    }

    /// Request a refresh without waiting for it.
    pub async fn schedule_refresh(&self, channel: &str) -> Result<(), MuseError> {
        self.tx
            .send(Request::Refresh {
                channel: channel.to_string(),
                reply: None,
            })
            .await
            .map_err(|_| MuseError::ActorClosed(ACTOR_NAME.into()))
    }

    /// Newest snapshot of the channel, or [`SummarySnapshot::empty`].
    /// Never waits on a running refresh.
    pub async fn latest_summary(&self, channel: &str) -> Result<SummarySnapshot, MuseError> {
        let channel = channel.to_string();
        self.call(|reply| Request::Latest { channel, reply }).await
    }

    /// Every snapshot of the channel, oldest first.
    pub async fn summary_history(&self, channel: &str) -> Result<Vec<SummarySnapshot>, MuseError> {
        let channel = channel.to_string();
        self.call(|reply| Request::History { channel, reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, MuseError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| MuseError::ActorClosed(ACTOR_NAME.into()))?;
        rx.await
            .map_err(|_| MuseError::ActorClosed(ACTOR_NAME.into()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

struct InFlight {
    prior: SummarySnapshot,
    batch_ids: Vec<i64>,
    waiters: Vec<Reply<RefreshOutcome>>,
    rerun: bool,
    rerun_waiters: Vec<Reply<RefreshOutcome>>,
}

struct Completion {
    channel: String,
    result: Result<String, MuseError>,
}

struct Worker {
    log: ContextLog,
    summarizer: Arc<dyn Summarizer>,
    batch_cap: usize,
    in_flight: HashMap<String, InFlight>,
    done_tx: mpsc::UnboundedSender<Completion>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Request>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut requests_open = true;
        loop {
            tokio::select! {
                req = rx.recv(), if requests_open => match req {
                    Some(req) => self.handle(req),
                    None => requests_open = false,
                },
                Some(done) = done_rx.recv() => self.complete(done),
            }
            if !requests_open && self.in_flight.is_empty() {
                break;
            }
        }
        debug!("memory store worker stopped");
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Append { event, reply } => {
                let result = self.log.append(&event).map_err(|e| {
                    warn!(channel = %event.channel, error = %e, "append failed");
                    MuseError::from(e)
                });
                let _ = reply.send(result);
            }
            Request::Latest { channel, reply } => {
                let result = self
                    .log
                    .latest_summary(&channel)
                    .map(|s| s.unwrap_or_else(|| SummarySnapshot::empty(&channel)))
                    .map_err(MuseError::from);
                let _ = reply.send(result);
            }
            Request::History { channel, reply } => {
                let _ = reply.send(self.log.summaries(&channel).map_err(MuseError::from));
            }
            Request::Refresh { channel, reply } => {
                if let Some(running) = self.in_flight.get_mut(&channel) {
                    running.rerun = true;
                    running.rerun_waiters.extend(reply);
                    return;
                }
                self.start_refresh(channel, reply.into_iter().collect());
            }
        }
    }

    /// Read the next batch and hand it to the summarizer.
    fn start_refresh(&mut self, channel: String, waiters: Vec<Reply<RefreshOutcome>>) {
        let batch = self.log.latest_summary(&channel).and_then(|prior| {
            let prior = prior.unwrap_or_else(|| SummarySnapshot::empty(&channel));
            let events = self
                .log
                .events_after(&channel, prior.high_water_mark(), self.batch_cap)?;
            Ok((prior, events))
        });

        let (prior, events) = match batch {
            Ok(b) => b,
            Err(e) => {
                warn!(channel = %channel, error = %e, "summary refresh could not read the log");
                let err = MuseError::from(e);
                for w in waiters {
                    let _ = w.send(Err(err.clone()));
                }
                return;
            }
        };

        if events.is_empty() {
            for w in waiters {
                let _ = w.send(Ok(RefreshOutcome::NothingNew));
            }
            return;
        }

        debug!(channel = %channel, events = events.len(), "starting summary refresh");
        let formatted = format_events(&events);
        let prior_text = prior.summary_text.clone();
        let summarizer = Arc::clone(&self.summarizer);
        let done_tx = self.done_tx.clone();
        let task_channel = channel.clone();
        tokio::spawn(async move {
            let call =
                tokio::spawn(async move { summarizer.summarize(&prior_text, &formatted).await });
            let result = match call.await {
                Ok(r) => r,
                Err(e) => Err(MuseError::ExternalService(format!("summarizer task failed: {e}"))),
            };
            let _ = done_tx.send(Completion {
                channel: task_channel,
                result,
            });
        });

        self.in_flight.insert(
            channel,
            InFlight {
                prior,
                batch_ids: events.iter().map(|e| e.id).collect(),
                waiters,
                rerun: false,
                rerun_waiters: Vec::new(),
            },
        );
    }

    fn complete(&mut self, done: Completion) {
        let Some(running) = self.in_flight.remove(&done.channel) else {
            return;
        };
        let outcome = self.commit(&done.channel, &running, done.result);
        match &outcome {
            Ok(RefreshOutcome::Folded(snap)) => info!(
                channel = %done.channel,
                covered = snap.covered_event_ids.len(),
                high_water_mark = snap.high_water_mark(),
                "summary refreshed"
            ),
            Ok(RefreshOutcome::NothingNew) => {}
            Err(e) => warn!(channel = %done.channel, error = %e, "summary refresh failed; keeping previous summary"),
        }
        for w in running.waiters {
            let _ = w.send(outcome.clone());
        }
        if running.rerun {
            self.start_refresh(done.channel, running.rerun_waiters);
        }
    }

    fn commit(
        &self,
        channel: &str,
        running: &InFlight,
        result: Result<String, MuseError>,
    ) -> Result<RefreshOutcome, MuseError> {
        let text = result?;
        if text.trim().is_empty() {
            return Err(MuseError::DataIntegrity(format!(
                "summarizer returned an empty summary for channel {channel}"
            )));
        }
        let current = self.log.latest_summary(channel)?;
        let current_mark = current.as_ref().map_or(0, SummarySnapshot::high_water_mark);
        if current_mark != running.prior.high_water_mark() {
            return Err(MuseError::DataIntegrity(format!(
                "summary of channel {channel} moved during refresh"
            )));
        }

        let mut covered = running.prior.covered_event_ids.clone();
        covered.extend_from_slice(&running.batch_ids);
        let snapshot = SummarySnapshot {
            channel: channel.to_string(),
            summary_text: text,
            covered_event_ids: covered,
            time: Utc::now().timestamp(),
        };
        self.log.insert_summary(&snapshot)?;
        Ok(RefreshOutcome::Folded(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Summarizer that reports how many lines it was given.
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for Counting {
        async fn summarize(&self, prior: &str, new_events: &str) -> Result<String, MuseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{prior}+{}", new_events.lines().count()))
        }
    }

    struct Fixed(Result<String, MuseError>);

    #[async_trait]
    impl Summarizer for Fixed {
        async fn summarize(&self, _: &str, _: &str) -> Result<String, MuseError> {
            self.0.clone()
        }
    }

    /// Summarizer that blocks until released.
    struct Gated {
        gate: Arc<Notify>,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Summarizer for Gated {
        async fn summarize(&self, _: &str, new_events: &str) -> Result<String, MuseError> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(format!("{} events", new_events.lines().count()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Summarizer for Panicking {
        async fn summarize(&self, _: &str, _: &str) -> Result<String, MuseError> {
            panic!("model exploded");
        }
    }

    fn store_with(summarizer: Arc<dyn Summarizer>, batch_cap: usize) -> MemoryStore {
        let log = ContextLog::open_in_memory().unwrap();
        MemoryStore::spawn(
            log,
            summarizer,
            MemoryStoreConfig {
                batch_cap,
                ..Default::default()
            },
        )
    }

    async fn append_n(store: &MemoryStore, channel: &str, n: usize) {
        for i in 0..n {
            store
                .append(NewContextEvent::message(channel, "u", "alice", format!("m{i}"), i as i64))
                .await
                .unwrap();
        }
    }

    #[test]
    fn format_events_uses_minute_stamps() {
        let ev = ContextEvent {
            id: 1,
            channel: "c".into(),
            author_id: "u".into(),
            username: "alice".into(),
            text: "hi".into(),
            time: 1_136_214_245, // 2006-01-02 15:04:05 UTC
            kind: EventKind::Message,
        };
        assert_eq!(format_events(&[ev]), "[2006-01-02 15:04] alice: hi\n");
    }

    #[tokio::test]
    async fn latest_summary_is_empty_for_new_channel() {
        let store = store_with(Arc::new(Fixed(Ok("x".into()))), 50);
        let snap = store.latest_summary("c1").await.unwrap();
        assert!(snap.is_empty());
        assert_eq!(snap.channel, "c1");
    }

    #[tokio::test]
    async fn refresh_without_events_does_nothing() {
        let counting = Arc::new(Counting { calls: AtomicUsize::new(0) });
        let store = store_with(counting.clone(), 50);
        assert_eq!(store.refresh_summary("c1").await.unwrap(), RefreshOutcome::NothingNew);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_folds_in_capped_batches() {
        let store = store_with(Arc::new(Counting { calls: AtomicUsize::new(0) }), 3);
        append_n(&store, "c1", 5).await;

        let RefreshOutcome::Folded(first) = store.refresh_summary("c1").await.unwrap() else {
            panic!("expected a fold");
        };
        assert_eq!(first.covered_event_ids.len(), 3);
        assert_eq!(first.summary_text, "+3");

        let RefreshOutcome::Folded(second) = store.refresh_summary("c1").await.unwrap() else {
            panic!("expected a fold");
        };
        assert_eq!(second.covered_event_ids.len(), 5);
        assert!(second.covered_event_ids.starts_with(&first.covered_event_ids));
        assert_eq!(second.summary_text, "+3+2");
    }

    #[tokio::test]
    async fn empty_summary_keeps_previous_snapshot() {
        let store = store_with(Arc::new(Fixed(Ok("   ".into()))), 50);
        append_n(&store, "c1", 2).await;
        let err = store.refresh_summary("c1").await.unwrap_err();
        assert!(matches!(err, MuseError::DataIntegrity(_)));
        assert!(store.latest_summary("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summarizer_error_is_returned_and_state_unchanged() {
        let store = store_with(
            Arc::new(Fixed(Err(MuseError::ExternalService("timeout".into())))),
            50,
        );
        append_n(&store, "c1", 2).await;
        let err = store.refresh_summary("c1").await.unwrap_err();
        assert_eq!(err, MuseError::ExternalService("timeout".into()));
        assert!(store.summary_history("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summarizer_panic_becomes_external_error() {
        let store = store_with(Arc::new(Panicking), 50);
        append_n(&store, "c1", 1).await;
        let err = store.refresh_summary("c1").await.unwrap_err();
        assert!(matches!(err, MuseError::ExternalService(_)));
        // The worker survives.
        append_n(&store, "c1", 1).await;
    }

    #[tokio::test]
    async fn reads_and_appends_do_not_wait_on_running_refresh() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let store = store_with(
            Arc::new(Gated {
                gate: gate.clone(),
                started: started.clone(),
            }),
            50,
        );
        append_n(&store, "c1", 2).await;

        let refreshing = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_summary("c1").await })
        };
        started.notified().await;

        // Summarizer is parked; the worker still answers.
        assert!(store.latest_summary("c1").await.unwrap().is_empty());
        append_n(&store, "c1", 1).await;

        gate.notify_one();
        let RefreshOutcome::Folded(snap) = refreshing.await.unwrap().unwrap() else {
            panic!("expected a fold");
        };
        // The event appended mid-refresh is left for the next cycle.
        assert_eq!(snap.covered_event_ids.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_refresh_requests_coalesce() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let store = store_with(
            Arc::new(Gated {
                gate: gate.clone(),
                started: started.clone(),
            }),
            50,
        );
        append_n(&store, "c1", 2).await;

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_summary("c1").await })
        };
        started.notified().await;
        append_n(&store, "c1", 1).await;
        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_summary("c1").await })
        };
        let third = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_summary("c1").await })
        };
        // Let both follow-up requests reach the worker before releasing.
        tokio::task::yield_now().await;
        let _ = store.latest_summary("c1").await.unwrap();

        gate.notify_one();
        started.notified().await;
        gate.notify_one();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        let c = third.await.unwrap().unwrap();
        assert_eq!(b, c);
        let (RefreshOutcome::Folded(a), RefreshOutcome::Folded(b)) = (a, b) else {
            panic!("expected two folds");
        };
        assert_eq!(a.covered_event_ids.len(), 2);
        assert_eq!(b.covered_event_ids.len(), 3);
        assert_eq!(store.summary_history("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn append_memory_is_tagged() {
        let store = store_with(Arc::new(Fixed(Ok("x".into()))), 50);
        let ev = store.append_memory("c1", "the war", 5).await.unwrap();
        assert_eq!(ev.kind, EventKind::Memory);
        assert_eq!(ev.username, "Memory");
    }

    #[tokio::test]
    async fn open_reports_unavailable_store() {
        let err = MemoryStore::open(
            "/nonexistent-dir/definitely/missing/memory.db",
            Arc::new(Fixed(Ok("x".into()))),
            MemoryStoreConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MuseError::StoreUnavailable(_)));
    }
}
