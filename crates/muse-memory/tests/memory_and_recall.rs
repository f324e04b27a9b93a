use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use muse_memory::{
    ContextLog, Embedder, MemoryStore, MemoryStoreConfig, RecallActor, RecallConfig,
    RefreshOutcome, SqliteVectorIndex, Summarizer, VectorIndex,
};
use muse_types::{EmbeddedRecord, MuseError, NewContextEvent};

struct LineCount;

#[async_trait]
impl Summarizer for LineCount {
    async fn summarize(&self, prior: &str, new_events: &str) -> Result<String, MuseError> {
        Ok(format!("{prior}[{}]", new_events.lines().count()))
    }
}

struct Constant(Vec<f32>);

#[async_trait]
impl Embedder for Constant {
    async fn embed(&self, _: &str) -> Result<Vec<f32>, MuseError> {
        Ok(self.0.clone())
    }
}

struct Down;

#[async_trait]
impl Embedder for Down {
    async fn embed(&self, _: &str) -> Result<Vec<f32>, MuseError> {
        Err(MuseError::ExternalService("connection refused".into()))
    }
}

fn store(batch_cap: usize) -> MemoryStore {
    MemoryStore::spawn(
        ContextLog::open_in_memory().unwrap(),
        Arc::new(LineCount),
        MemoryStoreConfig {
            batch_cap,
            ..Default::default()
        },
    )
}

async fn append_events(store: &MemoryStore, channel: &str, n: usize) -> Vec<i64> {
    let mut ids = Vec::new();
    for i in 0..n {
        let ev = store
            .append(NewContextEvent::message(channel, "u1", "alice", format!("e{}", i + 1), i as i64))
            .await
            .unwrap();
        ids.push(ev.id);
    }
    ids
}

fn folded(outcome: RefreshOutcome) -> Vec<i64> {
    match outcome {
        RefreshOutcome::Folded(snap) => snap.covered_event_ids,
        RefreshOutcome::NothingNew => panic!("expected a fold"),
    }
}

#[tokio::test]
async fn hundred_twenty_events_fold_in_three_batches() {
    let store = store(50);
    let ids = append_events(&store, "c1", 120).await;

    let first = folded(store.refresh_summary("c1").await.unwrap());
    assert_eq!(first, ids[..50]);

    let second = folded(store.refresh_summary("c1").await.unwrap());
    assert_eq!(second, ids[..100]);

    let third = folded(store.refresh_summary("c1").await.unwrap());
    assert_eq!(third, ids[..120]);

    assert_eq!(
        store.refresh_summary("c1").await.unwrap(),
        RefreshOutcome::NothingNew
    );
    let latest = store.latest_summary("c1").await.unwrap();
    assert_eq!(latest.summary_text, "[50][50][20]");
    assert_eq!(latest.high_water_mark(), ids[119]);
}

#[tokio::test]
async fn deltas_never_overlap_under_interleaving() {
    let store = store(7);
    let mut all_ids = Vec::new();
    for round in 0..6 {
        all_ids.extend(append_events(&store, "c1", 5 + round).await);
        // Interleave another channel to make sure ids are channel scoped.
        append_events(&store, "c2", 3).await;
        let _ = store.refresh_summary("c1").await.unwrap();
    }
    while store.refresh_summary("c1").await.unwrap() != RefreshOutcome::NothingNew {}

    let history = store.summary_history("c1").await.unwrap();
    let mut previous: Vec<i64> = Vec::new();
    for snap in &history {
        assert!(snap.covered_event_ids.starts_with(&previous));
        assert!(snap.high_water_mark() > previous.last().copied().unwrap_or(0));
        let delta = &snap.covered_event_ids[previous.len()..];
        assert!(delta.len() <= 7);
        previous = snap.covered_event_ids.clone();
    }
    assert_eq!(previous, all_ids);
}

#[tokio::test]
async fn scheduled_refreshes_settle_on_all_events() {
    let store = store(50);
    for i in 0..20 {
        store
            .append_message("c1", "u1", "alice", &format!("hi {i}"), i)
            .await
            .unwrap();
    }
    // A waited refresh queues behind any scheduled one.
    while store.refresh_summary("c1").await.unwrap() != RefreshOutcome::NothingNew {}
    let latest = store.latest_summary("c1").await.unwrap();
    assert_eq!(latest.covered_event_ids.len(), 20);
}

async fn index_with_puck() -> Arc<SqliteVectorIndex> {
    let index = SqliteVectorIndex::open_in_memory().unwrap();
    index.ensure_index("forum_posts", 3).await.unwrap();
    index
        .upsert(
            "forum_posts",
            &[EmbeddedRecord {
                id: 1,
                owner: "puck".into(),
                text: "I fought in the war.".into(),
                vector: vec![1.0, 0.0, 0.0],
                metadata: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();
    Arc::new(index)
}

fn recall_config() -> RecallConfig {
    RecallConfig {
        dimensionality: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn recall_for_owner_without_records_is_empty() {
    let index = index_with_puck().await;
    let actor = RecallActor::spawn(Arc::new(Constant(vec![1.0, 0.0, 0.0])), index, recall_config());
    let hits = actor.recall("naoki", "tell me about the war").await;
    assert!(hits.is_empty());
}

#[tokio::test]
async fn failed_embedding_leaves_index_untouched() {
    let index = index_with_puck().await;
    let actor = RecallActor::spawn(Arc::new(Down), index.clone(), recall_config());
    assert!(actor.recall("puck", "the war").await.is_empty());

    let still_there = index
        .query("forum_posts", &[1.0, 0.0, 0.0], None, 10)
        .await
        .unwrap();
    assert_eq!(still_there.len(), 1);
    assert_eq!(still_there[0].record.text, "I fought in the war.");
}
