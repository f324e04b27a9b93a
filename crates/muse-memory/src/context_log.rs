//! Per-channel context log and rolling summaries.
//!
//! The relational system of record behind the memory store. Every message
//! seen in a channel is appended as a context event, and every successful
//! summarization appends a new summary row that supersedes (but never
//! replaces) the previous one.
//!
//! # Storage layout
//!
//! Table `contexts`:
//!
//! | column     | type    | description                                  |
//! |------------|---------|----------------------------------------------|
//! | id         | INTEGER | Autoincrement primary key (strictly rising)  |
//! | channel_id | TEXT    | Channel the event belongs to                 |
//! | author_id  | TEXT    | Transport-level author id                    |
//! | username   | TEXT    | Display name                                 |
//! | content    | TEXT    | Message text                                 |
//! | time       | INTEGER | Unix seconds                                 |
//! | type       | TEXT    | `"message"` or `"memory"`                    |
//!
//! Table `summaries`:
//!
//! | column       | type    | description                                |
//! |--------------|---------|--------------------------------------------|
//! | id           | INTEGER | Autoincrement primary key                  |
//! | channel_id   | TEXT    | Channel summarized                         |
//! | summary_text | TEXT    | Summary produced by the summarizer         |
//! | context_ids  | TEXT    | JSON array of every covered context id     |
//! | time         | INTEGER | Unix seconds the summary was written       |

use muse_types::{ContextEvent, EventKind, MuseError, NewContextEvent, SummarySnapshot};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// Errors that can arise from context log operations.
#[derive(Error, Debug)]
pub enum ContextLogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt covered-id list for channel {channel}: {source}")]
    CorruptContextIds {
        channel: String,
        source: serde_json::Error,
    },
    #[error("Covered ids must be strictly increasing (channel {0})")]
    NonMonotonicIds(String),
}

impl From<ContextLogError> for MuseError {
    fn from(e: ContextLogError) -> Self {
        match e {
            ContextLogError::Sqlite(e) => MuseError::StoreUnavailable(e.to_string()),
            other => MuseError::DataIntegrity(other.to_string()),
        }
    }
}

/// SQLite-backed context log.
pub struct ContextLog {
    conn: Connection,
}

impl ContextLog {
    /// Open (or create) a persistent log at `path`.
    pub fn open(path: &str) -> Result<Self, ContextLogError> {
        let conn = Connection::open(path)?;
        let log = Self { conn };
        log.init_schema()?;
        Ok(log)
    }

    /// Open a temporary in-memory log (useful for testing).
    pub fn open_in_memory() -> Result<Self, ContextLogError> {
        let conn = Connection::open_in_memory()?;
        let log = Self { conn };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), ContextLogError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contexts (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                author_id  TEXT NOT NULL,
                username   TEXT NOT NULL,
                content    TEXT NOT NULL,
                time       INTEGER NOT NULL,
                type       TEXT NOT NULL DEFAULT 'message'
            );
            CREATE INDEX IF NOT EXISTS contexts_channel_id ON contexts (channel_id, id);
            CREATE TABLE IF NOT EXISTS summaries (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id   TEXT NOT NULL,
                summary_text TEXT NOT NULL,
                context_ids  TEXT NOT NULL,
                time         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS summaries_channel_id ON summaries (channel_id, id);",
        )?;
        Ok(())
    }

    /// Append an event and return it with its store-assigned id.
    pub fn append(&self, event: &NewContextEvent) -> Result<ContextEvent, ContextLogError> {
        self.conn.execute(
            "INSERT INTO contexts (channel_id, author_id, username, content, time, type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.channel,
                event.author_id,
                event.username,
                event.text,
                event.time,
                event.kind.as_str(),
            ],
        )?;
        Ok(ContextEvent {
            id: self.conn.last_insert_rowid(),
            channel: event.channel.clone(),
            author_id: event.author_id.clone(),
            username: event.username.clone(),
            text: event.text.clone(),
            time: event.time,
            kind: event.kind,
        })
    }

    /// Events of `channel` with an id greater than `after_id`, oldest first,
    /// at most `limit` of them.
    pub fn events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ContextEvent>, ContextLogError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, channel_id, author_id, username, content, time, type
             FROM contexts
             WHERE channel_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![channel, after_id, limit], row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ContextLogError::Sqlite)
    }

    /// Most recent summary of `channel`, if it was ever summarized.
    pub fn latest_summary(&self, channel: &str) -> Result<Option<SummarySnapshot>, ContextLogError> {
        let row = self
            .conn
            .query_row(
                "SELECT summary_text, context_ids, time FROM summaries
                 WHERE channel_id = ?1 ORDER BY id DESC LIMIT 1",
                params![channel],
                |row| {
                    let text: String = row.get(0)?;
                    let ids: String = row.get(1)?;
                    let time: i64 = row.get(2)?;
                    Ok((text, ids, time))
                },
            )
            .optional()?;
        row.map(|(summary_text, ids, time)| snapshot_from_row(channel, summary_text, &ids, time))
            .transpose()
    }

    /// Every summary of `channel`, oldest first.
    pub fn summaries(&self, channel: &str) -> Result<Vec<SummarySnapshot>, ContextLogError> {
        let mut stmt = self.conn.prepare(
            "SELECT summary_text, context_ids, time FROM summaries
             WHERE channel_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![channel], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (text, ids, time) = row?;
            out.push(snapshot_from_row(channel, text, &ids, time)?);
        }
        Ok(out)
    }

    /// Persist a new summary snapshot.
    ///
    /// Rejects snapshots whose covered ids are not strictly increasing.
    pub fn insert_summary(&self, snapshot: &SummarySnapshot) -> Result<(), ContextLogError> {
        if snapshot
            .covered_event_ids
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            return Err(ContextLogError::NonMonotonicIds(snapshot.channel.clone()));
        }
        let ids = serde_json::to_string(&snapshot.covered_event_ids).map_err(|source| {
            ContextLogError::CorruptContextIds {
                channel: snapshot.channel.clone(),
                source,
            }
        })?;
        self.conn.execute(
            "INSERT INTO summaries (channel_id, summary_text, context_ids, time)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.channel, snapshot.summary_text, ids, snapshot.time],
        )?;
        Ok(())
    }
}

fn snapshot_from_row(
    channel: &str,
    summary_text: String,
    ids: &str,
    time: i64,
) -> Result<SummarySnapshot, ContextLogError> {
    let covered_event_ids: Vec<i64> =
        serde_json::from_str(ids).map_err(|source| ContextLogError::CorruptContextIds {
            channel: channel.to_string(),
            source,
        })?;
    Ok(SummarySnapshot {
        channel: channel.to_string(),
        summary_text,
        covered_event_ids,
        time,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextEvent> {
    let kind_str: String = row.get(6)?;
    let kind = EventKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(6, kind_str, rusqlite::types::Type::Text)
    })?;
    Ok(ContextEvent {
        id: row.get(0)?,
        channel: row.get(1)?,
        author_id: row.get(2)?,
        username: row.get(3)?,
        text: row.get(4)?,
        time: row.get(5)?,
        kind,
    })
}
