//! Forum archive and per-user conversation windows.
//!
//! The archive is the relational system of record for scraped forum posts.
//! It feeds offline ingestion into the vector index and the per-user
//! timeline, which groups a user's posts into conversation windows.
//!
//! # Storage layout
//!
//! Table `forum_posts`:
//!
//! | column      | type    | description                              |
//! |-------------|---------|------------------------------------------|
//! | post_id     | TEXT    | Forum post id (primary key)              |
//! | user        | TEXT    | Author display name                      |
//! | user_num    | INTEGER | Author's forum user number               |
//! | timestamp   | INTEGER | Unix seconds                             |
//! | message     | TEXT    | Post body                                |
//! | thread_path | TEXT    | Thread path relative to the forum root   |
//!
//! Table `conversation_summaries` holds one summary per conversation
//! window: `id`, `username`, `thread_path`, `start`, `end`, `summary`.
//!
//! The connection sits behind a mutex so one archive can be shared through
//! an `Arc`; async callers go through [`ForumArchive::blocking`] to keep
//! SQLite work off the runtime's worker threads.
//!
//! # Example
//!
//! ```rust
//! use muse_memory::archive::{ForumArchive, ForumPost};
//!
//! let archive = ForumArchive::open_in_memory().unwrap();
//! archive
//!     .insert_posts(&[ForumPost {
//!         post_id: "1".into(),
//!         user: "Empress Naoki".into(),
//!         user_num: 7,
//!         timestamp: 100,
//!         message: "The plains are quiet tonight.".into(),
//!         thread_path: "overworld/threads/midnight-sun".into(),
//!     }])
//!     .unwrap();
//!
//! let convos = archive.find_user_conversations("Empress Naoki").unwrap();
//! assert_eq!(convos.len(), 1);
//! assert_eq!(convos[0].end, i64::MAX);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use muse_types::{MuseError, TimestampedRecord};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel end time of an open-ended conversation window.
pub const OPEN_ENDED: i64 = i64::MAX;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Forum archive unavailable: {0}")]
    Unavailable(String),
}

impl From<ArchiveError> for MuseError {
    fn from(e: ArchiveError) -> Self {
        MuseError::StoreUnavailable(e.to_string())
    }
}

/// One scraped forum post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumPost {
    pub post_id: String,
    pub user: String,
    pub user_num: i64,
    /// Unix seconds.
    pub timestamp: i64,
    pub message: String,
    pub thread_path: String,
}

impl ForumPost {
    /// View this post as a record owned by its author.
    pub fn to_record(&self) -> TimestampedRecord {
        TimestampedRecord {
            id: self.post_id.clone(),
            owner: self.user.clone(),
            channel: self.thread_path.clone(),
            author: self.user.clone(),
            text: self.message.clone(),
            unix_time: self.timestamp,
        }
    }
}

/// A window of one thread around a user's participation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub thread_path: String,
    pub start: i64,
    /// Exclusive; [`OPEN_ENDED`] when the window has no upper bound.
    pub end: i64,
    pub posts: Vec<ForumPost>,
}

/// Stored summary of one conversation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub username: String,
    pub thread_path: String,
    pub start: i64,
    pub end: i64,
    pub summary: String,
}

/// SQLite-backed forum archive.
pub struct ForumArchive {
    conn: Mutex<Connection>,
}

const POST_COLUMNS: &str = "post_id, user, user_num, timestamp, message, thread_path";

impl ForumArchive {
    pub fn open(path: &str) -> Result<Self, ArchiveError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ArchiveError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS forum_posts (
                post_id     TEXT PRIMARY KEY,
                user        TEXT,
                user_num    INTEGER,
                timestamp   INTEGER,
                message     TEXT,
                thread_path TEXT
            );
            CREATE TABLE IF NOT EXISTS conversation_summaries (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL,
                thread_path TEXT NOT NULL,
                \"start\"     INTEGER NOT NULL,
                \"end\"       INTEGER NOT NULL,
                summary     TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ArchiveError> {
        self.conn
            .lock()
            .map_err(|_| ArchiveError::Unavailable("connection lock poisoned".into()))
    }

    /// Run `f` against a shared archive on Tokio's blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, ArchiveError>
    where
        F: FnOnce(&ForumArchive) -> Result<T, ArchiveError> + Send + 'static,
        T: Send + 'static,
    {
        let archive = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&archive))
            .await
            .map_err(|e| ArchiveError::Unavailable(format!("archive task failed: {e}")))?
    }

    /// Insert or replace `posts` in one transaction.
    pub fn insert_posts(&self, posts: &[ForumPost]) -> Result<usize, ArchiveError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO forum_posts
                     (post_id, user, user_num, timestamp, message, thread_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for p in posts {
                stmt.execute(params![
                    p.post_id,
                    p.user,
                    p.user_num,
                    p.timestamp,
                    p.message,
                    p.thread_path
                ])?;
            }
        }
        tx.commit()?;
        Ok(posts.len())
    }

    /// Every post in the archive, oldest first.
    pub fn all_posts(&self) -> Result<Vec<ForumPost>, ArchiveError> {
        self.query_posts(
            &format!("SELECT {POST_COLUMNS} FROM forum_posts ORDER BY timestamp ASC"),
            params![],
        )
    }

    /// Posts written by `user`, oldest first.
    pub fn user_posts(&self, user: &str) -> Result<Vec<ForumPost>, ArchiveError> {
        self.query_posts(
            &format!(
                "SELECT {POST_COLUMNS} FROM forum_posts WHERE user = ?1 ORDER BY timestamp ASC"
            ),
            params![user],
        )
    }

    /// Every post of one thread, oldest first.
    pub fn thread_posts(&self, thread_path: &str) -> Result<Vec<ForumPost>, ArchiveError> {
        self.query_posts(
            &format!(
                "SELECT {POST_COLUMNS} FROM forum_posts WHERE thread_path = ?1 ORDER BY timestamp ASC"
            ),
            params![thread_path],
        )
    }

    /// Posts of `thread_path` with `start <= timestamp < end`.
    ///
    /// A non-positive `end` or [`OPEN_ENDED`] means no upper bound.
    pub fn thread_posts_between(
        &self,
        thread_path: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ForumPost>, ArchiveError> {
        if end > 0 && end < OPEN_ENDED {
            self.query_posts(
                &format!(
                    "SELECT {POST_COLUMNS} FROM forum_posts
                     WHERE thread_path = ?1 AND timestamp >= ?2 AND timestamp < ?3
                     ORDER BY timestamp ASC"
                ),
                params![thread_path, start, end],
            )
        } else {
            self.query_posts(
                &format!(
                    "SELECT {POST_COLUMNS} FROM forum_posts
                     WHERE thread_path = ?1 AND timestamp >= ?2
                     ORDER BY timestamp ASC"
                ),
                params![thread_path, start],
            )
        }
    }

    /// Group `user`'s posts into conversation windows.
    ///
    /// For each of the user's posts: if the user's next post is in the same
    /// thread the window is skipped; otherwise the window spans from this
    /// post up to the next user post (in another thread), or is open-ended
    /// for the user's last post. Windows can overlap. Empty windows are
    /// dropped.
    pub fn find_user_conversations(&self, user: &str) -> Result<Vec<Conversation>, ArchiveError> {
        let user_posts = self.user_posts(user)?;
        let mut conversations = Vec::new();

        for (i, post) in user_posts.iter().enumerate() {
            let end = match user_posts.get(i + 1) {
                Some(next) if next.thread_path == post.thread_path => continue,
                Some(next) => next.timestamp,
                None => OPEN_ENDED,
            };
            let posts = self.thread_posts_between(&post.thread_path, post.timestamp, end)?;
            if !posts.is_empty() {
                conversations.push(Conversation {
                    thread_path: post.thread_path.clone(),
                    start: post.timestamp,
                    end,
                    posts,
                });
            }
        }
        Ok(conversations)
    }

    fn query_posts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ForumPost>, ArchiveError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_post)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ArchiveError::Sqlite)
    }

    // ── Conversation summaries ──────────────────────────────────────────────

    /// Store `summary` for `username`'s conversation window `conv`.
    pub fn insert_conversation_summary(
        &self,
        username: &str,
        conv: &Conversation,
        summary: &str,
    ) -> Result<ConversationSummary, ArchiveError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversation_summaries (username, thread_path, \"start\", \"end\", summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![username, conv.thread_path, conv.start, conv.end, summary],
        )?;
        Ok(ConversationSummary {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            thread_path: conv.thread_path.clone(),
            start: conv.start,
            end: conv.end,
            summary: summary.to_string(),
        })
    }

    /// `username`'s stored conversation summaries, by window start.
    pub fn conversation_summaries(
        &self,
        username: &str,
    ) -> Result<Vec<ConversationSummary>, ArchiveError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, thread_path, \"start\", \"end\", summary
             FROM conversation_summaries WHERE username = ?1
             ORDER BY \"start\" ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![username], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                thread_path: row.get(2)?,
                start: row.get(3)?,
                end: row.get(4)?,
                summary: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ArchiveError::Sqlite)
    }
}

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<ForumPost> {
    Ok(ForumPost {
        post_id: row.get(0)?,
        user: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        user_num: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
        timestamp: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
        message: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        thread_path: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
    })
}
