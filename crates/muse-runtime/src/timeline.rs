//! Conversation timeline: summaries of a user's forum conversations.
//!
//! Each conversation window from
//! [`find_user_conversations`](ForumArchive::find_user_conversations) is
//! split into budget-bounded sections with the chunker. Every section is
//! summarized on its own, the section summaries are combined into one, and
//! the result is stored in the archive's `conversation_summaries` table.
//!
//! A failing section is logged and left out; a window with no usable
//! section is logged and skipped without stopping the run.

use std::sync::Arc;

use muse_memory::{
    ChunkBudget, Conversation, ConversationSummary, ForumArchive, ForumPost, Summarizer, chunk,
};
use muse_types::MuseError;
use tracing::{debug, info, warn};

/// Section budget for conversation summaries, in characters.
pub const DEFAULT_TIMELINE_BUDGET: usize = 100_000;

/// Render posts as `user:\nmessage` blocks for the summarizer.
pub fn section_text(posts: &[ForumPost]) -> String {
    let mut out = String::new();
    for p in posts {
        out.push_str(&p.user);
        out.push_str(":\n");
        out.push_str(&p.message);
        out.push('\n');
    }
    out
}

/// Section summaries of one conversation and their combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDigest {
    pub section_summaries: Vec<String>,
    pub summary: String,
}

/// Summarize `posts` section by section and combine the results.
///
/// With a single usable section its summary is the result and no combine
/// call is made.
pub async fn summarize_conversation(
    summarizer: &dyn Summarizer,
    posts: &[ForumPost],
    budget: ChunkBudget,
) -> Result<ConversationDigest, MuseError> {
    let sections = chunk(posts, budget);
    let mut section_summaries = Vec::with_capacity(sections.len());
    for (i, section) in sections.iter().enumerate() {
        debug!(section = i + 1, of = sections.len(), posts = section.len(), "summarizing section");
        match summarizer.summarize_section(&section_text(section)).await {
            Ok(s) if !s.trim().is_empty() => section_summaries.push(s.trim().to_string()),
            Ok(_) => warn!(section = i + 1, "empty section summary; section left out"),
            Err(e) => warn!(section = i + 1, error = %e, "section summary failed; section left out"),
        }
    }

    let summary = match section_summaries.as_slice() {
        [] => {
            return Err(MuseError::ExternalService(
                "no section of the conversation could be summarized".into(),
            ));
        }
        [only] => only.clone(),
        parts => summarizer.combine(parts).await?.trim().to_string(),
    };
    if summary.is_empty() {
        return Err(MuseError::DataIntegrity("combined summary is empty".into()));
    }
    Ok(ConversationDigest {
        section_summaries,
        summary,
    })
}

/// Outcome of [`summarize_timeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineReport {
    pub stored: Vec<ConversationSummary>,
    /// Windows that could not be summarized or stored.
    pub failed: usize,
}

/// Summarize and store every conversation window of `username`.
///
/// Errors only when the archive cannot list the windows.
pub async fn summarize_timeline(
    summarizer: &dyn Summarizer,
    archive: &Arc<ForumArchive>,
    username: &str,
    budget: ChunkBudget,
) -> Result<TimelineReport, MuseError> {
    let user = username.to_string();
    let conversations: Vec<Conversation> = archive
        .blocking(move |a| a.find_user_conversations(&user))
        .await?;
    info!(user = username, conversations = conversations.len(), "summarizing timeline");

    let mut report = TimelineReport::default();
    for conv in conversations {
        let digest = match summarize_conversation(summarizer, &conv.posts, budget).await {
            Ok(d) => d,
            Err(e) => {
                warn!(thread = %conv.thread_path, start = conv.start, error = %e, "conversation not summarized");
                report.failed += 1;
                continue;
            }
        };
        let user = username.to_string();
        let stored = archive
            .blocking(move |a| a.insert_conversation_summary(&user, &conv, &digest.summary))
            .await;
        match stored {
            Ok(s) => report.stored.push(s),
            Err(e) => {
                warn!(error = %e, "conversation summary not stored");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call and answers with predictable text.
    #[derive(Default)]
    struct Scripted {
        sections: Mutex<Vec<String>>,
        combined: Mutex<Vec<Vec<String>>>,
        fail_section_containing: Option<&'static str>,
    }

    #[async_trait]
    impl Summarizer for Scripted {
        async fn summarize(&self, _: &str, _: &str) -> Result<String, MuseError> {
            Err(MuseError::ExternalService("channel summaries not used here".into()))
        }

        async fn summarize_section(&self, section: &str) -> Result<String, MuseError> {
            if let Some(bad) = self.fail_section_containing {
                if section.contains(bad) {
                    return Err(MuseError::ExternalService("model overloaded".into()));
                }
            }
            let mut seen = self.sections.lock().unwrap();
            seen.push(section.to_string());
            Ok(format!("section {} ({} lines)", seen.len(), section.lines().count()))
        }

        async fn combine(&self, parts: &[String]) -> Result<String, MuseError> {
            self.combined.lock().unwrap().push(parts.to_vec());
            Ok(format!("combined: {}", parts.join(" + ")))
        }
    }

    fn post(id: &str, user: &str, ts: i64, thread: &str, message: &str) -> ForumPost {
        ForumPost {
            post_id: id.into(),
            user: user.into(),
            user_num: 1,
            timestamp: ts,
            message: message.into(),
            thread_path: thread.into(),
        }
    }

    fn three_posts() -> Vec<ForumPost> {
        vec![
            post("1", "naoki", 10, "t1", "aaaa"),
            post("2", "bob", 20, "t1", "bbbb"),
            post("3", "naoki", 30, "t1", "cccc"),
        ]
    }

    /// Two posts per section: 4 chars + 10 overhead each, budget 30.
    fn budget() -> ChunkBudget {
        ChunkBudget::new(30).with_overhead(10)
    }

    #[test]
    fn section_text_names_each_author() {
        assert_eq!(section_text(&three_posts()[..2]), "naoki:\naaaa\nbob:\nbbbb\n");
    }

    #[tokio::test]
    async fn sections_are_summarized_then_combined() {
        let s = Scripted::default();
        let digest = summarize_conversation(&s, &three_posts(), budget()).await.unwrap();

        assert_eq!(
            digest.section_summaries,
            vec!["section 1 (4 lines)", "section 2 (2 lines)"]
        );
        assert_eq!(digest.summary, "combined: section 1 (4 lines) + section 2 (2 lines)");
        let sections = s.sections.lock().unwrap();
        assert!(sections[0].contains("bob:\nbbbb"));
        assert!(sections[1].starts_with("naoki:\ncccc"));
        assert_eq!(s.combined.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_section_skips_the_combine_call() {
        let s = Scripted::default();
        let digest = summarize_conversation(&s, &three_posts()[..1], budget()).await.unwrap();
        assert_eq!(digest.summary, "section 1 (2 lines)");
        assert!(s.combined.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_section_is_left_out() {
        let s = Scripted {
            fail_section_containing: Some("cccc"),
            ..Default::default()
        };
        let digest = summarize_conversation(&s, &three_posts(), budget()).await.unwrap();
        assert_eq!(digest.section_summaries, vec!["section 1 (4 lines)"]);
        assert_eq!(digest.summary, "section 1 (4 lines)");
    }

    #[tokio::test]
    async fn nothing_summarized_is_an_error() {
        let s = Scripted {
            fail_section_containing: Some(":"),
            ..Default::default()
        };
        let err = summarize_conversation(&s, &three_posts(), budget()).await.unwrap_err();
        assert!(matches!(err, MuseError::ExternalService(_)));
        assert!(summarize_conversation(&s, &[], budget()).await.is_err());
    }

    #[tokio::test]
    async fn timeline_summaries_are_stored() {
        let archive = Arc::new(ForumArchive::open_in_memory().unwrap());
        archive
            .insert_posts(&[
                post("1", "naoki", 10, "t1", "aaaa"),
                post("2", "bob", 15, "t1", "bbbb"),
                post("3", "naoki", 20, "t2", "cccc"),
                post("4", "carol", 25, "t2", "dddd"),
                post("5", "carol", 26, "t2", "eeee"),
            ])
            .unwrap();

        let s = Scripted::default();
        let report = summarize_timeline(&s, &archive, "naoki", budget()).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.stored.len(), 2);

        let stored = archive.conversation_summaries("naoki").unwrap();
        assert_eq!(stored, report.stored);
        assert_eq!(stored[0].thread_path, "t1");
        assert_eq!((stored[0].start, stored[0].end), (10, 20));
        assert_eq!(stored[0].summary, "section 1 (4 lines)");
        // Three posts in t2 make two sections and one combine call.
        assert_eq!(stored[1].thread_path, "t2");
        assert!(stored[1].summary.starts_with("combined: "));
        assert_eq!(s.combined.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_window_does_not_stop_the_timeline() {
        let archive = Arc::new(ForumArchive::open_in_memory().unwrap());
        archive
            .insert_posts(&[
                post("1", "naoki", 10, "t1", "doomed"),
                post("2", "naoki", 20, "t2", "fine"),
            ])
            .unwrap();
        let s = Scripted {
            fail_section_containing: Some("doomed"),
            ..Default::default()
        };
        let report = summarize_timeline(&s, &archive, "naoki", budget()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored.len(), 1);
        assert_eq!(report.stored[0].thread_path, "t2");
    }
}
