//! REPL – the interactive muse shell.
//!
//! Supported slash-commands:
//!   /help                – show this list
//!   /characters          – list loaded characters
//!   /character <name>    – switch the active character
//!   /mode <chat|axes|recall> – what plain lines do
//!   /summary             – rolling summary of this conversation
//!   /recall <text>       – semantic recall for the active character
//!   /axes <text>         – run every axis over <text>
//!   /timeline <user>     – summarize and store a user's conversations
//!   /ingest <user>       – embed a user's archived posts into the index
//!   /quit | /exit        – exit
//!
//! Anything else is a chat message to the active character.

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::warn;

use muse_memory::archive::OPEN_ENDED;
use muse_memory::ingest::{DEFAULT_INGEST_BATCH, IngestTarget, ingest_posts};
use muse_memory::{ArchiveError, ChunkBudget, ForumPost};
use muse_runtime::persona::build_system_prompt;
use muse_runtime::session::Character;
use muse_runtime::timeline::{DEFAULT_TIMELINE_BUDGET, summarize_timeline};
use muse_runtime::{RecallAxis, RelevanceAxis, SharedAxis, run_immediate_with_timeout};
use muse_types::{AxisInput, NewContextEvent, TimestampedRecord};

use crate::app::{App, LOCAL_CHANNEL, LOCAL_USER};

const AXIS_TIMEOUT: Duration = Duration::from_secs(60);
const MODES: [&str; 3] = ["chat", "axes", "recall"];

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Characters,
    Character(&'a str),
    Mode(&'a str),
    Summary,
    Recall(&'a str),
    Axes(&'a str),
    Timeline(&'a str),
    Ingest(&'a str),
    Quit,
    Message(&'a str),
    /// A known command missing its argument.
    Usage(&'static str),
    Unknown(&'a str),
}

/// Classify one input line. `line` must already be trimmed and non-empty.
pub fn parse(line: &str) -> Command<'_> {
    if !line.starts_with('/') {
        return Command::Message(line);
    }
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    let usage = match cmd {
        "/character" => Some("/character <name>"),
        "/mode" => Some("/mode <chat|axes|recall>"),
        "/recall" => Some("/recall <text>"),
        "/axes" => Some("/axes <text>"),
        "/timeline" => Some("/timeline <user>"),
        "/ingest" => Some("/ingest <user>"),
        _ => None,
    };
    if let Some(usage) = usage {
        if arg.is_empty() {
            return Command::Usage(usage);
        }
    }
    match cmd {
        "/help" => Command::Help,
        "/characters" => Command::Characters,
        "/character" => Command::Character(arg),
        "/mode" => Command::Mode(arg),
        "/summary" => Command::Summary,
        "/recall" => Command::Recall(arg),
        "/axes" => Command::Axes(arg),
        "/timeline" => Command::Timeline(arg),
        "/ingest" => Command::Ingest(arg),
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(rt: &Runtime, app: &App, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start line editor".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline(&format!("{} ", "muse>".bold().cyan())) {
            Ok(l) => l,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse(line) {
            Command::Help => cmd_help(),
            Command::Characters => rt.block_on(cmd_characters(app)),
            Command::Character(name) => rt.block_on(cmd_character(app, name)),
            Command::Mode(mode) => rt.block_on(cmd_mode(app, mode)),
            Command::Summary => rt.block_on(cmd_summary(app)),
            Command::Recall(text) => rt.block_on(cmd_recall(app, text)),
            Command::Axes(text) => rt.block_on(cmd_axes(app, text)),
            Command::Timeline(user) => rt.block_on(cmd_timeline(app, user)),
            Command::Ingest(user) => rt.block_on(cmd_ingest(app, user)),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Message(text) => rt.block_on(async {
                match app.sessions.mode(LOCAL_USER).await.as_str() {
                    "axes" => cmd_axes(app, text).await,
                    "recall" => cmd_recall(app, text).await,
                    _ => cmd_chat(app, text).await,
                }
            }),
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage.bold()),
            Command::Unknown(other) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "muse Commands".bold().underline());
    println!("  {}        – list loaded characters", "/characters".bold().cyan());
    println!("  {} – switch the active character", "/character <name>".bold().cyan());
    println!("  {}  – what plain lines do", "/mode <chat|axes|recall>".bold().cyan());
    println!("  {}           – rolling summary of this chat", "/summary".bold().cyan());
    println!("  {}     – recall for the active character", "/recall <text>".bold().cyan());
    println!("  {}       – run every axis", "/axes <text>".bold().cyan());
    println!("  {}   – summarize a user's conversations", "/timeline <user>".bold().cyan());
    println!("  {}     – embed a user's posts", "/ingest <user>".bold().cyan());
    println!("  {}      – exit", "/quit  /exit".bold().cyan());
    println!("  Anything else is said to the active character.");
    println!();
}

async fn active_character(app: &App) -> Option<Character> {
    let character = app.sessions.selected_character(LOCAL_USER).await;
    if character.is_none() {
        println!(
            "{} Use {} to pick one.",
            "No character selected.".yellow(),
            "/character <name>".bold()
        );
    }
    character
}

async fn cmd_characters(app: &App) {
    let names = app.sessions.character_names().await;
    if names.is_empty() {
        println!(
            "  No characters loaded. Put sheets in {}.",
            app.config.characters_dir.bold()
        );
        return;
    }
    let active = app
        .sessions
        .selected_character(LOCAL_USER)
        .await
        .map(|c| c.profile.name.clone());
    for name in names {
        let marker = if active.as_deref() == Some(name.as_str()) { "▶" } else { " " };
        println!("  {} {}", marker.green(), name.bold());
    }
}

async fn cmd_character(app: &App, name: &str) {
    match app.sessions.select_character(LOCAL_USER, name).await {
        Ok(c) => println!("{} {}", "✓ Now talking to".green(), c.profile.name.bold()),
        Err(e) => println!("{}", e.to_string().red()),
    }
}

async fn cmd_mode(app: &App, mode: &str) {
    if !MODES.contains(&mode) {
        println!("{} '{}' (chat, axes or recall)", "Unknown mode".red(), mode.yellow());
        return;
    }
    app.sessions.set_mode(LOCAL_USER, mode).await;
    println!("{} '{}'.", "Switched mode to".green(), mode.bold());
}

async fn cmd_summary(app: &App) {
    match app.core.get_summary(LOCAL_CHANNEL).await {
        Ok(s) if s.is_empty() => println!("  {}", "Nothing remembered yet.".dimmed()),
        Ok(s) => {
            println!(
                "{} ({} messages)",
                "Memory".bold().underline(),
                s.covered_event_ids.len()
            );
            println!("{}", s.summary_text);
        }
        Err(e) => println!("{}: {}", "Summary unavailable".red(), e),
    }
}

async fn cmd_recall(app: &App, text: &str) {
    let Some(character) = active_character(app).await else { return };
    let hits = app.core.recall(&character.profile.name, text).await;
    if hits.is_empty() {
        println!("  {}", "I do not have any relevant memories about that.".dimmed());
        return;
    }
    for hit in hits {
        println!("  {} {}", format!("{:.3}", hit.score).yellow(), hit.record.text);
    }
}

/// Archived posts of `user`, read on the blocking pool.
async fn archived_posts(app: &App, user: &str) -> Result<Vec<ForumPost>, ArchiveError> {
    let user = user.to_string();
    app.archive.blocking(move |a| a.user_posts(&user)).await
}

/// A character's archived posts as records; empty when the archive fails.
async fn owner_records(app: &App, name: &str) -> Vec<TimestampedRecord> {
    match archived_posts(app, name).await {
        Ok(posts) => posts.iter().map(ForumPost::to_record).collect(),
        Err(e) => {
            warn!(owner = name, error = %e, "archive read failed; continuing without posts");
            Vec::new()
        }
    }
}

async fn cmd_axes(app: &App, text: &str) {
    let character = app.sessions.selected_character(LOCAL_USER).await;
    let recent_memory = match &character {
        Some(c) => owner_records(app, &c.profile.name).await,
        None => Vec::new(),
    };
    let input = AxisInput {
        user_text: text.to_string(),
        owner_profile: character.map(|c| c.profile),
        recent_memory,
    };
    let axes: Vec<SharedAxis> = vec![
        Arc::new(RecallAxis::new(app.core.recall_actor().clone())),
        Arc::new(RelevanceAxis::new(app.driver.clone())),
    ];

    let mut outputs = run_immediate_with_timeout(input, &axes, AXIS_TIMEOUT).await;
    outputs.sort_by(|a, b| a.axis.cmp(&b.axis));
    if outputs.len() < axes.len() {
        println!("  {}", "Some axes did not finish in time.".yellow());
    }
    for out in outputs {
        println!("  {:<10} {:>3}  {}", out.axis.bold(), out.score.to_string().yellow(), out.reason);
    }
}

async fn cmd_timeline(app: &App, user: &str) {
    println!("  Summarizing conversations of {} …", user.bold());
    let budget = ChunkBudget::new(DEFAULT_TIMELINE_BUDGET);
    let report = match summarize_timeline(app.driver.as_ref(), &app.archive, user, budget).await {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", "Archive error".red(), e);
            return;
        }
    };
    if report.stored.is_empty() && report.failed == 0 {
        println!("  No conversations found for {}.", user.bold());
        return;
    }
    for conv in &report.stored {
        let end = if conv.end == OPEN_ENDED {
            "…".to_string()
        } else {
            format_time(conv.end)
        };
        println!(
            "  {} {} → {}",
            conv.thread_path.bold(),
            format_time(conv.start).dimmed(),
            end.dimmed()
        );
        println!("    {}", conv.summary);
    }
    if report.failed > 0 {
        println!("  {} {} conversations not summarized", "!".yellow(), report.failed);
    }
}

async fn cmd_ingest(app: &App, user: &str) {
    let posts = match archived_posts(app, user).await {
        Ok(p) => p,
        Err(e) => {
            println!("{}: {}", "Archive error".red(), e);
            return;
        }
    };
    if posts.is_empty() {
        println!("  No archived posts for {}.", user.bold());
        return;
    }
    println!("  Embedding {} posts for {} …", posts.len(), user.bold());
    let target = IngestTarget {
        collection: &app.config.collection,
        dimensionality: app.config.vector_size,
        batch_size: DEFAULT_INGEST_BATCH,
    };
    match ingest_posts(&posts, app.driver.as_ref(), app.index.as_ref(), target).await {
        Ok(report) => println!(
            "{} {} records in {} batches (batch id {})",
            "✓ Ingested".green(),
            report.records,
            report.batches,
            report.batch_id.to_string().dimmed()
        ),
        Err(e) => println!("{}: {}", "Ingestion stopped".red(), e),
    }
}

async fn cmd_chat(app: &App, text: &str) {
    let Some(character) = active_character(app).await else { return };
    let name = character.profile.name.as_str();
    let now = chrono::Utc::now().timestamp();

    let owner_posts = owner_records(app, name).await;
    let message = NewContextEvent::message(LOCAL_CHANNEL, LOCAL_USER, LOCAL_USER, text, now);
    let ctx = match app.core.prepare_reply(message, name, &owner_posts).await {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("{}: {}", "Memory error".red(), e);
            return;
        }
    };

    let system = build_system_prompt(&character.profile, &character.writing);
    let reply = match app
        .driver
        .generate_reply(&system, &ctx.prompt_context(), text)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            return;
        }
    };
    println!("{} {}", format!("{name}:").bold().magenta(), reply);

    if let Err(e) = app
        .core
        .append_message(LOCAL_CHANNEL, &muse_runtime::session::slug(name), name, &reply, now)
        .await
    {
        warn!(error = %e, "reply not stored in memory");
    }
}

fn format_time(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| unix.to_string())
}
