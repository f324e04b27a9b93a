//! Prompt assembly for in-character replies.

use muse_types::{CharacterProfile, ScoredRecord, SummarySnapshot};

/// Sample writing beyond this many characters is cut.
pub const MAX_SAMPLE_CHARS: usize = 3000;

const TRUNCATION_MARK: &str = "\n...[truncated]...";

/// System prompt for roleplaying `profile`, with an excerpt of the
/// character's own writing as a style reference.
pub fn build_system_prompt(profile: &CharacterProfile, sample_writing: &str) -> String {
    let sheet = serde_json::to_string_pretty(profile).unwrap_or_else(|_| profile.name.clone());
    format!(
        "You are roleplaying as the following character in a fantasy setting.\n\n\
         Character Sheet:\n{sheet}\n\n\
         Example Writing by This Character:\n{}\n\n\
         Respond in character, in their own voice and worldview. Draw any \
         catchphrases or mannerisms from the sheet and the examples.",
        truncate_sample(sample_writing)
    )
}

fn truncate_sample(text: &str) -> String {
    match text.char_indices().nth(MAX_SAMPLE_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARK}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Context block placed ahead of the user's message: the channel summary,
/// a memory extracted for this message and any recalled posts. Empty parts
/// are omitted.
pub fn format_reply_context(
    summary: &SummarySnapshot,
    memory: Option<&str>,
    recalled: &[ScoredRecord],
) -> String {
    let mut out = String::new();
    if !summary.is_empty() {
        out.push_str("Memory of this conversation so far:\n");
        out.push_str(summary.summary_text.trim());
        out.push_str("\n\n");
    }
    if let Some(memory) = memory.map(str::trim).filter(|m| !m.is_empty()) {
        out.push_str("Something you remember:\n");
        out.push_str(memory);
        out.push_str("\n\n");
    }
    if !recalled.is_empty() {
        out.push_str("Things you remember writing:\n");
        for hit in recalled {
            out.push_str("- ");
            out.push_str(hit.record.text.trim());
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
