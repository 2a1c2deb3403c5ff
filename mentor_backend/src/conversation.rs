use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What produced a conversation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A user message and the assistant's reply to it.
    UserReply,
    /// A question the assistant opened a session with.
    AssistantQuestion,
    SystemNote,
}

impl EntryKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            EntryKind::UserReply => "user_reply",
            EntryKind::AssistantQuestion => "assistant_question",
            EntryKind::SystemNote => "system_note",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user_reply" => Some(EntryKind::UserReply),
            "assistant_question" => Some(EntryKind::AssistantQuestion),
            "system_note" => Some(EntryKind::SystemNote),
            _ => None,
        }
    }

    /// Classify rows written before the kind column existed.
    pub fn infer_legacy(user_input: Option<&str>, ai_prompt: Option<&str>) -> Self {
        let filled = |value: Option<&str>| value.map(|v| !v.trim().is_empty()).unwrap_or(false);
        if filled(user_input) {
            EntryKind::UserReply
        } else if filled(ai_prompt) {
            EntryKind::AssistantQuestion
        } else {
            EntryKind::SystemNote
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: String,
    pub user_id: String,
    pub kind: EntryKind,
    pub user_input: Option<String>,
    pub ai_response: Option<String>,
    pub ai_prompt: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    fn new(user_id: &str, kind: EntryKind, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            user_input: None,
            ai_response: None,
            ai_prompt: None,
            timestamp: now,
        }
    }

    pub fn user_reply(user_id: &str, user_input: &str, ai_response: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_input: Some(user_input.to_string()),
            ai_response: Some(ai_response.to_string()),
            ..Self::new(user_id, EntryKind::UserReply, now)
        }
    }

    pub fn assistant_question(user_id: &str, question: &str, now: DateTime<Utc>) -> Self {
        Self {
            ai_prompt: Some(question.to_string()),
            ..Self::new(user_id, EntryKind::AssistantQuestion, now)
        }
    }

    /// Transcript lines for this row, in speaking order.
    pub fn transcript_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(question) = non_empty(self.ai_prompt.as_deref()) {
            lines.push(format!("Interviewfrage: {}", question));
        }
        if let Some(input) = non_empty(self.user_input.as_deref()) {
            lines.push(format!("User: {}", input));
        }
        if let Some(reply) = non_empty(self.ai_response.as_deref()) {
            match self.kind {
                EntryKind::SystemNote => lines.push(format!("Notiz: {}", reply)),
                _ => lines.push(format!("Berater: {}", reply)),
            }
        }
        lines
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Render chronological entries as "User:"/"Berater:"/"Interviewfrage:" lines.
pub fn transcript(entries: &[ConversationEntry]) -> Vec<String> {
    entries.iter().flat_map(|e| e.transcript_lines()).collect()
}

/// Rough token estimate used for prompt budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split transcript lines into (older, kept) so that the kept tail fits the
/// token budget. The newest line is always kept.
pub fn split_for_budget(lines: Vec<String>, token_budget: usize) -> (Vec<String>, Vec<String>) {
    let mut used = 0usize;
    let mut cut = lines.len();
    for (idx, line) in lines.iter().enumerate().rev() {
        let cost = estimate_tokens(line);
        if used + cost > token_budget && cut < lines.len() {
            break;
        }
        used += cost;
        cut = idx;
    }
    let mut lines = lines;
    let kept = lines.split_off(cut);
    (lines, kept)
}
