//! LLM prompt assembly
//!
//! Builds the chat message list from the device profile and the session's
//! recent turn history.

use serde::Serialize;

use crate::profile::DeviceProfile;

/// One chat message in the provider wire format
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// "system", "user", or "assistant"
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Build a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Build an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A completed exchange kept for conversational context
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    /// What the child said
    pub user_text: String,
    /// What the toy replied
    pub reply_text: String,
}

/// Build the message list for one turn
///
/// The history window keeps the most recent `max_history_turns` exchanges.
#[must_use]
pub fn build_messages(
    profile: &DeviceProfile,
    history: &[HistoryTurn],
    user_text: &str,
    max_history_turns: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt(profile))];

    let start = history.len().saturating_sub(max_history_turns);
    for turn in &history[start..] {
        if !turn.user_text.is_empty() {
            messages.push(ChatMessage::user(turn.user_text.clone()));
        }
        if !turn.reply_text.is_empty() {
            messages.push(ChatMessage::assistant(turn.reply_text.clone()));
        }
    }

    messages.push(ChatMessage::user(user_text));
    messages
}

/// Render the persona system prompt for a device
fn system_prompt(profile: &DeviceProfile) -> String {
    let age = profile
        .child_age
        .map_or_else(|| "unknown".to_string(), |a| a.to_string());
    let child = profile.child_name.as_deref().unwrap_or("the child");
    let interests = if profile.interests.is_empty() {
        "not known yet".to_string()
    } else {
        profile.interests.join(", ")
    };
    let forbidden = if profile.forbidden_topics.is_empty() {
        "no special restrictions".to_string()
    } else {
        profile.forbidden_topics.join(", ")
    };

    format!(
        "You are a voice companion toy for children named \"{toy}\". \
         Your personality: {persona}. \
         You are talking with {child}, who is about {age} years old. \
         Their interests: {interests}. \
         Topics the parents have ruled out: {forbidden}. \
         When chatting, follow these rules: \
         1) use short, warm, concrete sentences, like a good friend their age; \
         2) encourage and affirm, never criticize; \
         3) if something dangerous, violent, private, or otherwise sensitive \
         comes up, gently decline and steer toward a safe, happy topic; \
         4) never bring in grown-up concepts; \
         5) keep every reply brief enough to say out loud in a few seconds.",
        toy = profile.toy_name,
        persona = profile.toy_persona,
    )
}
