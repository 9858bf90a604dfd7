//! In-memory conversation state
//!
//! The message list the UI renders. Only the send orchestrator and the
//! streaming pipeline mutate it, through append / update-by-id /
//! filter-by-index / truncate.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WELCOME_MESSAGE_ID: &str = "welcome-msg";

const WELCOME_TEXT: &str = "**Welcome to Kacademyx!**\n\n\
I'm your AI learning assistant, here to help you explore any topic, answer your \
questions, and make learning easier and more engaging.\n\n\
**Here are some things I can help you with:**\n\
- Explain complex concepts in simple terms\n\
- Answer questions about science, math, history, and more\n\
- Provide step-by-step solutions to problems\n\
- Create study plans and learning strategies\n\n\
Feel free to ask me anything! What would you like to learn today?";

/// Shown when a response was stopped before any text arrived
pub const STOPPED_MARKER: &str = "*[Stopped]*";

/// Appended to whatever text survived when every attempt failed
pub const FAILED_MARKER: &str = "*[Connection Failed]*";

/// Titles that are replaced by the first message of a chat
pub const DEFAULT_CHAT_TITLES: [&str; 2] = ["New Chat", "Chat"];

const TITLE_MAX_CHARS: usize = 30;

pub fn retrying_marker(attempt: u32, max_attempts: u32) -> String {
    format!("*[Network hiccup, retrying ({attempt}/{max_attempts})...]*")
}

/// Content shown after the retry budget is exhausted
pub fn failed_content(partial: &str) -> String {
    if partial.is_empty() {
        FAILED_MARKER.to_string()
    } else {
        format!("{partial}\n\n{FAILED_MARKER}")
    }
}

/// Title for a chat derived from its first message
pub fn generate_chat_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.is_empty() {
        return DEFAULT_CHAT_TITLES[0].to_string();
    }
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role/content pair sent to the chat endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: Role,
    pub content: String,
}

/// A message as the user sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Set once the message has been written to the store
    pub saved: bool,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: format!("user-{}", uuid::Uuid::new_v4()),
            role: Role::User,
            content: content.into(),
            saved: false,
        }
    }

    /// Empty assistant message whose id stays fixed across retries
    pub fn assistant_placeholder() -> Self {
        Self {
            id: format!("ai-{}", uuid::Uuid::new_v4()),
            role: Role::Assistant,
            content: String::new(),
            saved: false,
        }
    }

    pub fn welcome() -> Self {
        Self {
            id: WELCOME_MESSAGE_ID.to_string(),
            role: Role::Assistant,
            content: WELCOME_TEXT.to_string(),
            saved: true,
        }
    }

    pub fn is_welcome(&self) -> bool {
        self.id == WELCOME_MESSAGE_ID
    }

    fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Ordered message list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn with_welcome() -> Self {
        Self {
            messages: vec![ConversationMessage::welcome()],
        }
    }

    pub fn from_messages(messages: Vec<ConversationMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn append(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    /// Replace the content of a message with a full snapshot.
    ///
    /// Returns `true` if the visible content changed; re-applying the same
    /// snapshot is a no-op.
    pub fn apply_snapshot(&mut self, id: &str, content: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if message.content != content => {
                content.clone_into(&mut message.content);
                true
            }
            _ => false,
        }
    }

    pub fn set_saved(&mut self, id: &str, saved: bool) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.saved = saved;
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> Option<ConversationMessage> {
        (index < self.messages.len()).then(|| self.messages.remove(index))
    }

    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// History sent with the next request. The welcome message is UI chrome
    /// and never leaves the client.
    pub fn outgoing(&self) -> Vec<OutgoingMessage> {
        self.messages
            .iter()
            .filter(|m| !m.is_welcome())
            .map(ConversationMessage::to_outgoing)
            .collect()
    }
}
