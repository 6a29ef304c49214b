//! UI-agnostic conversation types
//!
//! This module contains the data structures shared between the transport, the
//! reply reassembler and whatever front-end renders the conversation. Nothing in
//! here depends on a specific UI framework.

use serde::{Deserialize, Serialize};

/// Shown while the assistant has not produced any visible text yet.
pub const TYPING_PLACEHOLDER: &str = "Typing...";

/// Seeded as the first assistant message of every conversation.
pub const WELCOME_MESSAGE: &str =
    "Hello! I'm Xiaoqing, your AI assistant. How can I help you today?";

/// Appended to the transcript (and history) when a turn fails for good.
pub const APOLOGY_MESSAGE: &str =
    "Sorry, I ran into a problem. Please try again later.";

/// A chat message in the conversation context sent to the backend.
///
/// Messages are immutable once created; replacing one in the history means
/// building a new message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    role: ChatRole,
    content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn role(&self) -> ChatRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Exact (role, content) match.
    pub fn matches(&self, role: ChatRole, content: &str) -> bool {
        self.role == role && self.content == content
    }
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A message as shown in the transcript.
///
/// `text` is mutated in place while a reply streams in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub text: String,
    /// Local wall-clock time, `HH:mm`.
    pub timestamp: String,
    pub is_sent: bool,
}

impl DisplayMessage {
    /// A message typed by the user.
    pub fn sent(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: current_time(),
            is_sent: true,
        }
    }

    /// A message from the assistant.
    pub fn received(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: current_time(),
            is_sent: false,
        }
    }

    pub fn typing() -> Self {
        Self::received(TYPING_PLACEHOLDER)
    }

    pub fn is_typing_placeholder(&self) -> bool {
        !self.is_sent && self.text == TYPING_PLACEHOLDER
    }
}

fn current_time() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// Body of `POST /chat/stream`.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub content: &'a str,
    pub history: &'a [ChatMessage],
}

/// Token pair returned by login, registration and password endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl TokenResponse {
    /// `"<token_type> <access_token>"`
    pub fn auth_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_wire_shape() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let request = ChatRequest {
            content: "how are you?",
            history: &history,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "how are you?",
                "history": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"}
                ]
            })
        );
    }

    #[test]
    fn test_token_auth_header() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","token_type":"bearer"}"#).unwrap();
        assert_eq!(token.auth_header(), "bearer abc");
    }

    #[test]
    fn test_typing_placeholder_only_matches_assistant_side() {
        assert!(DisplayMessage::typing().is_typing_placeholder());
        assert!(!DisplayMessage::sent(TYPING_PLACEHOLDER).is_typing_placeholder());
        assert_eq!(DisplayMessage::received("x").timestamp.len(), 5);
    }
}
