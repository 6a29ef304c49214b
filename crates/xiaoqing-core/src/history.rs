//! Bounded conversation context sent with every chat turn.

use std::collections::HashSet;

use crate::state::{ChatMessage, ChatRole};

/// Turns retained by default; one turn is a user message plus the reply.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Ordered, role-tagged messages with a hard cap of `2 * max_turns` entries.
///
/// The oldest entries are evicted from the front whenever the cap is exceeded,
/// and no two adjacent entries are ever the same (role, content) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBuffer {
    messages: Vec<ChatMessage>,
    max_turns: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

impl HistoryBuffer {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    /// Maximum number of stored messages.
    pub fn capacity(&self) -> usize {
        self.max_turns.saturating_mul(2)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn contains(&self, role: ChatRole, content: &str) -> bool {
        self.position(role, content).is_some()
    }

    /// Index of the first entry equal to (role, content).
    pub fn position(&self, role: ChatRole, content: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.matches(role, content))
    }

    /// Index of the most recent entry with `role`.
    pub fn last_position(&self, role: ChatRole) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role() == role)
    }

    /// Appends `message` unless it repeats the current last entry.
    ///
    /// Returns whether the message was stored. The cap is enforced afterwards.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.messages.last() == Some(&message) {
            return false;
        }
        self.messages.push(message);
        self.enforce_cap();
        true
    }

    /// Appends `message` unless an identical entry exists anywhere.
    pub fn append_unique(&mut self, message: ChatMessage) -> bool {
        if self.contains(message.role(), message.content()) {
            return false;
        }
        self.append(message)
    }

    /// Overwrites the most recent entry with `role`, returning its index.
    pub fn replace_last(&mut self, role: ChatRole, content: impl Into<String>) -> Option<usize> {
        let index = self.last_position(role)?;
        self.messages[index] = ChatMessage::new(role, content);
        Some(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<ChatMessage> {
        (index < self.messages.len()).then(|| self.messages.remove(index))
    }

    /// Copy of the history with duplicate (role, content) pairs removed,
    /// keeping the first occurrence of each.
    pub fn cleanup(&self) -> Vec<ChatMessage> {
        dedup_messages(&self.messages)
    }

    /// Evicts from the front until at most `2 * max_turns` entries remain.
    /// Returns the number of evicted entries.
    pub fn trim_to_cap(&mut self, max_turns: usize) -> usize {
        let cap = max_turns.saturating_mul(2);
        let excess = self.messages.len().saturating_sub(cap);
        if excess > 0 {
            self.messages.drain(..excess);
        }
        excess
    }

    pub fn enforce_cap(&mut self) -> usize {
        self.trim_to_cap(self.max_turns)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Removes duplicate (role, content) pairs, preserving first-seen order.
pub fn dedup_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut seen: HashSet<(ChatRole, &str)> = HashSet::new();
    messages
        .iter()
        .filter(|m| seen.insert((m.role(), m.content())))
        .cloned()
        .collect()
}
