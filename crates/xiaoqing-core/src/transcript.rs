//! Message list seam between the conversation logic and a front-end.

use crate::state::DisplayMessage;

/// Ordered sequence of displayed messages.
///
/// The reassembler and controller only talk to the transcript through this
/// trait, so a front-end can back it with whatever it renders from.
pub trait MessageList {
    fn messages(&self) -> &[DisplayMessage];

    /// Appends a message and returns its index.
    fn push(&mut self, message: DisplayMessage) -> usize;

    /// Replaces the text of the message at `index` in place.
    fn update_text(&mut self, index: usize, text: &str);

    fn remove(&mut self, index: usize) -> Option<DisplayMessage>;

    fn clear(&mut self);

    fn len(&self) -> usize {
        self.messages().len()
    }

    fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    fn last(&self) -> Option<&DisplayMessage> {
        self.messages().last()
    }

    /// Removes the most recent typing placeholder, if any.
    fn remove_typing_placeholder(&mut self) -> Option<usize> {
        let index = self
            .messages()
            .iter()
            .rposition(DisplayMessage::is_typing_placeholder)?;
        self.remove(index);
        Some(index)
    }
}

/// A change the renderer has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    Inserted(usize),
    Updated(usize),
    Removed(usize),
    Cleared,
}

/// `Vec`-backed [`MessageList`] that records changes for the renderer.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    messages: Vec<DisplayMessage>,
    changes: Vec<ListChange>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the changes recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<ListChange> {
        std::mem::take(&mut self.changes)
    }
}

impl MessageList for Transcript {
    fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    fn push(&mut self, message: DisplayMessage) -> usize {
        self.messages.push(message);
        let index = self.messages.len() - 1;
        self.changes.push(ListChange::Inserted(index));
        index
    }

    fn update_text(&mut self, index: usize, text: &str) {
        if let Some(message) = self.messages.get_mut(index) {
            if message.text != text {
                message.text.clear();
                message.text.push_str(text);
                self.changes.push(ListChange::Updated(index));
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<DisplayMessage> {
        if index >= self.messages.len() {
            return None;
        }
        self.changes.push(ListChange::Removed(index));
        Some(self.messages.remove(index))
    }

    /// Pending changes collapse into a single `Cleared`.
    fn clear(&mut self) {
        self.messages.clear();
        self.changes.clear();
        self.changes.push(ListChange::Cleared);
    }
}
