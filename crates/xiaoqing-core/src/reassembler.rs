//! Turns the fragment stream of one chat turn into transcript updates and
//! history commits.
//!
//! The backend interleaves a hidden "thinking" segment, delimited by the
//! characters `<` and `>`, with the visible reply. Only the visible part is
//! shown. The turn's messages are committed to the history
//! every time a sentence ends, so an interrupted reply still leaves usable
//! context behind.

use tracing::{debug, warn};

use crate::history::HistoryBuffer;
use crate::state::{APOLOGY_MESSAGE, ChatMessage, ChatRole, DisplayMessage};
use crate::transcript::MessageList;

const THINKING_START: char = '<';
const THINKING_END: char = '>';
const SENTENCE_TERMINATORS: [char; 6] = ['.', '?', '!', '。', '？', '！'];

const REASONING_OPENERS: [&str; 2] = ["Okay, ", "好的，"];
const REASONING_MARKERS: [&str; 4] = ["I need to", "I should", "我需要", "我应该"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Nothing visible yet.
    Idle,
    /// Inside the hidden segment.
    Thinking,
    /// Accumulating visible text.
    Visible,
    /// The last fragment ended a sentence and the text is in the history.
    Committed,
}

/// Per-turn streaming state.
#[derive(Debug)]
pub struct StreamReassembler {
    user_message: String,
    phase: TurnPhase,
    accumulator: String,
    display_index: Option<usize>,
    user_committed: bool,
    assistant_committed: bool,
}

impl StreamReassembler {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            phase: TurnPhase::Idle,
            accumulator: String::new(),
            display_index: None,
            user_committed: false,
            assistant_committed: false,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Visible text received so far.
    pub fn text(&self) -> &str {
        &self.accumulator
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Transcript index of the assistant message this turn is writing to.
    pub fn display_index(&self) -> Option<usize> {
        self.display_index
    }

    /// Applies one fragment. A fragment may carry a run of characters; each
    /// one goes through the marker and sentence checks on its own.
    pub fn on_fragment<L>(&mut self, fragment: &str, list: &mut L, history: &mut HistoryBuffer)
    where
        L: MessageList + ?Sized,
    {
        let mut changed = false;
        for ch in fragment.chars() {
            changed |= self.on_char(ch, history);
        }
        if changed {
            self.render(list);
        }
    }

    /// Returns whether the visible text grew.
    fn on_char(&mut self, ch: char, history: &mut HistoryBuffer) -> bool {
        if ch == THINKING_START {
            self.phase = TurnPhase::Thinking;
            return false;
        }
        if self.phase == TurnPhase::Thinking {
            if ch == THINKING_END {
                self.phase = if self.accumulator.is_empty() {
                    TurnPhase::Idle
                } else {
                    TurnPhase::Visible
                };
            }
            return false;
        }

        if ch == '\n' && (self.accumulator.is_empty() || self.accumulator.ends_with('\n')) {
            return false;
        }
        self.accumulator.push(ch);
        self.phase = TurnPhase::Visible;

        if SENTENCE_TERMINATORS.contains(&ch) {
            self.commit(history);
        }
        true
    }

    /// A transport retry is about to resend the whole reply.
    ///
    /// The notice is shown as its own line and the next attempt writes to a
    /// fresh assistant message. Commit flags are kept so the retried reply
    /// replaces whatever the interrupted one committed.
    pub fn on_reconnecting<L>(&mut self, notice: &str, list: &mut L)
    where
        L: MessageList + ?Sized,
    {
        list.remove_typing_placeholder();
        list.push(DisplayMessage::received(notice));
        self.accumulator.clear();
        self.display_index = None;
        self.phase = TurnPhase::Idle;
    }

    /// The stream ended normally. Makes sure the transcript shows the whole
    /// accumulated text and drops a placeholder that never got replaced.
    pub fn finish_stream<L>(&mut self, list: &mut L)
    where
        L: MessageList + ?Sized,
    {
        if self.accumulator.is_empty() {
            list.remove_typing_placeholder();
            debug!("turn ended without visible text");
            return;
        }
        self.render(list);
    }

    /// The turn failed for good: the apology replaces the placeholder and is
    /// recorded in the history.
    pub fn fail<L>(&mut self, list: &mut L, history: &mut HistoryBuffer)
    where
        L: MessageList + ?Sized,
    {
        list.remove_typing_placeholder();
        list.push(DisplayMessage::received(APOLOGY_MESSAGE));
        history.append(ChatMessage::assistant(APOLOGY_MESSAGE));
    }

    /// The turn was cancelled; nothing else is committed.
    pub fn abandon<L>(&mut self, list: &mut L)
    where
        L: MessageList + ?Sized,
    {
        list.remove_typing_placeholder();
    }

    fn render<L>(&mut self, list: &mut L)
    where
        L: MessageList + ?Sized,
    {
        match self.display_index {
            Some(index) if index < list.len() => list.update_text(index, &self.accumulator),
            _ => {
                list.remove_typing_placeholder();
                self.display_index = Some(list.push(DisplayMessage::received(self.accumulator.clone())));
            }
        }
    }

    fn commit(&mut self, history: &mut HistoryBuffer) {
        if !self.user_committed {
            history.append_unique(ChatMessage::user(self.user_message.clone()));
            self.user_committed = true;
        }

        let reply = strip_reasoning_preamble(self.accumulator.trim());
        if reply.is_empty() {
            return;
        }

        if let Some(existing) = history.position(ChatRole::Assistant, reply) {
            // Already recorded, by this turn or an earlier one. A partial entry
            // this turn left elsewhere is now stale.
            if self.assistant_committed {
                if let Some(own) = history.last_position(ChatRole::Assistant) {
                    if own != existing {
                        history.remove(own);
                        debug!("dropped partial reply duplicating an earlier entry");
                    }
                }
            }
        } else if self.assistant_committed {
            if history.replace_last(ChatRole::Assistant, reply).is_none() {
                warn!("committed reply missing from history; appending");
                history.append(ChatMessage::assistant(reply));
            }
        } else {
            history.append(ChatMessage::assistant(reply));
            self.assistant_committed = true;
        }

        history.enforce_cap();
        self.phase = TurnPhase::Committed;
        debug!(chars = reply.chars().count(), history = history.len(), "reply committed to history");
    }
}

/// Drops leaked reasoning from a reply.
///
/// A reply that opens like a reasoning preamble or mentions planning phrases
/// is cut after its last blank line, provided something substantial remains.
pub fn strip_reasoning_preamble(reply: &str) -> &str {
    let leaked = REASONING_OPENERS.iter().any(|opener| reply.starts_with(opener))
        || REASONING_MARKERS.iter().any(|marker| reply.contains(marker));
    if !leaked {
        return reply;
    }
    match reply.rfind("\n\n") {
        Some(index) if index > 0 => {
            let rest = &reply[index + 2..];
            if rest.chars().count() >= 2 {
                rest
            } else {
                reply
            }
        }
        _ => reply,
    }
}
