//! Chat screen controller.
//!
//! Owns the history and the message list and applies turn events to them on
//! the caller's task. The transport runs in the background and only talks back
//! through its event channel, so nothing here needs locking.

use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::history::HistoryBuffer;
use crate::reassembler::StreamReassembler;
use crate::session::Session;
use crate::state::{ChatMessage, DisplayMessage, WELCOME_MESSAGE};
use crate::transcript::{MessageList, Transcript};
use crate::transport::{ChatTransport, StreamEnd, TurnEvent, TurnHandle};

/// How a turn ended, as seen by the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(StreamEnd),
    /// The apology is already in the transcript; the error is for a toast.
    Failed(ChatError),
    Cancelled,
}

struct ActiveTurn {
    handle: TurnHandle,
    reassembler: StreamReassembler,
}

pub struct ChatController<L: MessageList = Transcript> {
    transport: ChatTransport,
    history: HistoryBuffer,
    list: L,
    active: Option<ActiveTurn>,
}

impl ChatController<Transcript> {
    pub fn new(transport: ChatTransport, max_turns: usize) -> Self {
        Self::with_list(transport, Transcript::new(), max_turns)
    }
}

impl<L: MessageList> ChatController<L> {
    pub fn with_list(transport: ChatTransport, list: L, max_turns: usize) -> Self {
        let mut controller = Self {
            transport,
            history: HistoryBuffer::new(max_turns),
            list,
            active: None,
        };
        controller.seed_welcome();
        controller
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn list(&self) -> &L {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut L {
        &mut self.list
    }

    pub fn session(&self) -> &Session {
        self.transport.session()
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Visible text of the reply in flight, with thinking segments removed.
    pub fn reply_text(&self) -> Option<&str> {
        self.active.as_ref().map(|turn| turn.reassembler.text())
    }

    /// Shows `text` and starts a turn for it.
    ///
    /// A turn still in flight is cancelled first.
    pub fn send_message(&mut self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.cancel_turn() {
            info!("previous turn replaced by a new message");
        }

        self.list.push(DisplayMessage::sent(text));
        self.list.push(DisplayMessage::typing());

        let history = self.history.cleanup();
        debug!(history = history.len(), "starting chat turn");
        let handle = self.transport.spawn_turn(text.to_string(), history);
        self.active = Some(ActiveTurn {
            handle,
            reassembler: StreamReassembler::new(text),
        });
        Ok(())
    }

    /// Applies one event of the active turn. Returns the outcome once the
    /// turn is over.
    pub fn handle_event(&mut self, event: TurnEvent) -> Option<TurnOutcome> {
        let active = self.active.as_mut()?;
        match event {
            TurnEvent::Fragment(fragment) => {
                active
                    .reassembler
                    .on_fragment(&fragment, &mut self.list, &mut self.history);
                None
            }
            TurnEvent::Reconnecting { attempt, notice } => {
                debug!(attempt, "showing reconnect notice");
                active.reassembler.on_reconnecting(&notice, &mut self.list);
                None
            }
            TurnEvent::Finished(result) => {
                let mut turn = self.active.take()?;
                let outcome = match result {
                    Ok(end) => {
                        turn.reassembler.finish_stream(&mut self.list);
                        TurnOutcome::Completed(end)
                    }
                    Err(ChatError::Cancelled) => {
                        turn.reassembler.abandon(&mut self.list);
                        TurnOutcome::Cancelled
                    }
                    Err(err) => {
                        warn!(error = %err, "chat turn failed");
                        turn.reassembler.fail(&mut self.list, &mut self.history);
                        TurnOutcome::Failed(err)
                    }
                };
                Some(outcome)
            }
        }
    }

    /// Waits for the next event of the active turn; `None` when idle.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        let active = self.active.as_mut()?;
        match active.handle.next_event().await {
            Some(event) => Some(event),
            None => Some(TurnEvent::Finished(Err(ChatError::Transport(
                "chat task stopped unexpectedly".to_string(),
            )))),
        }
    }

    /// Applies every event that is already queued without waiting.
    pub fn pump(&mut self) -> Option<TurnOutcome> {
        loop {
            let active = self.active.as_mut()?;
            let event = match active.handle.try_next_event() {
                Some(event) => event,
                None if active.handle.is_finished() => {
                    // The final event may have landed between the two checks.
                    match active.handle.try_next_event() {
                        Some(event) => event,
                        None => TurnEvent::Finished(Err(ChatError::Transport(
                            "chat task stopped unexpectedly".to_string(),
                        ))),
                    }
                }
                None => return None,
            };
            if let Some(outcome) = self.handle_event(event) {
                return Some(outcome);
            }
        }
    }

    /// Drives the active turn to completion.
    pub async fn run_turn(&mut self) -> Option<TurnOutcome> {
        while let Some(event) = self.next_event().await {
            if let Some(outcome) = self.handle_event(event) {
                return Some(outcome);
            }
        }
        None
    }

    /// Cancels the turn in flight, if any. Its placeholder is removed and
    /// nothing more is committed.
    pub fn cancel_turn(&mut self) -> bool {
        let Some(mut turn) = self.active.take() else {
            return false;
        };
        turn.handle.cancel();
        turn.reassembler.abandon(&mut self.list);
        true
    }

    /// Empties the transcript and history and shows the welcome again.
    pub fn clear_history(&mut self) {
        self.cancel_turn();
        self.list.clear();
        self.history.clear();
        self.seed_welcome();
        info!("chat history cleared");
    }

    pub fn logout(&mut self) {
        self.transport.session().clear();
        self.clear_history();
    }

    fn seed_welcome(&mut self) {
        self.list.push(DisplayMessage::received(WELCOME_MESSAGE));
        self.history.append(ChatMessage::assistant(WELCOME_MESSAGE));
    }
}
