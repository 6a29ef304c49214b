use std::time::{Duration, Instant};

use ratatui::layout::Rect;
use xiaoqing_core::state::DisplayMessage;
use xiaoqing_core::{ChatController, ChatError, MessageList, TurnOutcome};

const TOAST_DURATION: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Error,
}

/// A short-lived notice shown in the footer.
#[derive(Debug, Clone)]
pub struct Toast {
    pub message: String,
    pub level: ToastLevel,
    expires_at: Instant,
}

pub struct App {
    pub should_quit: bool,
    pub controller: ChatController,

    // Input line
    pub input: String,
    pub cursor: usize, // cursor position in input, in chars

    // Transcript viewport
    pub scroll: u16,
    pub follow_tail: bool,
    pub chat_height: u16, // inner height of the transcript area
    pub chat_width: u16,  // inner width of the transcript area
    pub chat_area: Option<Rect>,

    pub toast: Option<Toast>,
    pub animation_frame: u8, // 0-2 for the typing ellipsis
    ticks: u8,
}

impl App {
    pub fn new(controller: ChatController) -> Self {
        Self {
            should_quit: false,
            controller,
            input: String::new(),
            cursor: 0,
            scroll: 0,
            follow_tail: true,
            chat_height: 0,
            chat_width: 0,
            chat_area: None,
            toast: None,
            animation_frame: 0,
            ticks: 0,
        }
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        self.controller.list().messages()
    }

    pub fn is_waiting(&self) -> bool {
        self.controller.is_busy()
    }

    /// Sends the input line as a new turn.
    pub fn submit(&mut self) {
        let text = self.input.trim().to_string();
        if text.is_empty() {
            return;
        }
        if let Err(err) = self.controller.send_message(&text) {
            self.show_toast(err.user_message(), ToastLevel::Error);
            return;
        }
        self.input.clear();
        self.cursor = 0;
        self.follow_tail = true;
    }

    /// Applies queued turn events and advances timers.
    pub fn on_tick(&mut self) {
        if let Some(outcome) = self.controller.pump() {
            self.apply_outcome(outcome);
        }

        // Wrapped height is only recomputed when the transcript changed
        let changed = !self.controller.list_mut().take_changes().is_empty();
        if changed && self.follow_tail {
            self.scroll_to_bottom();
        }

        if self
            .toast
            .as_ref()
            .is_some_and(|toast| Instant::now() >= toast.expires_at)
        {
            self.toast = None;
        }

        // Animate at roughly 300ms per frame
        self.ticks = self.ticks.wrapping_add(1);
        if self.is_waiting() && self.ticks % 6 == 0 {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    pub fn apply_outcome(&mut self, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::Completed(_) | TurnOutcome::Cancelled => {}
            TurnOutcome::Failed(ChatError::SessionExpired) => self.show_toast(
                "Session expired, run `xiaoqing login` to log in again",
                ToastLevel::Error,
            ),
            TurnOutcome::Failed(ChatError::Unauthenticated) => self.show_toast(
                "Not logged in, run `xiaoqing login` first",
                ToastLevel::Error,
            ),
            TurnOutcome::Failed(err) => self.show_toast(err.user_message(), ToastLevel::Error),
        }
    }

    pub fn clear_history(&mut self) {
        self.controller.clear_history();
        self.scroll = 0;
        self.follow_tail = true;
        self.show_toast("Chat history cleared", ToastLevel::Info);
    }

    pub fn show_toast(&mut self, message: impl Into<String>, level: ToastLevel) {
        self.toast = Some(Toast {
            message: message.into(),
            level,
            expires_at: Instant::now() + TOAST_DURATION,
        });
    }

    // Input editing

    pub fn insert_char(&mut self, c: char) {
        let byte_pos = char_to_byte_index(&self.input, self.cursor);
        self.input.insert(byte_pos, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            let byte_pos = char_to_byte_index(&self.input, self.cursor);
            self.input.remove(byte_pos);
        }
    }

    pub fn delete(&mut self) {
        if self.cursor < self.input.chars().count() {
            let byte_pos = char_to_byte_index(&self.input, self.cursor);
            self.input.remove(byte_pos);
        }
    }

    pub fn cursor_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn cursor_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.input.chars().count());
    }

    pub fn cursor_home(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor_end(&mut self) {
        self.cursor = self.input.chars().count();
    }

    // Transcript scrolling

    pub fn scroll_up(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_sub(lines);
        self.follow_tail = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_add(lines).min(self.max_scroll());
        self.follow_tail = self.scroll >= self.max_scroll();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = self.max_scroll();
    }

    fn max_scroll(&self) -> u16 {
        let width = if self.chat_width > 0 { self.chat_width as usize } else { 50 };
        let visible = if self.chat_height > 0 { self.chat_height } else { 20 };
        transcript_height(self.messages(), width).saturating_sub(visible)
    }
}

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Rendered height of the transcript when wrapped at `width` columns.
pub fn transcript_height(messages: &[DisplayMessage], width: usize) -> u16 {
    let width = width.max(1);
    let mut total: usize = 0;
    for message in messages {
        total += 1; // Label line ("You" / "Xiaoqing" with time)
        for line in message.text.lines() {
            let chars = line.chars().count();
            total += if chars == 0 { 1 } else { chars.div_ceil(width) };
        }
        total += 1; // Blank line after message
    }
    u16::try_from(total).unwrap_or(u16::MAX)
}
