use std::time::Duration;

use parley_core::ClientFrame;
use tokio::time::Instant;

/// Discrete typing signal produced by the debouncer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }

    pub fn frame(self) -> ClientFrame {
        ClientFrame::Typing {
            is_typing: self.is_typing(),
        }
    }
}

/// Turns a stream of "user is editing" signals into typing start/stop.
///
/// Holds a single idle deadline; every edit pushes it out and the owner is
/// responsible for calling [`poll_expired`](Self::poll_expired) once it
/// passes.
#[derive(Clone, Debug)]
pub struct TypingDebouncer {
    idle: Duration,
    typing: bool,
    deadline: Option<Instant>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            typing: false,
            deadline: None,
        }
    }

    pub fn set_editing(&mut self, editing: bool, now: Instant) -> Option<TypingSignal> {
        if editing {
            self.deadline = Some(now + self.idle);
            if self.typing {
                return None;
            }
            self.typing = true;
            Some(TypingSignal::Start)
        } else {
            self.deadline = None;
            std::mem::take(&mut self.typing).then_some(TypingSignal::Stop)
        }
    }

    /// Emit `Stop` if the idle deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.set_editing(false, now),
            _ => None,
        }
    }

    /// Forget typing state without emitting anything, e.g. after the
    /// connection it was announced on went away.
    pub fn reset(&mut self) {
        self.typing = false;
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle
    }
}
