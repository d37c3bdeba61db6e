use std::time::Duration;

use tokio::time::Instant;

/// Peer typing indicator with a bounded lifetime.
///
/// A peer that starts typing and then disconnects never sends a stop, so
/// every start carries an expiry that only a refresh pushes out.
#[derive(Clone, Debug)]
pub struct PeerPresence {
    window: Duration,
    typing: bool,
    expires_at: Option<Instant>,
}

impl Default for PeerPresence {
    fn default() -> Self {
        Self::new(Duration::from_millis(6_000))
    }
}

impl PeerPresence {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            typing: false,
            expires_at: None,
        }
    }

    /// Apply a `typing` frame from the peer. Returns whether the visible
    /// state changed.
    pub fn apply(&mut self, is_typing: bool, now: Instant) -> bool {
        self.expires_at = is_typing.then(|| now + self.window);
        std::mem::replace(&mut self.typing, is_typing) != is_typing
    }

    /// Clear the indicator if it has outlived its window.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) if at <= now => self.clear(),
            _ => false,
        }
    }

    pub fn clear(&mut self) -> bool {
        self.expires_at = None;
        std::mem::take(&mut self.typing)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(6);

    #[test]
    fn start_then_expire() {
        let t0 = Instant::now();
        let mut presence = PeerPresence::new(WINDOW);

        assert!(presence.apply(true, t0));
        assert!(presence.is_typing());
        assert!(!presence.poll_expired(t0 + Duration::from_secs(5)));
        assert!(presence.poll_expired(t0 + WINDOW));
        assert!(!presence.is_typing());
        assert_eq!(presence.deadline(), None);
    }

    #[test]
    fn refresh_extends_window_without_change() {
        let t0 = Instant::now();
        let mut presence = PeerPresence::new(WINDOW);

        assert!(presence.apply(true, t0));
        assert!(!presence.apply(true, t0 + Duration::from_secs(4)));
        assert!(!presence.poll_expired(t0 + WINDOW));
        assert!(presence.poll_expired(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn explicit_stop_clears_deadline() {
        let t0 = Instant::now();
        let mut presence = PeerPresence::default();

        let _ = presence.apply(true, t0);
        assert!(presence.apply(false, t0));
        assert_eq!(presence.deadline(), None);
        assert!(!presence.apply(false, t0));
    }

    #[test]
    fn clear_reports_previous_state() {
        let mut presence = PeerPresence::default();
        assert!(!presence.clear());
        let _ = presence.apply(true, Instant::now());
        assert!(presence.clear());
    }
}
