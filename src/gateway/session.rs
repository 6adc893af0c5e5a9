//! Session bookkeeping shared by the receiver, heartbeat and reconnect tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, warn};

/// Connection lifecycle as seen by the consumer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
    WaitOffline,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::WaitOffline => "wait_offline",
        };
        f.write_str(name)
    }
}

/// Identity and position of the current gateway session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    pub sequence: Option<u64>,
    pub heartbeat_interval_ms: u64,
    pub state: SessionState,
}

impl Session {
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.resume_url.is_some() && self.sequence.is_some()
    }

    /// Forgets resume data so the next recovery identifies from scratch.
    pub fn clear_resume(&mut self) {
        self.session_id = None;
        self.resume_url = None;
    }

    /// Prepares for a fresh identify: the sequence restarts with the new session.
    pub fn reset_for_identify(&mut self) {
        self.clear_resume();
        self.sequence = None;
    }

    /// Records a dispatch sequence number.
    ///
    /// The stored value never moves backwards; returns `false` when `sequence`
    /// is older than what was already seen.
    pub fn observe_sequence(&mut self, sequence: u64) -> bool {
        match self.sequence {
            Some(current) if sequence < current => {
                warn!(
                    event = "stale_sequence_ignored",
                    sequence,
                    current
                );
                false
            }
            _ => {
                self.sequence = Some(sequence);
                true
            }
        }
    }
}

/// Level-triggered reconnect request shared by every failing task.
///
/// Any number of raises collapse into a single pending request until the
/// reconnect supervisor takes it.
#[derive(Debug, Default)]
pub struct ReconnectSignal {
    requested: AtomicBool,
    raised: AtomicU64,
}

impl ReconnectSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: &'static str) {
        self.raised.fetch_add(1, Ordering::SeqCst);
        let already_pending = self.requested.swap(true, Ordering::SeqCst);
        debug!(event = "reconnect_requested", reason, already_pending);
    }

    /// Consumes a pending request.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Total raises since creation, including collapsed duplicates.
    pub fn raised_count(&self) -> u64 {
        self.raised.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_never_moves_backwards() {
        let mut session = Session::default();
        assert!(session.observe_sequence(1));
        assert!(session.observe_sequence(2));
        assert!(session.observe_sequence(2));
        assert!(!session.observe_sequence(1));
        assert_eq!(session.sequence, Some(2));
        assert!(session.observe_sequence(10));
        assert_eq!(session.sequence, Some(10));
    }

    #[test]
    fn resume_needs_session_url_and_sequence() {
        let mut session = Session {
            session_id: Some("s".to_string()),
            resume_url: Some("wss://r".to_string()),
            ..Session::default()
        };
        assert!(!session.can_resume());
        session.observe_sequence(3);
        assert!(session.can_resume());

        session.clear_resume();
        assert!(!session.can_resume());
        assert_eq!(session.sequence, Some(3));

        session.reset_for_identify();
        assert_eq!(session.sequence, None);
    }

    #[test]
    fn repeated_raises_collapse_into_one_request() {
        let signal = ReconnectSignal::new();
        signal.raise("receiver");
        signal.raise("heartbeat");
        assert_eq!(signal.raised_count(), 2);
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn state_display_is_snake_case() {
        assert_eq!(SessionState::WaitOffline.to_string(), "wait_offline");
    }
}
