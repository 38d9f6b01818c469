//! Atomic session state.
//!
//! Every lifecycle transition is a single compare-and-set on an `AtomicU8`,
//! so a transition that lost a race simply reports `false`.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// No session. The only state that accepts `start()` or device changes.
    Disconnected = 0,
    /// Capture opening and backend negotiation in flight.
    Connecting = 1,
    /// `stop()` arrived during negotiation; waiting for it to resolve.
    Canceling = 2,
    /// Live session.
    Connected = 3,
    /// A failure is being surfaced. Reverts to `Disconnected` on its own.
    Error = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Canceling,
            3 => Self::Connected,
            4 => Self::Error,
            _ => Self::Disconnected,
        }
    }

    /// Default status line for the state.
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => labels::IDLE,
            Self::Connecting => labels::CONNECTING,
            Self::Canceling => labels::CANCELING,
            Self::Connected => labels::LISTENING,
            Self::Error => labels::ERROR,
        }
    }

    /// Whether the session owns (or is acquiring) resources.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Canceling => write!(f, "canceling"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Status line texts.
pub mod labels {
    pub const IDLE: &str = "Click to start call";
    pub const CONNECTING: &str = "Connecting...";
    pub const CANCELING: &str = "Hanging up...";
    pub const STABILIZING: &str = "Please wait a moment...";
    pub const LISTENING: &str = "Listening...";
    pub const MUTED: &str = "Muted";
    pub const ERROR: &str = "Error. Click to retry.";
}

/// Thread-safe session state.
#[derive(Debug)]
pub struct SessionStateCell {
    state: AtomicU8,
}

impl SessionStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to` if the state is still `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force a state (shutdown only). Returns the previous state.
    pub fn reset(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        assert_eq!(SessionStateCell::new().get(), SessionState::Disconnected);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = SessionStateCell::new();
        assert!(!cell.transition(SessionState::Connecting, SessionState::Connected));
        assert!(cell.transition(SessionState::Disconnected, SessionState::Connecting));
        assert!(!cell.transition(SessionState::Disconnected, SessionState::Connecting));
        assert!(cell.transition(SessionState::Connecting, SessionState::Canceling));
        assert!(!cell.transition(SessionState::Connecting, SessionState::Connected));
        assert_eq!(cell.get(), SessionState::Canceling);
    }

    #[test]
    fn test_reset_returns_previous() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Disconnected, SessionState::Connecting);
        assert_eq!(cell.reset(SessionState::Disconnected), SessionState::Connecting);
        assert_eq!(cell.get(), SessionState::Disconnected);
    }

    #[test]
    fn test_display_and_serde_agree() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Canceling,
            SessionState::Connected,
            SessionState::Error,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_default_labels_and_activity() {
        assert_eq!(SessionState::Disconnected.label(), "Click to start call");
        assert_eq!(SessionState::Connected.label(), labels::LISTENING);
        assert!(!SessionState::Disconnected.is_active());
        assert!(SessionState::Canceling.is_active());
        assert!(SessionState::Error.is_active());
    }
}
