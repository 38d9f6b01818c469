//! Session error taxonomy.
//!
//! Lifecycle failures are absorbed by the controller into the `Error` state
//! and turned into a single status message; `InvalidDevice` stays local to
//! device selection.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No device, or the platform refused to open it.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The speech backend rejected or failed to establish a session.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// An established session's stream dropped.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// `stop()` arrived while negotiating. Never surfaced.
    #[error("session cancelled by user")]
    UserCancelled,

    /// Selection of an id that is not in the last enumerated device set.
    #[error("unknown audio device: {0}")]
    InvalidDevice(String),
}

/// Stable, serializable classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    NegotiationFailed,
    StreamInterrupted,
    UserCancelled,
    InvalidDevice,
    /// Malformed input on the IPC channel (not a session error).
    Protocol,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            Self::StreamInterrupted(_) => ErrorKind::StreamInterrupted,
            Self::UserCancelled => ErrorKind::UserCancelled,
            Self::InvalidDevice(_) => ErrorKind::InvalidDevice,
        }
    }

    /// Whether the error is shown to the user at all.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, Self::UserCancelled)
    }

    /// Status-line text for the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceUnavailable(_) => {
                "Microphone unavailable. Check your input device and permissions.".to_string()
            }
            Self::NegotiationFailed(reason) => format!("Failed to connect: {reason}"),
            Self::StreamInterrupted(_) => "Connection lost. Click to retry.".to_string(),
            Self::UserCancelled => String::new(),
            Self::InvalidDevice(id) => format!("Microphone \"{id}\" is no longer available."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_surfaced() {
        assert!(!SessionError::UserCancelled.is_surfaced());
        assert!(SessionError::StreamInterrupted("eof".into()).is_surfaced());
        assert!(SessionError::UserCancelled.user_message().is_empty());
    }

    #[test]
    fn test_interrupted_and_failed_messages_differ() {
        let failed = SessionError::NegotiationFailed("quota".into());
        let dropped = SessionError::StreamInterrupted("quota".into());
        assert_eq!(failed.user_message(), "Failed to connect: quota");
        assert_ne!(failed.user_message(), dropped.user_message());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&SessionError::InvalidDevice("c".into()).kind()).unwrap();
        assert_eq!(json, "\"invalid_device\"");
    }
}
