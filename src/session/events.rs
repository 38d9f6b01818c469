use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::SessionState;
use crate::audio::AudioDevice;
use crate::error::ErrorKind;

/// Notifications published by the session controller.
///
/// Serialized as `{"event": "<name>", "data": {...}}`, the same framing the
/// IPC bridge uses for its own events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        label: String,
    },
    /// Status line changed without a state change.
    Status {
        label: String,
    },
    MuteChanged {
        muted: bool,
    },
    /// Session lifecycle failure, surfaced once.
    Error {
        kind: ErrorKind,
        message: String,
    },
    /// Backend-side problem that did not end the session.
    Notice {
        message: String,
    },
    DevicesChanged {
        devices: Vec<AudioDevice>,
        selected: Option<String>,
    },
    DeviceSelected {
        id: Option<String>,
    },
    /// Latest user utterance, for display while the session runs.
    Transcript {
        text: String,
    },
    SessionEnded {
        session_id: String,
        started_at: DateTime<Utc>,
        duration_seconds: u64,
    },
}
