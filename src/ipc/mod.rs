//! IPC protocol types for communication with the UI process.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (core -> UI).
//! Commands use `{"command": "<name>", ...}` format (UI -> core).
//! Session notifications ([`SessionEvent`](crate::session::SessionEvent))
//! share the event framing and are written to the same stream.

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::session::SessionState;

// ---------------------------------------------------------------------------
// Events: core -> UI (stdout)
// ---------------------------------------------------------------------------

/// Process-level events emitted to the UI via stdout as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum VoiceEvent {
    Starting {},
    Ready {},
    Pong {},
    Stopping {},
    StatusReport {
        state: SessionState,
        label: String,
        muted: bool,
        amplitude: f32,
        selected: Option<String>,
    },
    /// One animation frame.
    Render {
        #[serde(rename = "colorMix")]
        color_mix: f32,
        scale: f32,
        rgb: [u8; 3],
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Commands: UI -> core (stdin)
// ---------------------------------------------------------------------------

/// All commands the UI can send via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommand {
    Start {},
    Stop {},
    ToggleMute {},
    SwitchDevice { id: String },
    ListDevices {},
    /// Externally driven visual boost, clamped to `[0, 1]`.
    SetReaction { intensity: f32 },
    GetStatus {},
    Ping {},
    Quit {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let cmd: VoiceCommand = serde_json::from_str(r#"{"command": "switch_device", "id": "b"}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::SwitchDevice { id: "b".into() });

        let cmd: VoiceCommand = serde_json::from_str(r#"{"command": "toggle_mute"}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::ToggleMute {});

        let cmd: VoiceCommand =
            serde_json::from_str(r#"{"command": "set_reaction", "intensity": 0.4}"#).unwrap();
        assert_eq!(cmd, VoiceCommand::SetReaction { intensity: 0.4 });

        assert!(serde_json::from_str::<VoiceCommand>(r#"{"command": "explode"}"#).is_err());
    }

    #[test]
    fn test_render_event_shape() {
        let event = VoiceEvent::Render {
            color_mix: 0.5,
            scale: 1.25,
            rgb: [1, 2, 3],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "render");
        assert_eq!(json["data"]["colorMix"], 0.5);
        assert_eq!(json["data"]["rgb"], serde_json::json!([1, 2, 3]));
    }
}
