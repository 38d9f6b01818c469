//! Speech backend seam.
//!
//! Provides a common `SpeechBackend` trait with implementations for:
//! - HTTP session initiation against the assistant server (`http`)
//! - An in-process loopback that always connects (offline visualization)
//!
//! The media transport itself lives behind the backend. The controller
//! only sees a negotiation result, a handle to disconnect, and a stream of
//! [`BackendEvent`]s while the session is up.

pub mod http;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::{BackendConfig, BackendKind};

/// Opaque handle for an established backend stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle(String);

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful negotiation result.
#[derive(Debug)]
pub struct BackendLink {
    pub handle: StreamHandle,
    /// Session-scoped events. The channel closing only means the backend has
    /// nothing more to say; [`BackendEvent::Closed`] is what ends a session.
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl BackendLink {
    /// A link whose event channel is already closed.
    pub fn silent(handle: StreamHandle) -> Self {
        let (_tx, events) = mpsc::unbounded_channel();
        Self { handle, events }
    }
}

/// What the backend reports during a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Activity(BackendActivity),
    /// Final transcript of what the user said.
    UserTranscript(String),
    /// Text of the assistant's spoken reply.
    AssistantReply(String),
    /// Recoverable backend-side problem; the session stays up.
    Error(String),
    /// The stream dropped.
    Closed(String),
}

/// Assistant activity as announced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendActivity {
    Listening,
    Thinking,
    Speaking,
    Transcribing,
    ChoosingTools,
    UsingTool(String),
}

impl BackendActivity {
    /// Parse a backend status word (`thinking`, `using_tool_gmail_server`, ...).
    pub fn parse(status: &str) -> Option<Self> {
        let status = status.trim();
        match status {
            "listening" => Some(Self::Listening),
            "thinking" => Some(Self::Thinking),
            "speaking" => Some(Self::Speaking),
            "transcribing" => Some(Self::Transcribing),
            "choosing_tools" => Some(Self::ChoosingTools),
            _ => status
                .strip_prefix("using_tool_")
                .map(|tool| Self::UsingTool(tool.to_string())),
        }
    }

    /// Whether microphone input should be held while this activity runs.
    pub fn holds_input(&self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking | Self::Transcribing)
    }

    /// Status line text.
    pub fn label(&self) -> String {
        match self {
            Self::Listening => "Listening...".to_string(),
            Self::Thinking => "Thinking...".to_string(),
            Self::Speaking => "Speaking...".to_string(),
            Self::Transcribing => "Transcribing...".to_string(),
            Self::ChoosingTools => "Choosing tools...".to_string(),
            Self::UsingTool(tool) => format!("Using {}...", tool_display_name(tool)),
        }
    }
}

/// `gmail_server` -> `Gmail`, `google_calendar_mcp` -> `Google calendar`.
fn tool_display_name(raw: &str) -> String {
    let cleaned = raw.replace("_server", "").replace("_mcp", "").replace('_', " ");
    let cleaned = cleaned.trim();
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "tool".to_string(),
    }
}

/// Session length in whole seconds, rounded to nearest.
pub fn rounded_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis().min(u64::MAX as u128) as u64;
    millis.saturating_add(500) / 1000
}

/// Common trait for speech backends (dyn-compatible).
pub trait SpeechBackend: Send + Sync {
    /// Negotiate a session for the given capture device.
    ///
    /// Resolves exactly once. Timeouts and retries are the backend's
    /// business.
    fn connect(
        &self,
        device_id: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BackendLink>> + Send + '_>>;

    /// Tear down an established stream. `duration` is how long it was up.
    fn disconnect(&self, handle: StreamHandle, duration: Duration);

    /// Display name for logs.
    fn name(&self) -> String;
}

/// Backend that connects immediately and never reports anything.
#[derive(Debug, Default)]
pub struct LoopbackBackend;

impl SpeechBackend for LoopbackBackend {
    fn connect(
        &self,
        device_id: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BackendLink>> + Send + '_>> {
        Box::pin(async move {
            let handle = StreamHandle::new(format!("loopback-{}", uuid::Uuid::new_v4()));
            info!(device = ?device_id, handle = %handle, "Loopback session connected");
            Ok(BackendLink::silent(handle))
        })
    }

    fn disconnect(&self, handle: StreamHandle, duration: Duration) {
        info!(handle = %handle, secs = rounded_secs(duration), "Loopback session closed");
    }

    fn name(&self) -> String {
        "loopback".to_string()
    }
}

/// Create the configured speech backend.
pub fn create_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn SpeechBackend>> {
    match config.kind {
        BackendKind::Http => Ok(Arc::new(http::HttpSpeechBackend::new(config)?)),
        BackendKind::Loopback => Ok(Arc::new(LoopbackBackend)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_statuses() {
        assert_eq!(BackendActivity::parse("thinking"), Some(BackendActivity::Thinking));
        assert_eq!(BackendActivity::parse(" listening "), Some(BackendActivity::Listening));
        assert_eq!(BackendActivity::parse("choosing_tools"), Some(BackendActivity::ChoosingTools));
        assert_eq!(BackendActivity::parse("idle"), None);
    }

    #[test]
    fn test_tool_labels() {
        let gmail = BackendActivity::parse("using_tool_gmail_server").unwrap();
        assert_eq!(gmail.label(), "Using Gmail...");
        let cal = BackendActivity::parse("using_tool_google_calendar_mcp").unwrap();
        assert_eq!(cal.label(), "Using Google calendar...");
        assert_eq!(BackendActivity::UsingTool(String::new()).label(), "Using tool...");
    }

    #[test]
    fn test_only_busy_activities_hold_input() {
        assert!(BackendActivity::Speaking.holds_input());
        assert!(BackendActivity::Transcribing.holds_input());
        assert!(!BackendActivity::Listening.holds_input());
        assert!(!BackendActivity::ChoosingTools.holds_input());
    }

    #[test]
    fn test_rounded_secs_rounds_to_nearest() {
        assert_eq!(rounded_secs(Duration::from_millis(0)), 0);
        assert_eq!(rounded_secs(Duration::from_millis(499)), 0);
        assert_eq!(rounded_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(rounded_secs(Duration::from_millis(61_999)), 62);
        assert_eq!(rounded_secs(Duration::MAX), u64::MAX / 1000);
    }

    #[tokio::test]
    async fn test_loopback_connects() {
        let backend = LoopbackBackend;
        let mut link = backend.connect(None).await.unwrap();
        assert!(link.handle.id().starts_with("loopback-"));
        assert!(link.events.recv().await.is_none());
        backend.disconnect(link.handle, Duration::from_secs(1));
    }
}
