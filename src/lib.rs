//! Voice session engine.
//!
//! Turns start/stop/mute/switch-device intents into a managed live-audio
//! session and turns the captured audio into render parameters for an
//! ambient visualization.

pub mod animation;
pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod session;

pub use animation::{AnimationDriver, RenderParams};
pub use audio::{AudioDevice, AudioLevelMeter, DeviceRegistry};
pub use error::{ErrorKind, SessionError};
pub use session::{SessionController, SessionEvent, SessionState};
