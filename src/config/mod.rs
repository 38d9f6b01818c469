//! Engine configuration and data directory paths.
//!
//! Read once at startup from `voice_session.json` in the data directory.
//! Every section falls back to defaults field by field, so a partial file
//! only overrides what it names.

pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// Environment override for the backend bearer token.
pub const AUTH_TOKEN_ENV: &str = "VOICE_SESSION_AUTH_TOKEN";

/// Top-level voice_session.json shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub meter: MeterConfig,
    pub animation: AnimationConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
    pub palette: Palette,
}

/// Amplitude smoothing and input scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeterConfig {
    /// Exponential smoothing factor α in `(0, 1]`.
    pub smoothing: f32,
    /// Multiplier applied to the buffer RMS before clamping.
    pub input_gain: f32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            input_gain: 4.0,
        }
    }
}

/// Spring and waveform constants for the visualization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnimationConfig {
    pub frame_rate: u32,
    pub stiffness: f32,
    pub damping: f32,
    pub settle_epsilon: f32,
    /// Scale pulse frequency while connecting (rad/s).
    pub pulse_frequency: f32,
    /// Scale pulse amplitude while connecting.
    pub pulse_amplitude: f32,
    /// Color pulse frequency while connecting (rad/s).
    pub color_pulse_frequency: f32,
    /// Per-tick color approach rate toward the state's color target.
    pub color_approach_rate: f32,
    /// Scale gained per unit of amplitude while connected.
    pub amplitude_gain: f32,
    /// Scale gained per unit of reaction intensity while connected.
    pub reaction_gain: f32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            stiffness: 0.15,
            damping: 0.2,
            settle_epsilon: 0.001,
            pulse_frequency: 4.0,
            pulse_amplitude: 0.2,
            color_pulse_frequency: 3.0,
            color_approach_rate: 0.05,
            amplitude_gain: 0.5,
            reaction_gain: 0.8,
        }
    }
}

/// Session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Input is held this long after connecting. Zero disables the hold.
    pub stabilization_ms: u64,
    /// Estimated playback time per character of the assistant's reply.
    pub echo_ms_per_char: u64,
    /// Fixed playback drain margin added to the per-character estimate.
    pub echo_base_ms: u64,
    /// Emit `render` events on stdout every animation tick that changes.
    pub emit_render_frames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stabilization_ms: 4000,
            echo_ms_per_char: 55,
            echo_base_ms: 250,
            emit_render_frames: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Http,
    Loopback,
}

/// Speech backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub server_url: String,
    pub auth_token: Option<String>,
    /// Where session durations are reported. Reporting is off when unset.
    pub usage_url: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            server_url: "http://localhost:5000".to_string(),
            auth_token: None,
            usage_url: None,
        }
    }
}

/// The two endpoint colors the render color mix blends between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Palette {
    pub dull: String,
    pub active: String,
}

const DEFAULT_DULL: [u8; 3] = [0x8B, 0x5F, 0x11];
const DEFAULT_ACTIVE: [u8; 3] = [0xF1, 0xA2, 0x1D];

impl Default for Palette {
    fn default() -> Self {
        Self {
            dull: "#8B5F11".to_string(),
            active: "#F1A21D".to_string(),
        }
    }
}

impl Palette {
    pub fn dull_rgb(&self) -> [u8; 3] {
        parse_hex_color(&self.dull).unwrap_or(DEFAULT_DULL)
    }

    pub fn active_rgb(&self) -> [u8; 3] {
        parse_hex_color(&self.active).unwrap_or(DEFAULT_ACTIVE)
    }
}

/// Parse `#RRGGBB` (leading `#` optional).
pub fn parse_hex_color(input: &str) -> Option<[u8; 3]> {
    let hex = input.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

impl EngineConfig {
    /// Clamp every numeric constant back into a usable range.
    ///
    /// Out-of-range values are replaced by the default rather than clamped
    /// to the nearest bound, and each replacement is logged.
    pub fn sanitized(mut self) -> Self {
        let meter_defaults = MeterConfig::default();
        let anim_defaults = AnimationConfig::default();

        let m = &mut self.meter;
        m.smoothing = keep_if(m.smoothing, meter_defaults.smoothing, "meter.smoothing", |v| {
            v > 0.0 && v <= 1.0
        });
        m.input_gain = keep_if(m.input_gain, meter_defaults.input_gain, "meter.inputGain", |v| v > 0.0);

        let a = &mut self.animation;
        a.frame_rate = a.frame_rate.clamp(1, 240);
        a.stiffness = keep_if(a.stiffness, anim_defaults.stiffness, "animation.stiffness", |v| {
            v > 0.0 && v <= 1.0
        });
        a.damping = keep_if(a.damping, anim_defaults.damping, "animation.damping", |v| {
            v > 0.0 && v < 1.0
        });
        a.settle_epsilon = keep_if(
            a.settle_epsilon,
            anim_defaults.settle_epsilon,
            "animation.settleEpsilon",
            |v| v > 0.0,
        );
        a.pulse_frequency = keep_if(
            a.pulse_frequency,
            anim_defaults.pulse_frequency,
            "animation.pulseFrequency",
            |v| v >= 0.0,
        );
        a.pulse_amplitude = keep_if(
            a.pulse_amplitude,
            anim_defaults.pulse_amplitude,
            "animation.pulseAmplitude",
            |v| (0.0..1.0).contains(&v),
        );
        a.color_pulse_frequency = keep_if(
            a.color_pulse_frequency,
            anim_defaults.color_pulse_frequency,
            "animation.colorPulseFrequency",
            |v| v >= 0.0,
        );
        a.color_approach_rate = keep_if(
            a.color_approach_rate,
            anim_defaults.color_approach_rate,
            "animation.colorApproachRate",
            |v| v > 0.0 && v <= 1.0,
        );
        a.amplitude_gain = keep_if(
            a.amplitude_gain,
            anim_defaults.amplitude_gain,
            "animation.amplitudeGain",
            |v| v >= 0.0,
        );
        a.reaction_gain = keep_if(
            a.reaction_gain,
            anim_defaults.reaction_gain,
            "animation.reactionGain",
            |v| v >= 0.0,
        );

        let session_defaults = SessionConfig::default();
        let s = &mut self.session;
        s.stabilization_ms = keep_ms(
            s.stabilization_ms,
            session_defaults.stabilization_ms,
            "session.stabilizationMs",
        );
        s.echo_ms_per_char = keep_ms(
            s.echo_ms_per_char,
            session_defaults.echo_ms_per_char,
            "session.echoMsPerChar",
        );
        s.echo_base_ms = keep_ms(s.echo_base_ms, session_defaults.echo_base_ms, "session.echoBaseMs");

        if parse_hex_color(&self.palette.dull).is_none() {
            warn!(value = %self.palette.dull, "Invalid palette.dull, using default");
            self.palette.dull = Palette::default().dull;
        }
        if parse_hex_color(&self.palette.active).is_none() {
            warn!(value = %self.palette.active, "Invalid palette.active, using default");
            self.palette.active = Palette::default().active;
        }

        self
    }
}

fn keep_if(value: f32, default: f32, name: &str, valid: impl Fn(f32) -> bool) -> f32 {
    if value.is_finite() && valid(value) {
        value
    } else {
        warn!(field = name, value, default, "Config value out of range, using default");
        default
    }
}

/// Upper bound for any session timing value.
pub const MAX_SESSION_MS: u64 = 60_000;

fn keep_ms(value: u64, default: u64, name: &str) -> u64 {
    if value <= MAX_SESSION_MS {
        value
    } else {
        warn!(field = name, value, default, "Config value out of range, using default");
        default
    }
}

/// Read voice_session.json from the data directory, apply environment
/// overrides and sanitize.
pub fn read_engine_config() -> EngineConfig {
    load_engine_config(&get_config_path())
}

/// Same as [`read_engine_config`] but from an explicit path.
pub fn load_engine_config(path: &Path) -> EngineConfig {
    let mut config: EngineConfig = read_json_file(path).unwrap_or_default();
    if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.backend.auth_token = Some(token);
        }
    }
    config.sanitized()
}

/// Path to voice_session.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("voice_session.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
