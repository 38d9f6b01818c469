//! Render parameter generation for the session visualization.
//!
//! [`AnimationDriver::tick`] maps (session state, amplitude, reaction, dt)
//! to a color mix and a scale. Scale follows a damped spring toward a
//! state-dependent target. No I/O happens here; the caller owns the clock.

use serde::Serialize;

use crate::config::{AnimationConfig, Palette};
use crate::session::SessionState;

/// What the renderer draws this frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    /// 0 = dull color, 1 = active color.
    pub color_mix: f32,
    /// Uniform scale, always finite and non-negative.
    pub scale: f32,
}

impl RenderParams {
    /// Blend the palette endpoints by `color_mix`.
    pub fn rgb(&self, palette: &Palette) -> [u8; 3] {
        let dull = palette.dull_rgb();
        let active = palette.active_rgb();
        let t = self.color_mix.clamp(0.0, 1.0);
        std::array::from_fn(|i| lerp(dull[i] as f32, active[i] as f32, t).round() as u8)
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Treat non-finite input as zero and clamp to `[0, 1]`.
fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Spring-driven scale and eased color for one visualization.
#[derive(Debug, Clone)]
pub struct AnimationDriver {
    config: AnimationConfig,
    scale: f32,
    velocity: f32,
    color_mix: f32,
    /// Seconds of animation time accumulated from `dt`. `f64` so the pulse
    /// phase keeps sub-frame resolution over long uptimes.
    elapsed: f64,
}

impl AnimationDriver {
    pub fn new(config: AnimationConfig) -> Self {
        Self {
            config,
            scale: 1.0,
            velocity: 0.0,
            color_mix: 0.0,
            elapsed: 0.0,
        }
    }

    /// Advance one frame.
    pub fn tick(&mut self, state: SessionState, amplitude: f32, reaction: f32, dt: f32) -> RenderParams {
        if dt.is_finite() && dt > 0.0 {
            self.elapsed += dt as f64;
        }
        let amplitude = unit(amplitude);
        let reaction = unit(reaction);

        self.color_mix = self.next_color(state);

        let target = self.scale_target(state, amplitude, reaction);
        self.step_spring(target);

        RenderParams {
            color_mix: self.color_mix,
            scale: self.scale,
        }
    }

    /// Where the spring is heading for the given inputs at the current time.
    pub fn scale_target(&self, state: SessionState, amplitude: f32, reaction: f32) -> f32 {
        let c = &self.config;
        match state {
            SessionState::Connecting => 1.0 + self.wave(c.pulse_frequency) * c.pulse_amplitude,
            SessionState::Connected => {
                1.0 + unit(amplitude).min(1.0) * c.amplitude_gain + unit(reaction) * c.reaction_gain
            }
            SessionState::Disconnected | SessionState::Canceling | SessionState::Error => 1.0,
        }
    }

    /// `sin(elapsed × frequency)`.
    fn wave(&self, frequency: f32) -> f32 {
        (self.elapsed * frequency as f64).sin() as f32
    }

    fn next_color(&self, state: SessionState) -> f32 {
        let c = &self.config;
        let eased = |target: f32| {
            let next = self.color_mix + (target - self.color_mix) * c.color_approach_rate;
            if (next - target).abs() < c.settle_epsilon {
                target
            } else {
                next
            }
        };
        let mix = match state {
            SessionState::Disconnected => 0.0,
            SessionState::Connecting => (self.wave(c.color_pulse_frequency) + 1.0) / 2.0,
            SessionState::Connected => eased(1.0),
            SessionState::Canceling | SessionState::Error => eased(0.0),
        };
        unit(mix)
    }

    fn step_spring(&mut self, target: f32) {
        let c = &self.config;
        let force = c.stiffness * (target - self.scale);
        self.velocity = (self.velocity + force) * (1.0 - c.damping);
        self.scale += self.velocity;

        if (self.scale - target).abs() < c.settle_epsilon && self.velocity.abs() < c.settle_epsilon {
            self.scale = target;
            self.velocity = 0.0;
        }
        if !self.scale.is_finite() || !self.velocity.is_finite() {
            self.scale = target;
            self.velocity = 0.0;
        }
        self.scale = self.scale.max(0.0);
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    pub fn is_settled(&self, target: f32) -> bool {
        self.scale == target && self.velocity == 0.0
    }
}

impl Default for AnimationDriver {
    fn default() -> Self {
        Self::new(AnimationConfig::default())
    }
}
