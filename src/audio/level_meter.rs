//! Smoothed input level meter.
//!
//! The capture thread pushes buffers in with [`AudioLevelMeter::process`];
//! the animation loop pulls the latest value with
//! [`AudioLevelMeter::amplitude`]. The two sides share a single
//! last-value slot held in atomics, so neither side ever blocks.
//!
//! The slot packs the gate generation next to the level, so a buffer that
//! was being measured while the gate closed and reopened is dropped
//! instead of overwriting the reset.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::MeterConfig;

/// One reading of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AmplitudeSample {
    /// Smoothed amplitude in `[0, 1]`.
    pub value: f32,
    /// Time of the last processed buffer, relative to meter creation.
    #[serde(rename = "atMs", serialize_with = "serialize_millis")]
    pub at: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Instantaneous level of a buffer: RMS scaled by `gain`, clamped to `[0, 1]`.
///
/// Non-finite samples are skipped; an empty buffer reads as silence.
pub fn instantaneous_level(samples: &[f32], gain: f32) -> f32 {
    let (sum, count) = samples
        .iter()
        .filter(|s| s.is_finite())
        .fold((0.0f64, 0usize), |(sum, n), &s| (sum + (s as f64) * (s as f64), n + 1));
    if count == 0 {
        return 0.0;
    }
    let rms = (sum / count as f64).sqrt() as f32;
    let level = rms * gain;
    if level.is_finite() {
        level.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// `(gate generation, level)` packed into one word.
fn pack(generation: u32, level: f32) -> u64 {
    ((generation as u64) << 32) | level.to_bits() as u64
}

fn unpack(packed: u64) -> (u32, f32) {
    ((packed >> 32) as u32, f32::from_bits(packed as u32))
}

/// Lock-free smoothed amplitude meter with an output gate.
///
/// While the gate is closed (muted, held, or no connected session) input
/// is discarded and the meter reads exactly `0`.
#[derive(Debug)]
pub struct AudioLevelMeter {
    /// Gate generation (high half) and smoothed level bits (low half).
    slot: AtomicU64,
    gate_open: AtomicBool,
    /// Microseconds since `start_time` of the last processed buffer.
    last_update_us: AtomicU64,
    start_time: Instant,
    config: MeterConfig,
}

impl AudioLevelMeter {
    pub fn new(config: MeterConfig) -> Self {
        Self {
            slot: AtomicU64::new(pack(0, 0.0)),
            gate_open: AtomicBool::new(false),
            last_update_us: AtomicU64::new(0),
            start_time: Instant::now(),
            config,
        }
    }

    /// Feed one mono buffer. Called from the capture thread.
    pub fn process(&self, samples: &[f32]) {
        if !self.gate_open.load(Ordering::Acquire) || samples.is_empty() {
            return;
        }
        let snapshot = self.slot.load(Ordering::Acquire);
        let instant = instantaneous_level(samples, self.config.input_gain);
        self.commit(snapshot, instant);
    }

    /// Fold `instant` into the level read as `snapshot`. Returns `false` when
    /// the gate changed since the snapshot and the reading was discarded.
    fn commit(&self, snapshot: u64, instant: f32) -> bool {
        let (generation, prev) = unpack(snapshot);
        let alpha = self.config.smoothing;
        let smoothed = (prev + alpha * (instant - prev)).clamp(0.0, 1.0);

        let mut current = snapshot;
        loop {
            let (current_generation, _) = unpack(current);
            if current_generation != generation {
                return false;
            }
            match self.slot.compare_exchange_weak(
                current,
                pack(generation, smoothed),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.last_update_us.store(
            self.start_time.elapsed().as_micros() as u64,
            Ordering::Release,
        );
        true
    }

    /// Latest smoothed amplitude, `0` while the gate is closed.
    pub fn amplitude(&self) -> f32 {
        if !self.gate_open.load(Ordering::Acquire) {
            return 0.0;
        }
        let (_, v) = unpack(self.slot.load(Ordering::Acquire));
        if v.is_finite() {
            v.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn sample(&self) -> AmplitudeSample {
        AmplitudeSample {
            value: self.amplitude(),
            at: Duration::from_micros(self.last_update_us.load(Ordering::Acquire)),
        }
    }

    /// Open or close the output gate. Any transition zeroes the smoothed
    /// value so a reopened gate starts from silence.
    pub fn set_gate(&self, open: bool) {
        let was = self.gate_open.swap(open, Ordering::AcqRel);
        if was != open {
            let _ = self
                .slot
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                    let (generation, _) = unpack(packed);
                    Some(pack(generation.wrapping_add(1), 0.0))
                });
        }
    }
}

impl Default for AudioLevelMeter {
    fn default() -> Self {
        Self::new(MeterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_meter() -> AudioLevelMeter {
        let meter = AudioLevelMeter::default();
        meter.set_gate(true);
        meter
    }

    #[test]
    fn test_closed_gate_reads_zero() {
        let meter = AudioLevelMeter::default();
        meter.process(&[0.9; 256]);
        assert_eq!(meter.amplitude(), 0.0);
    }

    #[test]
    fn test_output_stays_in_unit_range() {
        let meter = open_meter();
        let loud = vec![1.0e6f32; 128];
        for _ in 0..50 {
            meter.process(&loud);
            let v = meter.amplitude();
            assert!((0.0..=1.0).contains(&v), "out of range: {v}");
        }
        assert!(meter.amplitude() > 0.99);

        meter.process(&[f32::NAN, f32::INFINITY, -f32::INFINITY]);
        let v = meter.amplitude();
        assert!((0.0..=1.0).contains(&v));
    }

    #[test]
    fn test_smoothing_follows_ema() {
        let meter = open_meter();
        // RMS of a constant 0.1 buffer is 0.1; gain 4 gives 0.4.
        meter.process(&[0.1; 64]);
        assert!((meter.amplitude() - 0.12).abs() < 1e-5);
        meter.process(&[0.1; 64]);
        assert!((meter.amplitude() - (0.12 + 0.3 * (0.4 - 0.12))).abs() < 1e-5);
    }

    #[test]
    fn test_closing_gate_forces_zero_and_resets() {
        let meter = open_meter();
        for _ in 0..20 {
            meter.process(&[0.2; 64]);
        }
        assert!(meter.amplitude() > 0.5);

        meter.set_gate(false);
        assert_eq!(meter.amplitude(), 0.0);
        meter.process(&[0.2; 64]);
        assert_eq!(meter.amplitude(), 0.0);

        meter.set_gate(true);
        assert_eq!(meter.amplitude(), 0.0);
    }

    #[test]
    fn test_reading_from_before_gate_cycle_is_dropped() {
        let meter = open_meter();
        for _ in 0..20 {
            meter.process(&[0.2; 64]);
        }
        let snapshot = meter.slot.load(Ordering::Acquire);

        // Mute and unmute while that buffer is still being measured.
        meter.set_gate(false);
        meter.set_gate(true);

        assert!(!meter.commit(snapshot, 0.8));
        assert_eq!(meter.amplitude(), 0.0);

        meter.process(&[0.2; 64]);
        assert!((meter.amplitude() - 0.3 * 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_instantaneous_level_edge_cases() {
        assert_eq!(instantaneous_level(&[], 4.0), 0.0);
        assert_eq!(instantaneous_level(&[0.0; 32], 4.0), 0.0);
        assert_eq!(instantaneous_level(&[-0.5; 32], 4.0), 1.0);
        assert!((instantaneous_level(&[0.1, -0.1], 1.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_sample_reports_timestamp() {
        let meter = open_meter();
        std::thread::sleep(Duration::from_millis(2));
        meter.process(&[0.1; 16]);
        let sample = meter.sample();
        assert!(sample.at >= Duration::from_millis(1));
        assert_eq!(sample.value, meter.amplitude());
    }
}
