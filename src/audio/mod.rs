//! Audio input: device registry, capture seam, level metering.

pub mod capture;
pub mod devices;
pub mod level_meter;

pub use capture::{CaptureProvider, CaptureStream, FrameSink};
pub use devices::{AudioDevice, DeviceRegistry, DeviceSnapshot};
pub use level_meter::{AmplitudeSample, AudioLevelMeter};
