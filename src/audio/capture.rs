//! Audio capture seam.
//!
//! The session controller opens capture streams through [`CaptureProvider`]
//! and never touches the audio host directly. Streams push mono buffers
//! into a [`FrameSink`], which feeds the level meter and reports stream
//! faults back to the controller.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::devices::AudioDevice;
use super::level_meter::AudioLevelMeter;

/// Source of input devices and capture streams.
pub trait CaptureProvider: Send + Sync {
    /// Enumerate input devices currently present.
    fn input_devices(&self) -> anyhow::Result<Vec<AudioDevice>>;

    /// Open a capture stream on `device_id` (`None` = system default).
    ///
    /// May block while the audio host starts the stream; the controller
    /// calls it from a blocking task.
    fn open(&self, device_id: Option<&str>, sink: FrameSink) -> anyhow::Result<Box<dyn CaptureStream>>;
}

/// An open capture stream. Dropping it closes it.
pub trait CaptureStream: Send {
    /// Stop capturing and release the device. Safe to call repeatedly.
    fn close(&mut self);
}

/// Delivery endpoint handed to a capture stream.
#[derive(Debug, Clone)]
pub struct FrameSink {
    meter: Arc<AudioLevelMeter>,
    faults: mpsc::UnboundedSender<String>,
}

impl FrameSink {
    pub fn new(meter: Arc<AudioLevelMeter>, faults: mpsc::UnboundedSender<String>) -> Self {
        Self { meter, faults }
    }

    /// Push one mono buffer.
    pub fn deliver(&self, samples: &[f32]) {
        self.meter.process(samples);
    }

    /// Report that the stream failed. The session is torn down.
    pub fn fault(&self, reason: impl Into<String>) {
        // Receiver gone means the session already ended.
        let _ = self.faults.send(reason.into());
    }
}

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Join a capture thread that was told to stop.
///
/// Inside a Tokio runtime the join runs on the blocking pool so callers on
/// a runtime thread never wait for the audio host to shut the stream down.
#[cfg_attr(not(feature = "audio-io"), allow(dead_code))]
fn reap_capture_thread(thread: JoinHandle<()>, device: String) {
    let join = move || {
        if thread.join().is_err() {
            warn!(device = %device, "Capture thread panicked");
        } else {
            debug!(device = %device, "Capture thread joined");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

/// Provider used when the binary is built without audio I/O.
#[derive(Debug, Default)]
pub struct NullCapture;

impl CaptureProvider for NullCapture {
    fn input_devices(&self) -> anyhow::Result<Vec<AudioDevice>> {
        Ok(Vec::new())
    }

    fn open(&self, _device_id: Option<&str>, _sink: FrameSink) -> anyhow::Result<Box<dyn CaptureStream>> {
        anyhow::bail!("audio capture is not available in this build")
    }
}

/// The capture provider this build uses by default.
pub fn default_provider() -> Arc<dyn CaptureProvider> {
    #[cfg(feature = "audio-io")]
    {
        Arc::new(cpal_backend::CpalCapture::new())
    }

    #[cfg(not(feature = "audio-io"))]
    {
        Arc::new(NullCapture)
    }
}

#[cfg(feature = "audio-io")]
pub use cpal_backend::CpalCapture;

#[cfg(feature = "audio-io")]
mod cpal_backend {
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use tracing::{debug, error, info};

    use super::{reap_capture_thread, to_mono, AudioDevice, CaptureProvider, CaptureStream, FrameSink};

    /// cpal-backed capture. Device ids are device names.
    #[derive(Debug, Default)]
    pub struct CpalCapture;

    impl CpalCapture {
        pub fn new() -> Self {
            Self
        }
    }

    /// Find the input device by name, or the host default.
    fn resolve_device(device_name: Option<&str>) -> anyhow::Result<cpal::Device> {
        let host = cpal::default_host();
        match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| anyhow::anyhow!("Failed to enumerate input devices: {e}"))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow::anyhow!("Input device not found: {name}")),
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow::anyhow!("No default input device available")),
        }
    }

    /// Build and start the stream. Runs on the stream's own thread because
    /// `cpal::Stream` is not `Send` on every platform.
    fn start_stream(device_name: Option<&str>, sink: FrameSink) -> anyhow::Result<(cpal::Stream, String)> {
        let device = resolve_device(device_name)?;
        let dev_name = device.name().unwrap_or_else(|_| "unknown".into());

        let default_config = device
            .default_input_config()
            .map_err(|e| anyhow::anyhow!("Failed to get default input config: {e}"))?;
        let channels = default_config.channels();
        let stream_config = StreamConfig {
            channels,
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = %dev_name,
            channels,
            rate = default_config.sample_rate().0,
            "Opening input stream"
        );

        let fault_sink = sink.clone();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if channels > 1 {
                        sink.deliver(&to_mono(data, channels));
                    } else {
                        sink.deliver(data);
                    }
                },
                move |err| {
                    error!("Audio input stream error: {}", err);
                    fault_sink.fault(err.to_string());
                },
                None,
            )
            .map_err(|e| anyhow::anyhow!("Failed to build input stream: {e}"))?;

        stream
            .play()
            .map_err(|e| anyhow::anyhow!("Failed to start input stream: {e}"))?;

        Ok((stream, dev_name))
    }

    impl CaptureProvider for CpalCapture {
        fn input_devices(&self) -> anyhow::Result<Vec<AudioDevice>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices
                .map(|dev| {
                    let name = dev.name().unwrap_or_default();
                    AudioDevice::new(name.clone(), name)
                })
                .collect())
        }

        fn open(&self, device_id: Option<&str>, sink: FrameSink) -> anyhow::Result<Box<dyn CaptureStream>> {
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<anyhow::Result<String>>(1);
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let device_name = device_id.map(str::to_string);

            let thread = std::thread::Builder::new()
                .name("voice-capture".into())
                .spawn(move || {
                    let stream = match start_stream(device_name.as_deref(), sink) {
                        Ok((stream, name)) => {
                            let _ = ready_tx.send(Ok(name));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    // Blocks until the owner closes or drops the handle.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Capture thread exiting");
                })?;

            match ready_rx.recv() {
                Ok(Ok(device)) => {
                    info!(device = %device, "Audio capture started");
                    Ok(Box::new(CpalStream {
                        stop_tx: Some(stop_tx),
                        thread: Some(thread),
                        device,
                    }))
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = thread.join();
                    anyhow::bail!("capture thread exited before the stream started")
                }
            }
        }
    }

    struct CpalStream {
        stop_tx: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
        device: String,
    }

    impl CaptureStream for CpalStream {
        fn close(&mut self) {
            // Dropping the sender wakes the capture thread.
            if self.stop_tx.take().is_none() {
                return;
            }
            if let Some(thread) = self.thread.take() {
                reap_capture_thread(thread, self.device.clone());
            }
            info!(device = %self.device, "Audio capture stopped");
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.close();
        }
    }
}
