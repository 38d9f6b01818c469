//! Voice session sidecar.
//!
//! Communicates with the UI process via JSON-line IPC on stdin/stdout.
//! Wires the session controller to real audio capture and the configured
//! speech backend, and drives the animation clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use voice_session::animation::{AnimationDriver, RenderParams};
use voice_session::audio::capture::default_provider;
use voice_session::audio::AudioLevelMeter;
use voice_session::backend::create_backend;
use voice_session::config::{paths, read_engine_config, EngineConfig};
use voice_session::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader};
use voice_session::ipc::{VoiceCommand, VoiceEvent};
use voice_session::session::SessionController;
use voice_session::ErrorKind;

#[tokio::main]
async fn main() {
    if let Err(e) = voice_session::logging::init(&paths::get_log_dir()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    // Emit starting event immediately so the UI knows we're alive.
    emit_event(&VoiceEvent::Starting {});

    let config = read_engine_config();
    info!(animation = ?config.animation, meter = ?config.meter, backend = ?config.backend.kind, "Configuration loaded");

    let backend = match create_backend(&config.backend) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to create speech backend: {}", e);
            emit_error(ErrorKind::NegotiationFailed, &format!("Speech backend unavailable: {e}"));
            emit_event(&VoiceEvent::Stopping {});
            return;
        }
    };
    let meter = Arc::new(AudioLevelMeter::new(config.meter));
    let controller = SessionController::new(
        default_provider(),
        backend,
        Arc::clone(&meter),
        config.session.clone(),
    );
    let mut session_events = controller.subscribe();
    controller.refresh_devices();

    let mut cmd_rx = spawn_stdin_reader();

    emit_event(&VoiceEvent::Ready {});
    info!("Voice session core ready");

    let mut frames = FrameClock::new(&config);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !handle_command(&controller, &mut frames, command) {
                            break;
                        }
                    }
                    None => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(event) => emit_event(&event),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Session event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = frames.interval.tick() => {
                frames.advance(&controller, &meter);
            }
        }
    }

    controller.teardown();
    // Flush whatever teardown published.
    while let Ok(event) = session_events.try_recv() {
        emit_event(&event);
    }
    emit_event(&VoiceEvent::Stopping {});
    info!("Voice session core shutting down");
}

/// Animation clock state owned by the main loop.
struct FrameClock {
    interval: tokio::time::Interval,
    driver: AnimationDriver,
    last_tick: Instant,
    last_params: Option<RenderParams>,
    reaction: f32,
    emit: bool,
    palette: voice_session::config::Palette,
}

impl FrameClock {
    fn new(config: &EngineConfig) -> Self {
        let period = Duration::from_secs_f64(1.0 / config.animation.frame_rate as f64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            driver: AnimationDriver::new(config.animation),
            last_tick: Instant::now(),
            last_params: None,
            reaction: 0.0,
            emit: config.session.emit_render_frames,
            palette: config.palette.clone(),
        }
    }

    fn advance(&mut self, controller: &SessionController, meter: &AudioLevelMeter) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;

        let params = self
            .driver
            .tick(controller.state(), meter.amplitude(), self.reaction, dt);
        if self.emit && self.last_params != Some(params) {
            emit_event(&VoiceEvent::Render {
                color_mix: params.color_mix,
                scale: params.scale,
                rgb: params.rgb(&self.palette),
            });
        }
        self.last_params = Some(params);
    }
}

/// Handle a single command from the UI.
/// Returns `false` if the main loop should exit.
fn handle_command(controller: &SessionController, frames: &mut FrameClock, cmd: VoiceCommand) -> bool {
    match cmd {
        VoiceCommand::Ping {} => {
            emit_event(&VoiceEvent::Pong {});
        }

        VoiceCommand::Quit {} => {
            return false;
        }

        VoiceCommand::Start {} => {
            if !controller.start() {
                debug!(state = %controller.state(), "Start ignored");
            }
        }

        VoiceCommand::Stop {} => {
            if !controller.stop() {
                debug!(state = %controller.state(), "Stop ignored");
            }
        }

        VoiceCommand::ToggleMute {} => {
            if controller.toggle_mute().is_none() {
                debug!("Mute ignored, no live session");
            }
        }

        VoiceCommand::SwitchDevice { id } => match controller.switch_device(&id) {
            Ok(true) => {}
            Ok(false) => debug!(device = %id, "Device switch rejected"),
            Err(e) => {
                warn!("{}", e);
                emit_error(e.kind(), &e.user_message());
            }
        },

        VoiceCommand::ListDevices {} => {
            controller.refresh_devices();
        }

        VoiceCommand::SetReaction { intensity } => {
            frames.reaction = if intensity.is_finite() {
                intensity.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }

        VoiceCommand::GetStatus {} => {
            emit_event(&VoiceEvent::StatusReport {
                state: controller.state(),
                label: controller.status_label(),
                muted: controller.is_muted(),
                amplitude: controller.amplitude(),
                selected: controller.selected_device(),
            });
        }
    }

    true
}
