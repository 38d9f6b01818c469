//! Session lifecycle controller.
//!
//! Owns the capture stream and the backend connection of at most one
//! session at a time. Public operations run on the caller's thread and
//! never wait on negotiation; negotiation, stream supervision and input
//! hold timers run as Tokio tasks that report back into the controller.
//!
//! Every transition is a compare-and-set on [`SessionStateCell`], made
//! while holding the resource slot lock, so resource ownership and the
//! published state always agree. Resources are released before
//! `Disconnected` is published.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::SessionEvent;
use super::state::{labels, SessionState, SessionStateCell};
use crate::audio::{AudioLevelMeter, CaptureProvider, CaptureStream, DeviceRegistry, DeviceSnapshot, FrameSink};
use crate::backend::{rounded_secs, BackendActivity, BackendEvent, BackendLink, SpeechBackend, StreamHandle};
use crate::config::SessionConfig;
use crate::error::SessionError;

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Exclusive ownership of one session's capture stream and backend stream.
///
/// Release is idempotent and also runs on drop, so every exit path that
/// loses the handle closes both.
struct SessionHandle {
    id: Uuid,
    generation: u64,
    capture: Option<Box<dyn CaptureStream>>,
    stream: Option<StreamHandle>,
    backend: Arc<dyn SpeechBackend>,
    opened_at: Instant,
    started_at: DateTime<Utc>,
}

impl SessionHandle {
    fn new(generation: u64, capture: Box<dyn CaptureStream>, backend: Arc<dyn SpeechBackend>) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            capture: Some(capture),
            stream: None,
            backend,
            opened_at: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Mark the session live. Duration is measured from here.
    fn bind(&mut self, stream: StreamHandle) {
        self.stream = Some(stream);
        self.opened_at = Instant::now();
        self.started_at = Utc::now();
    }

    fn release(&mut self) -> Duration {
        let elapsed = self.opened_at.elapsed();
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        if let Some(stream) = self.stream.take() {
            self.backend.disconnect(stream, elapsed);
        }
        elapsed
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    active: Option<SessionHandle>,
    /// Negotiation, stream watcher and hold timers of the current session.
    tasks: Vec<JoinHandle<()>>,
    /// Text of the assistant reply currently being played back.
    last_reply: String,
    last_user_message: Option<String>,
    /// End of the post-connect stabilization hold.
    stabilize_until: Option<Instant>,
}

struct Shared {
    state: SessionStateCell,
    /// Guards resource ownership. Every transition happens under it.
    slot: Mutex<Slot>,
    generation: AtomicU64,
    muted: AtomicBool,
    held: AtomicBool,
    /// Bumped on every new hold so stale release timers can tell.
    hold_epoch: AtomicU64,
    closed: AtomicBool,
    label: Mutex<String>,
    registry: DeviceRegistry,
    meter: Arc<AudioLevelMeter>,
    capture: Arc<dyn CaptureProvider>,
    backend: Arc<dyn SpeechBackend>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_state(&self, state: SessionState, label: impl Into<String>) {
        let label = label.into();
        *self.label.lock() = label.clone();
        debug!(%state, label = %label, "Session state changed");
        self.emit(SessionEvent::StateChanged { state, label });
    }

    /// Publish `state` with its default status line.
    fn publish_default(&self, state: SessionState) {
        self.publish_state(state, state.label());
    }

    fn publish_status(&self, label: impl Into<String>) {
        let label = label.into();
        *self.label.lock() = label.clone();
        self.emit(SessionEvent::Status { label });
    }

    /// Gate is open only for a connected, unmuted, unheld session.
    fn sync_gate(&self) {
        let open = self.state.get() == SessionState::Connected
            && !self.muted.load(Ordering::Acquire)
            && !self.held.load(Ordering::Acquire);
        self.meter.set_gate(open);
    }

    fn is_current(&self, slot: &Slot, generation: u64) -> bool {
        self.state.get() == SessionState::Connected
            && slot.active.as_ref().map(|h| h.generation) == Some(generation)
    }

    /// Result for a negotiation that no longer belongs to this controller.
    fn is_stale(&self, generation: u64) -> bool {
        self.closed.load(Ordering::Acquire) || self.generation.load(Ordering::Acquire) != generation
    }

    /// The state must already be `Error`. Surfaces the message, then reverts.
    fn surface_and_revert(&self, err: SessionError) {
        let message = err.user_message();
        warn!(kind = ?err.kind(), "Session error: {}", err);
        self.publish_state(SessionState::Error, message.clone());
        self.emit(SessionEvent::Error {
            kind: err.kind(),
            message,
        });
        if self.state.transition(SessionState::Error, SessionState::Disconnected) {
            self.publish_default(SessionState::Disconnected);
        }
    }

    // -- negotiation results ------------------------------------------------

    fn complete_negotiation(
        self: &Arc<Self>,
        generation: u64,
        mut handle: SessionHandle,
        link: BackendLink,
        faults: mpsc::UnboundedReceiver<String>,
    ) {
        handle.bind(link.handle);
        let mut slot = self.slot.lock();
        if self.is_stale(generation) {
            debug!(generation, "Dropping stale negotiation result");
            return;
        }

        let stabilize = Duration::from_millis(self.config.stabilization_ms);
        self.held.store(!stabilize.is_zero(), Ordering::Release);

        if !self.state.transition(SessionState::Connecting, SessionState::Connected) {
            // Canceled while negotiating: the late success is discarded.
            drop(handle);
            self.held.store(false, Ordering::Release);
            if self.state.transition(SessionState::Canceling, SessionState::Disconnected) {
                debug!(generation, "{}", SessionError::UserCancelled);
                self.publish_default(SessionState::Disconnected);
            }
            return;
        }

        info!(
            generation,
            session_id = %handle.id,
            backend = %self.backend.name(),
            "Voice session connected"
        );
        slot.active = Some(handle);
        self.sync_gate();

        if stabilize.is_zero() {
            slot.stabilize_until = None;
            self.publish_default(SessionState::Connected);
        } else {
            slot.stabilize_until = Some(Instant::now() + stabilize);
            self.hold_epoch.fetch_add(1, Ordering::AcqRel);
            self.publish_state(SessionState::Connected, labels::STABILIZING);
            self.schedule_release(&mut slot, generation, stabilize);
        }

        let watcher = tokio::spawn(watch_session(Arc::clone(self), generation, link.events, faults));
        slot.tasks.push(watcher);
    }

    /// Partial resources must already be released.
    fn fail_negotiation(&self, generation: u64, err: SessionError) {
        let _slot = self.slot.lock();
        if self.is_stale(generation) {
            return;
        }
        if err.is_surfaced() && self.state.transition(SessionState::Connecting, SessionState::Error) {
            self.surface_and_revert(err);
        } else if self.state.transition(SessionState::Canceling, SessionState::Disconnected) {
            debug!(generation, reason = %err, "{}", SessionError::UserCancelled);
            self.publish_default(SessionState::Disconnected);
        }
    }

    // -- live session ---------------------------------------------------------

    /// Release the live session and leave `Connected`.
    fn end_session(&self, slot: &mut Slot, cause: Option<SessionError>) {
        for task in slot.tasks.drain(..) {
            task.abort();
        }
        self.held.store(false, Ordering::Release);
        self.hold_epoch.fetch_add(1, Ordering::AcqRel);
        let was_muted = self.muted.swap(false, Ordering::AcqRel);
        self.meter.set_gate(false);

        if let Some(mut handle) = slot.active.take() {
            let duration = handle.release();
            info!(
                session_id = %handle.id,
                secs = rounded_secs(duration),
                "Voice session ended"
            );
            self.emit(SessionEvent::SessionEnded {
                session_id: handle.id.to_string(),
                started_at: handle.started_at,
                duration_seconds: rounded_secs(duration),
            });
        }
        slot.last_reply.clear();
        slot.last_user_message = None;
        slot.stabilize_until = None;
        if was_muted {
            self.emit(SessionEvent::MuteChanged { muted: false });
        }

        match cause {
            None => {
                if self.state.transition(SessionState::Connected, SessionState::Disconnected) {
                    self.publish_default(SessionState::Disconnected);
                }
            }
            Some(err) => {
                if self.state.transition(SessionState::Connected, SessionState::Error) {
                    self.surface_and_revert(err);
                }
            }
        }
    }

    fn interrupt(&self, generation: u64, reason: String) {
        let mut slot = self.slot.lock();
        if !self.is_current(&slot, generation) {
            return;
        }
        warn!(generation, reason = %reason, "Session stream interrupted");
        self.end_session(&mut slot, Some(SessionError::StreamInterrupted(reason)));
    }

    fn apply_backend_event(self: &Arc<Self>, generation: u64, event: BackendEvent) {
        let mut slot = self.slot.lock();
        if !self.is_current(&slot, generation) {
            return;
        }
        match event {
            BackendEvent::Activity(activity) => {
                debug!(?activity, "Backend activity");
                if activity.holds_input() {
                    self.hold_input(activity.label());
                } else if activity == BackendActivity::Listening {
                    let reply_chars = slot.last_reply.chars().count() as u64;
                    let echo = Duration::from_millis(
                        reply_chars
                            .saturating_mul(self.config.echo_ms_per_char)
                            .saturating_add(self.config.echo_base_ms),
                    );
                    let stabilizing = slot
                        .stabilize_until
                        .map(|until| until.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    slot.last_reply.clear();
                    self.schedule_release(&mut slot, generation, echo.max(stabilizing));
                } else {
                    self.publish_status(activity.label());
                }
            }
            BackendEvent::UserTranscript(text) => {
                slot.last_user_message = Some(text.clone());
                self.emit(SessionEvent::Transcript { text });
            }
            BackendEvent::AssistantReply(text) => {
                slot.last_reply = text;
            }
            BackendEvent::Error(message) => {
                warn!(message = %message, "Backend reported an error");
                self.emit(SessionEvent::Notice { message });
                self.publish_status(labels::ERROR);
            }
            BackendEvent::Closed(reason) => {
                warn!(generation, reason = %reason, "Backend closed the session");
                self.end_session(&mut slot, Some(SessionError::StreamInterrupted(reason)));
            }
        }
    }

    // -- input hold -------------------------------------------------------------

    fn hold_input(&self, label: String) {
        self.held.store(true, Ordering::Release);
        self.hold_epoch.fetch_add(1, Ordering::AcqRel);
        self.sync_gate();
        self.publish_status(label);
    }

    /// Release the current hold after `delay` unless a newer hold replaced it.
    fn schedule_release(self: &Arc<Self>, slot: &mut Slot, generation: u64, delay: Duration) {
        let epoch = self.hold_epoch.load(Ordering::Acquire);
        let shared = Arc::clone(self);
        slot.tasks.retain(|t| !t.is_finished());
        slot.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.release_input(generation, epoch);
        }));
    }

    fn release_input(&self, generation: u64, epoch: u64) {
        let slot = self.slot.lock();
        if !self.is_current(&slot, generation) || self.hold_epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        self.held.store(false, Ordering::Release);
        self.sync_gate();
        if self.muted.load(Ordering::Acquire) {
            self.publish_status(labels::MUTED);
        } else {
            self.publish_status(labels::LISTENING);
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Open capture, then negotiate. Reports exactly once.
async fn negotiate(shared: Arc<Shared>, generation: u64, device_id: Option<String>) {
    let (fault_tx, fault_rx) = mpsc::unbounded_channel();
    let sink = FrameSink::new(Arc::clone(&shared.meter), fault_tx);
    let provider = Arc::clone(&shared.capture);
    let open_id = device_id.clone();

    let opened = tokio::task::spawn_blocking(move || provider.open(open_id.as_deref(), sink)).await;
    let capture = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            shared.fail_negotiation(generation, SessionError::DeviceUnavailable(e.to_string()));
            return;
        }
        Err(e) => {
            shared.fail_negotiation(
                generation,
                SessionError::DeviceUnavailable(format!("capture task failed: {e}")),
            );
            return;
        }
    };
    let handle = SessionHandle::new(generation, capture, Arc::clone(&shared.backend));

    if shared.state.get() == SessionState::Canceling {
        drop(handle);
        shared.fail_negotiation(generation, SessionError::UserCancelled);
        return;
    }

    match shared.backend.connect(device_id).await {
        Ok(link) => shared.complete_negotiation(generation, handle, link, fault_rx),
        Err(e) => {
            drop(handle);
            shared.fail_negotiation(generation, SessionError::NegotiationFailed(e.to_string()));
        }
    }
}

/// Forward backend events and capture faults for one live session.
async fn watch_session(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    mut faults: mpsc::UnboundedReceiver<String>,
) {
    let mut events_open = true;
    let mut faults_open = true;
    while events_open || faults_open {
        tokio::select! {
            fault = faults.recv(), if faults_open => match fault {
                Some(reason) => {
                    shared.interrupt(generation, reason);
                    return;
                }
                None => faults_open = false,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => shared.apply_backend_event(generation, event),
                None => events_open = false,
            },
        }
    }
    debug!(generation, "Session watcher finished");
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The voice session state machine.
///
/// Must be used from within a Tokio runtime. Dropping the controller tears
/// down any session it still owns.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        capture: Arc<dyn CaptureProvider>,
        backend: Arc<dyn SpeechBackend>,
        meter: Arc<AudioLevelMeter>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        meter.set_gate(false);
        Self {
            shared: Arc::new(Shared {
                state: SessionStateCell::new(),
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
                muted: AtomicBool::new(false),
                held: AtomicBool::new(false),
                hold_epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                label: Mutex::new(labels::IDLE.to_string()),
                registry: DeviceRegistry::new(),
                meter,
                capture,
                backend,
                config,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Begin a session on the selected device.
    ///
    /// No-op (returns `false`) unless the controller is `Disconnected`.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        if shared.closed.load(Ordering::Acquire) {
            warn!("start() after teardown ignored");
            return false;
        }
        if !shared
            .state
            .transition(SessionState::Disconnected, SessionState::Connecting)
        {
            debug!(state = %shared.state.get(), "start() ignored");
            return false;
        }

        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let device_id = shared.registry.selected();
        info!(generation, device = ?device_id, "Starting voice session");
        shared.publish_default(SessionState::Connecting);

        slot.tasks.retain(|t| !t.is_finished());
        slot.tasks
            .push(tokio::spawn(negotiate(Arc::clone(shared), generation, device_id)));
        true
    }

    /// End the session.
    ///
    /// From `Connected` resources are released synchronously. From
    /// `Connecting` the session moves to `Canceling` and ends once
    /// negotiation resolves. Anything else is a no-op.
    pub fn stop(&self) -> bool {
        let shared = &self.shared;
        let mut slot = shared.slot.lock();
        match shared.state.get() {
            SessionState::Connecting => {
                if shared
                    .state
                    .transition(SessionState::Connecting, SessionState::Canceling)
                {
                    info!("Stop requested during negotiation, canceling");
                    shared.publish_default(SessionState::Canceling);
                    true
                } else {
                    false
                }
            }
            SessionState::Connected => {
                info!("Stopping voice session");
                shared.end_session(&mut slot, None);
                true
            }
            state => {
                debug!(%state, "stop() ignored");
                false
            }
        }
    }

    /// Flip the mute flag. Returns the new value, or `None` when not connected.
    pub fn toggle_mute(&self) -> Option<bool> {
        let shared = &self.shared;
        let _slot = shared.slot.lock();
        if shared.state.get() != SessionState::Connected {
            debug!("toggle_mute() ignored, no live session");
            return None;
        }
        let muted = !shared.muted.fetch_xor(true, Ordering::AcqRel);
        shared.sync_gate();
        info!(muted, "Microphone mute toggled");
        shared.emit(SessionEvent::MuteChanged { muted });
        if muted {
            shared.publish_status(labels::MUTED);
        } else if !shared.held.load(Ordering::Acquire) {
            shared.publish_status(labels::LISTENING);
        }
        Some(muted)
    }

    /// Select a different input device.
    ///
    /// `Ok(false)` means the request was rejected because a session is
    /// active; the selection is unchanged.
    pub fn switch_device(&self, id: &str) -> Result<bool, SessionError> {
        let shared = &self.shared;
        let _slot = shared.slot.lock();
        let state = shared.state.get();
        if state.is_active() {
            info!(%state, device = id, "Device switch rejected during session");
            return Ok(false);
        }
        shared.registry.select(id)?;
        shared.emit(SessionEvent::DeviceSelected {
            id: shared.registry.selected(),
        });
        Ok(true)
    }

    /// Re-enumerate input devices and publish the list.
    ///
    /// During a session the selection is left alone.
    pub fn refresh_devices(&self) -> DeviceSnapshot {
        let shared = &self.shared;
        let _slot = shared.slot.lock();
        let snapshot = if shared.state.get().is_active() {
            shared.registry.enumerate_locked(shared.capture.as_ref())
        } else {
            shared.registry.enumerate(shared.capture.as_ref())
        };
        shared.emit(SessionEvent::DevicesChanged {
            devices: snapshot.to_vec(),
            selected: shared.registry.selected(),
        });
        snapshot
    }

    pub fn devices(&self) -> DeviceSnapshot {
        self.shared.registry.devices()
    }

    pub fn selected_device(&self) -> Option<String> {
        self.shared.registry.selected()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    pub fn status_label(&self) -> String {
        self.shared.label.lock().clone()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Whether input is held for stabilization or assistant playback.
    pub fn is_input_held(&self) -> bool {
        self.shared.held.load(Ordering::Acquire)
    }

    pub fn last_user_message(&self) -> Option<String> {
        self.shared.slot.lock().last_user_message.clone()
    }

    /// Current amplitude (pull).
    pub fn amplitude(&self) -> f32 {
        self.shared.meter.amplitude()
    }

    /// Release everything and refuse further sessions. Idempotent.
    pub fn teardown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slot = shared.slot.lock();
        for task in slot.tasks.drain(..) {
            task.abort();
        }
        shared.meter.set_gate(false);
        shared.held.store(false, Ordering::Release);
        shared.muted.store(false, Ordering::Release);
        if let Some(mut handle) = slot.active.take() {
            let duration = handle.release();
            shared.emit(SessionEvent::SessionEnded {
                session_id: handle.id.to_string(),
                started_at: handle.started_at,
                duration_seconds: rounded_secs(duration),
            });
        }
        let previous = shared.state.reset(SessionState::Disconnected);
        if previous != SessionState::Disconnected {
            shared.publish_default(SessionState::Disconnected);
        }
        info!(%previous, "Session controller torn down");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}
