//! Test doubles for the capture and backend seams.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use voice_session::audio::{AudioDevice, AudioLevelMeter, CaptureProvider, CaptureStream, FrameSink};
use voice_session::backend::{BackendEvent, BackendLink, SpeechBackend, StreamHandle};
use voice_session::config::SessionConfig;
use voice_session::{ErrorKind, SessionController, SessionEvent, SessionState};

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureCounters {
    opened: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Capture provider that tracks open streams and lets tests push frames.
#[derive(Clone, Default)]
pub struct FakeCapture {
    counters: Arc<CaptureCounters>,
    devices: Arc<Mutex<Vec<AudioDevice>>>,
    sinks: Arc<Mutex<Vec<FrameSink>>>,
    fail_open: Arc<Mutex<Option<String>>>,
}

impl FakeCapture {
    pub fn with_devices(ids: &[&str]) -> Self {
        let fake = Self::default();
        *fake.devices.lock() = ids.iter().map(|id| AudioDevice::new(*id, format!("Mic {id}"))).collect();
        fake
    }

    pub fn fail_next_open(&self, reason: &str) {
        *self.fail_open.lock() = Some(reason.to_string());
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Deliver a buffer through the most recently opened stream.
    pub fn push(&self, samples: &[f32]) {
        if let Some(sink) = self.sinks.lock().last() {
            sink.deliver(samples);
        }
    }

    /// Report a fault on the most recently opened stream.
    pub fn fault(&self, reason: &str) {
        if let Some(sink) = self.sinks.lock().last() {
            sink.fault(reason);
        }
    }
}

impl CaptureProvider for FakeCapture {
    fn input_devices(&self) -> anyhow::Result<Vec<AudioDevice>> {
        Ok(self.devices.lock().clone())
    }

    fn open(&self, _device_id: Option<&str>, sink: FrameSink) -> anyhow::Result<Box<dyn CaptureStream>> {
        if let Some(reason) = self.fail_open.lock().take() {
            anyhow::bail!(reason);
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.sinks.lock().push(sink);
        Ok(Box::new(FakeStream {
            counters: Arc::clone(&self.counters),
            open: true,
        }))
    }
}

struct FakeStream {
    counters: Arc<CaptureCounters>,
    open: bool,
}

impl CaptureStream for FakeStream {
    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// A negotiation the test decides the outcome of.
pub struct PendingConnect {
    pub device_id: Option<String>,
    reply: oneshot::Sender<anyhow::Result<BackendLink>>,
    backend: ScriptedBackend,
}

impl PendingConnect {
    /// Resolve successfully. Returns the sender for in-session events.
    pub fn succeed(self) -> mpsc::UnboundedSender<BackendEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let n = self.backend.counters.connected.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.backend.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.backend.counters.max_live.fetch_max(live, Ordering::SeqCst);
        let _ = self.reply.send(Ok(BackendLink {
            handle: StreamHandle::new(format!("stream-{n}")),
            events: rx,
        }));
        tx
    }

    pub fn fail(self, reason: &str) {
        let _ = self.reply.send(Err(anyhow::anyhow!("{reason}")));
    }
}

#[derive(Default)]
struct BackendCounters {
    connected: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    disconnects: Mutex<Vec<(String, Duration)>>,
}

/// Backend whose negotiations are resolved by the test.
#[derive(Clone)]
pub struct ScriptedBackend {
    counters: Arc<BackendCounters>,
    requests: mpsc::UnboundedSender<PendingConnect>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingConnect>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (
            Self {
                counters: Arc::default(),
                requests,
            },
            rx,
        )
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> Vec<(String, Duration)> {
        self.counters.disconnects.lock().clone()
    }
}

impl SpeechBackend for ScriptedBackend {
    fn connect(
        &self,
        device_id: Option<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BackendLink>> + Send + '_>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.requests.send(PendingConnect {
            device_id,
            reply,
            backend: self.clone(),
        });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("test dropped the negotiation")))
        })
    }

    fn disconnect(&self, handle: StreamHandle, duration: Duration) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters
            .disconnects
            .lock()
            .push((handle.id().to_string(), duration));
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// The state sequence within `events`.
pub fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Surfaced errors within `events`.
pub fn errors(events: &[SessionEvent]) -> Vec<(ErrorKind, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error { kind, message } => Some((*kind, message.clone())),
            _ => None,
        })
        .collect()
}

pub struct Harness {
    pub controller: SessionController,
    pub capture: FakeCapture,
    pub backend: ScriptedBackend,
    pub requests: mpsc::UnboundedReceiver<PendingConnect>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn no_hold_config() -> SessionConfig {
    SessionConfig {
        stabilization_ms: 0,
        ..SessionConfig::default()
    }
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_capture(FakeCapture::with_devices(&["a", "b"]), config)
    }

    pub fn with_capture(capture: FakeCapture, config: SessionConfig) -> Self {
        let (backend, requests) = ScriptedBackend::new();
        let controller = SessionController::new(
            Arc::new(capture.clone()),
            Arc::new(backend.clone()),
            Arc::new(AudioLevelMeter::default()),
            config,
        );
        let events = controller.subscribe();
        controller.refresh_devices();
        Self {
            controller,
            capture,
            backend,
            requests,
            events,
        }
    }

    /// Next negotiation the controller started.
    pub async fn next_connect(&mut self) -> PendingConnect {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no negotiation started")
            .expect("backend dropped")
    }

    /// Wait until a `state_changed` event reports `state`.
    pub async fn wait_for_state(&mut self, state: SessionState) {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StateChanged { state: s, .. }) if s == state => return,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {state}"));
    }

    /// Collect every event up to and including the change to `state`.
    pub async fn events_until(&mut self, state: SessionState) -> Vec<SessionEvent> {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let done = matches!(&event, SessionEvent::StateChanged { state: s, .. } if *s == state);
                        seen.push(event);
                        if done {
                            return seen;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {state}"))
    }

    /// Drain and return every event published so far.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Both sides of the session are released.
    pub fn assert_released(&self) {
        assert_eq!(self.capture.live(), 0, "capture stream still open");
        assert_eq!(self.backend.live(), 0, "backend stream still open");
    }

    /// Let spawned tasks run until they block.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}
