//! Test doubles for the session core and driver: a backend whose clock only
//! moves when a test says so, and a remote session scripted from the test.

use crate::audio::analyser::AnalyserTap;
use crate::audio::device::{AudioBackend, Microphone, MicrophoneConstraints, OutputContext, SampleSink};
use crate::audio::timeline::{lock_timeline, SharedTimeline, SourceId, Timeline, TimelineOutput};
use crate::transport::messages::MediaBlob;
use crate::transport::{ConnectRequest, Outbound, RemoteSession, ServerMessage, SessionConnector, SessionEvent};
use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MicState {
    sink: Option<SampleSink>,
    active: bool,
}

#[derive(Default)]
struct ManualState {
    timelines: Vec<SharedTimeline>,
    microphones: Vec<Arc<Mutex<MicState>>>,
    fail_microphone: bool,
}

/// Backend with a manually advanced clock and a microphone fed by the test.
#[derive(Clone, Default)]
pub struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_microphone() -> Self {
        let backend = Self::new();
        lock(&backend.state).fail_microphone = true;
        backend
    }

    fn latest_timeline(&self) -> Option<SharedTimeline> {
        lock(&self.state).timelines.last().cloned()
    }

    fn latest_microphone(&self) -> Option<Arc<Mutex<MicState>>> {
        lock(&self.state).microphones.last().cloned()
    }

    /// Render `seconds` on the most recent output.
    pub fn advance(&self, seconds: f64) {
        if let Some(timeline) = self.latest_timeline() {
            lock_timeline(&timeline).advance(seconds);
        }
    }

    /// Sources still scheduled on the most recent output.
    pub fn live_sources(&self) -> usize {
        self.latest_timeline()
            .map_or(0, |timeline| lock_timeline(&timeline).live_sources())
    }

    pub fn output_closed(&self) -> bool {
        self.latest_timeline()
            .is_some_and(|timeline| lock_timeline(&timeline).is_closed())
    }

    pub fn outputs_opened(&self) -> usize {
        lock(&self.state).timelines.len()
    }

    pub fn microphones_opened(&self) -> usize {
        lock(&self.state).microphones.len()
    }

    pub fn microphone_active(&self) -> bool {
        self.latest_microphone().is_some_and(|mic| lock(&mic).active)
    }

    /// Deliver samples through the most recent microphone, if it is running.
    pub fn push_input(&self, samples: &[f32]) {
        if let Some(mic) = self.latest_microphone() {
            let mut mic = lock(&mic);
            if !mic.active {
                return;
            }
            if let Some(sink) = mic.sink.as_mut() {
                sink(samples);
            }
        }
    }
}

impl AudioBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn open_output(
        &self,
        sample_rate: u32,
        fft_size: usize,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>> {
        let timeline = Arc::new(Mutex::new(Timeline::new(sample_rate, AnalyserTap::new(fft_size), ended)));
        lock(&self.state).timelines.push(Arc::clone(&timeline));
        Ok(Box::new(TimelineOutput::new(timeline, None)))
    }

    fn open_microphone(&self, _constraints: &MicrophoneConstraints) -> Result<Box<dyn Microphone>> {
        let mut state = lock(&self.state);
        if state.fail_microphone {
            return Err(anyhow!("permission denied"));
        }
        let shared = Arc::new(Mutex::new(MicState::default()));
        state.microphones.push(Arc::clone(&shared));
        Ok(Box::new(ManualMicrophone { shared }))
    }
}

struct ManualMicrophone {
    shared: Arc<Mutex<MicState>>,
}

impl Microphone for ManualMicrophone {
    fn start(&mut self, sink: SampleSink) -> Result<()> {
        let mut state = lock(&self.shared);
        state.sink = Some(sink);
        state.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.shared);
        state.sink = None;
        state.active = false;
    }
}

/// The far end of a `RemoteSession`, driven by the test.
pub struct ScriptedRemote {
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    close_seen: bool,
}

impl ScriptedRemote {
    /// A session that has already reported `Open`.
    pub fn pair() -> (RemoteSession, ScriptedRemote) {
        let (remote, scripted) = Self::pair_unopened();
        scripted.open();
        (remote, scripted)
    }

    pub fn pair_unopened() -> (RemoteSession, ScriptedRemote) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            RemoteSession::new(outbound_tx, event_rx),
            ScriptedRemote {
                events: event_tx,
                outbound: outbound_rx,
                close_seen: false,
            },
        )
    }

    pub fn open(&self) {
        let _ = self.events.send(SessionEvent::Open);
    }

    pub fn message(&self, message: ServerMessage) {
        let _ = self.events.send(SessionEvent::Message(message));
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.events.send(SessionEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    pub fn error(&self, message: &str) {
        let _ = self.events.send(SessionEvent::Error(message.to_string()));
    }

    pub fn next_outbound(&mut self) -> Option<Outbound> {
        let next = self.outbound.try_recv().ok();
        if matches!(next, Some(Outbound::Close)) {
            self.close_seen = true;
        }
        next
    }

    /// Drain the outbound queue, returning the media sent so far.
    pub fn sent_media(&mut self) -> Vec<MediaBlob> {
        let mut media = Vec::new();
        while let Some(outbound) = self.next_outbound() {
            if let Outbound::Media(input) = outbound {
                media.push(input.media);
            }
        }
        media
    }

    pub fn close_requested(&mut self) -> bool {
        self.sent_media();
        self.close_seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Open,
    Fail,
    /// Wait for `ScriptedConnector::release` before opening
    Hold,
}

#[derive(Default)]
struct ConnectorState {
    requests: Vec<ConnectRequest>,
    remotes: Vec<ScriptedRemote>,
}

/// `SessionConnector` that hands out `ScriptedRemote`s.
#[derive(Clone)]
pub struct ScriptedConnector {
    behavior: ConnectBehavior,
    gate: Arc<Notify>,
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    pub fn new(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            gate: Arc::new(Notify::new()),
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    /// Let one held connect proceed.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).remotes.len()
    }

    /// Run `f` against the remote end of the `index`th session.
    pub fn with_remote<R>(&self, index: usize, f: impl FnOnce(&mut ScriptedRemote) -> R) -> Option<R> {
        lock(&self.state).remotes.get_mut(index).map(f)
    }
}

impl SessionConnector for ScriptedConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<RemoteSession>> {
        let behavior = self.behavior;
        let gate = Arc::clone(&self.gate);
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            lock(&state).requests.push(request);
            match behavior {
                ConnectBehavior::Fail => return Err(anyhow!("connection refused")),
                ConnectBehavior::Hold => gate.notified().await,
                ConnectBehavior::Open => {}
            }

            let (remote, scripted) = ScriptedRemote::pair();
            lock(&state).remotes.push(scripted);
            Ok(remote)
        })
    }
}
