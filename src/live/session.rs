//! # Live Session Core
//!
//! The synchronous heart of the realtime audio session manager. It owns every
//! piece of per-session state (connection state, playback cursor, tracked
//! sources, mute flag, levels) and every live resource (output context,
//! microphone, remote session). The driver feeds it one event at a time, so
//! no locks are needed around the scheduling cursor.
//!
//! ## Resource Invariant:
//! Either output context, microphone and remote session are all attached, or
//! none are. Setup happens off to the side (`establish`) and is attached in
//! one step; anything that fails releases what was already opened.
//!
//! ## Generations:
//! Every `connect()` and `disconnect()` bumps `generation`. Setup results and
//! captured frames carry the generation they were started under; anything
//! stale is released or dropped on arrival.

use crate::audio::analyser::AnalyserTap;
use crate::audio::codec::decode_audio_chunk;
use crate::audio::device::{AudioBackend, Microphone, MicrophoneConstraints, OutputContext};
use crate::audio::timeline::SourceId;
use crate::config::{AudioSettings, LiveConfig};
use crate::live::capture::{encode_frame, AudioFrame, CaptureTap};
use crate::live::level::{LevelMonitor, VolumeLevel};
use crate::live::playback::PlaybackScheduler;
use crate::live::snapshot::{LiveSnapshot, SessionCounters};
use crate::live::state::{ConnectionState, StateEvent};
use crate::transport::{ConnectRequest, RemoteSession, SessionConnector, SessionEvent, SessionSender, ServerMessage};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything a connected session holds.
pub struct SessionResources {
    pub output: Box<dyn OutputContext>,
    pub microphone: Box<dyn Microphone>,
    pub remote: RemoteSession,
}

impl SessionResources {
    /// Release everything, swallowing errors.
    pub fn release(self) {
        let SessionResources {
            mut output,
            mut microphone,
            remote,
        } = self;

        if let Err(e) = remote.sender.close() {
            debug!("Releasing remote session: {}", e);
        }
        microphone.stop();
        if let Err(e) = output.close() {
            debug!("Releasing output context: {}", e);
        }
    }
}

/// Inputs for one setup attempt, taken from the session at `connect()` time.
#[derive(Debug, Clone)]
pub struct SetupPlan {
    pub generation: u64,
    pub request: ConnectRequest,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub fft_size: usize,
    pub ended: mpsc::UnboundedSender<SourceId>,
}

/// Open the output context, acquire the microphone and connect the remote
/// session, in that order. On failure nothing stays open.
pub async fn establish(
    plan: SetupPlan,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
) -> Result<SessionResources> {
    let output_backend = Arc::clone(&backend);
    let (rate, fft_size, ended) = (plan.output_sample_rate, plan.fft_size, plan.ended);
    let mut output = tokio::task::spawn_blocking(move || output_backend.open_output(rate, fft_size, ended))
        .await
        .context("output setup task failed")?
        .context("cannot open output context")?;

    let constraints = MicrophoneConstraints::voice(plan.input_sample_rate);
    let microphone = match tokio::task::spawn_blocking(move || backend.open_microphone(&constraints)).await {
        Ok(Ok(microphone)) => microphone,
        Ok(Err(e)) => {
            let _ = output.close();
            return Err(e.context("microphone unavailable"));
        }
        Err(e) => {
            let _ = output.close();
            return Err(anyhow!("microphone setup task failed: {}", e));
        }
    };

    match connector.connect(plan.request).await {
        Ok(remote) => Ok(SessionResources {
            output,
            microphone,
            remote,
        }),
        Err(e) => {
            let mut microphone = microphone;
            microphone.stop();
            let _ = output.close();
            Err(e)
        }
    }
}

/// Single-owner session state. See the module docs.
pub struct LiveSession {
    live: LiveConfig,
    audio: AudioSettings,

    state: ConnectionState,
    generation: u64,
    muted: bool,
    volume: VolumeLevel,
    last_error: Option<String>,
    counters: SessionCounters,

    scheduler: PlaybackScheduler,
    levels: LevelMonitor,

    output: Option<Box<dyn OutputContext>>,
    output_tap: Option<AnalyserTap>,
    microphone: Option<Box<dyn Microphone>>,
    input_tap: Option<AnalyserTap>,
    remote: Option<SessionSender>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,

    frames: mpsc::UnboundedSender<AudioFrame>,
    ended: mpsc::UnboundedSender<SourceId>,
}

impl LiveSession {
    pub fn new(
        live: LiveConfig,
        audio: AudioSettings,
        frames: mpsc::UnboundedSender<AudioFrame>,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Self {
        Self {
            scheduler: PlaybackScheduler::new(&audio),
            levels: LevelMonitor::new(&audio),
            live,
            audio,
            state: ConnectionState::Disconnected,
            generation: 0,
            muted: false,
            volume: VolumeLevel::default(),
            last_error: None,
            counters: SessionCounters::default(),
            output: None,
            output_tap: None,
            microphone: None,
            input_tap: None,
            remote: None,
            events: None,
            frames,
            ended,
        }
    }

    /// Start a connect attempt. `None` while already connecting or connected.
    pub fn begin_connect(&mut self) -> Option<SetupPlan> {
        if !self.state.can_connect() {
            debug!(state = %self.state, "connect() ignored");
            return None;
        }

        self.teardown();
        self.generation += 1;
        self.scheduler.set_sample_rate(self.audio.output_sample_rate);
        self.state = self.state.transition(StateEvent::ConnectRequested);
        self.last_error = None;

        let request = ConnectRequest::new(&self.live.model, &self.live.voice_name, &self.live.system_instruction);
        if request.voice_name != self.live.voice_name {
            warn!(
                requested = %self.live.voice_name,
                using = %request.voice_name,
                "Unknown voice, using default"
            );
        }

        info!(generation = self.generation, voice = %request.voice_name, "Connecting live session");
        Some(SetupPlan {
            generation: self.generation,
            request,
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            fft_size: self.audio.fft_size,
            ended: self.ended.clone(),
        })
    }

    /// Attach the outcome of a setup attempt.
    ///
    /// Stale outcomes (superseded by a later connect or a disconnect) are
    /// released immediately.
    pub fn attach(&mut self, generation: u64, outcome: Result<SessionResources>) {
        let current = generation == self.generation && self.state == ConnectionState::Connecting;

        match outcome {
            Ok(resources) if !current => {
                debug!(generation, "Releasing resources from a cancelled connect");
                resources.release();
            }
            Err(e) if !current => {
                debug!(generation, "Cancelled connect failed: {:#}", e);
            }
            Ok(resources) => {
                let SessionResources {
                    output,
                    microphone,
                    remote,
                } = resources;
                info!(session_id = %remote.sender.id(), "Live session established");
                self.output_tap = Some(output.analyser_tap());
                self.output = Some(output);
                self.microphone = Some(microphone);
                self.remote = Some(remote.sender);
                self.events = Some(remote.events);
            }
            Err(e) => self.fail(format!("{:#}", e)),
        }
    }

    /// Receiver for the attached session's events, if any.
    pub fn events(&mut self) -> &mut Option<mpsc::UnboundedReceiver<SessionEvent>> {
        &mut self.events
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open => self.on_open(),
            SessionEvent::Message(message) => self.on_message(&message),
            SessionEvent::Closed { reason } => {
                info!(?reason, "Live session closed");
                self.teardown();
                self.state = self.state.transition(StateEvent::RemoteClosed);
            }
            SessionEvent::Error(message) => {
                error!("Live session error: {}", message);
                self.fail(message);
            }
        }
    }

    fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!(state = %self.state, "Ignoring open for an inactive session");
            return;
        }
        let Some(now) = self.output.as_ref().map(|output| output.current_time()) else {
            debug!("Ignoring open without an output context");
            return;
        };

        self.state = self.state.transition(StateEvent::Opened);
        self.counters.sessions_started += 1;
        self.scheduler.prime(now);

        // Capture starts only now that the remote side can take audio
        let tap = AnalyserTap::new(self.audio.fft_size);
        let capture = CaptureTap::new(
            tap.clone(),
            self.audio.frame_size,
            self.audio.input_sample_rate,
            self.generation,
            self.frames.clone(),
        );
        self.input_tap = Some(tap);

        let started = match self.microphone.as_mut() {
            Some(microphone) => microphone.start(capture.into_sink()),
            None => Err(anyhow!("no microphone attached")),
        };
        match started {
            Ok(()) => info!(next_start = self.scheduler.next_start(), "Live session connected"),
            Err(e) => self.fail(format!("microphone failed to start: {:#}", e)),
        }
    }

    fn on_message(&mut self, message: &ServerMessage) {
        if self.output.is_none() {
            return;
        }

        if message.is_interrupted() {
            self.interrupt();
        }

        for chunk in message.audio_chunks() {
            let samples = match decode_audio_chunk(chunk) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("Dropping undecodable audio chunk: {:#}", e);
                    continue;
                }
            };
            self.counters.chunks_received += 1;
            self.play(samples);
        }
    }

    fn play(&mut self, samples: Vec<f32>) {
        let Some(output) = self.output.as_mut() else {
            return;
        };

        let now = output.current_time();
        let buffer = self.scheduler.schedule(samples, now);
        debug!(
            source = buffer.id,
            start = buffer.start,
            duration = buffer.duration,
            "Scheduled playback"
        );

        if let Err(e) = output.start_source(buffer.id, Arc::clone(&buffer.samples), buffer.start) {
            warn!(source = buffer.id, "Failed to start playback: {:#}", e);
            self.scheduler.ended(buffer.id);
        }
    }

    fn interrupt(&mut self) {
        let now = self.output.as_ref().map_or(0.0, |output| output.current_time());
        let stopped = self.scheduler.interrupt(now);
        self.counters.interruptions += 1;
        info!(flushed = stopped.len(), "Playback interrupted");

        if let Some(output) = self.output.as_mut() {
            for id in stopped {
                if let Err(e) = output.stop_source(id) {
                    debug!(source = id, "Stopping source: {:#}", e);
                }
            }
        }
    }

    /// Outbound path for one captured frame.
    pub fn handle_frame(&mut self, frame: AudioFrame) {
        if frame.generation != self.generation || !self.state.is_connected() {
            return;
        }
        self.counters.frames_captured += 1;

        if self.muted {
            return;
        }
        let Some(remote) = self.remote.as_ref() else {
            return;
        };

        match remote.send(encode_frame(&frame)) {
            Ok(()) => self.counters.frames_sent += 1,
            Err(e) => debug!("Frame not sent: {}", e),
        }
    }

    /// A source played to completion.
    pub fn handle_ended(&mut self, id: SourceId) {
        self.scheduler.ended(id);
    }

    /// Unconditional teardown, then `Disconnected`. Safe from any state.
    pub fn disconnect(&mut self) {
        info!(state = %self.state, "Disconnecting live session");
        self.teardown();
        self.generation += 1;
        self.state = self.state.transition(StateEvent::DisconnectRequested);
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        info!(muted = self.muted, "Microphone mute toggled");
        self.muted
    }

    /// Take a level reading. Returns whether the levels changed.
    pub fn sample_levels(&mut self) -> bool {
        let volume = self.levels.sample(
            self.state.is_connected(),
            self.muted,
            self.input_tap.as_ref(),
            self.output_tap.as_ref(),
        );
        let changed = volume != self.volume;
        self.volume = volume;
        changed
    }

    /// New settings for the next connect. Jitter buffer and underrun epsilon
    /// apply to the running session too.
    pub fn configure(&mut self, live: LiveConfig, audio: AudioSettings) {
        self.scheduler.reconfigure(&audio);
        self.levels = LevelMonitor::new(&audio);
        self.live = live;
        self.audio = audio;
    }

    fn fail(&mut self, message: String) {
        let message = describe_failure(&message);
        warn!("Live session failed: {}", message);
        self.teardown();
        self.state = self.state.transition(StateEvent::Failed);
        if self.state == ConnectionState::Error {
            self.last_error = Some(message);
        }
    }

    /// Release everything this session holds. Idempotent; every step is
    /// independent and failures are only logged.
    pub fn teardown(&mut self) {
        let stopped = self.scheduler.reset();
        if let Some(output) = self.output.as_mut() {
            for id in stopped {
                if let Err(e) = output.stop_source(id) {
                    debug!(source = id, "Teardown: stopping source: {:#}", e);
                }
            }
        }

        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }

        if let Some(tap) = self.input_tap.take() {
            tap.disconnect();
        }
        if let Some(tap) = self.output_tap.take() {
            tap.disconnect();
        }

        self.events = None;
        if let Some(remote) = self.remote.take() {
            if let Err(e) = remote.close() {
                debug!("Teardown: closing remote session: {}", e);
            }
        }

        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                debug!("Teardown: closing output context: {:#}", e);
            }
        }

        self.volume = VolumeLevel::default();
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            status: self.state,
            is_muted: self.muted,
            volume: self.volume,
            last_error: self.last_error.clone(),
            session_id: self.remote.as_ref().map(|remote| remote.id()),
            counters: SessionCounters {
                underruns: self.scheduler.underruns(),
                ..self.counters
            },
        }
    }
}

#[cfg(test)]
impl LiveSession {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn live_sources(&self) -> usize {
        self.scheduler.live_count()
    }

    pub fn next_start(&self) -> f64 {
        self.scheduler.next_start()
    }

    pub fn has_microphone(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.input_tap.as_ref().is_some_and(|tap| tap.is_connected())
    }
}

/// Credential problems look like generic socket failures; call them out.
fn describe_failure(message: &str) -> String {
    let auth = ["401", "403", "API key", "PERMISSION_DENIED", "UNAUTHENTICATED"]
        .iter()
        .any(|marker| message.contains(marker));
    if auth && !message.starts_with("authentication failed") {
        format!("authentication failed: {}", message)
    } else {
        message.to_string()
    }
}
