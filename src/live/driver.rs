//! # Live Session Driver
//!
//! Runs the `LiveSession` core on a single tokio task and exposes it through a
//! cloneable `LiveAudioHandle`.
//!
//! ## Event Sources (one `select!`):
//! - **commands**: connect / disconnect / toggle mute / configure / shutdown
//! - **setup results**: device and remote setup runs on spawned tasks
//! - **remote events**: open, messages, close, error
//! - **captured frames** and **ended sources** from the audio threads
//! - **level tick**: meter sampling for the UI
//!
//! After every event the current `LiveSnapshot` is published on a watch
//! channel, so observers only ever see whole, consistent states.

use crate::audio::device::AudioBackend;
use crate::audio::timeline::SourceId;
use crate::config::{AudioSettings, LiveConfig};
use crate::live::capture::AudioFrame;
use crate::live::session::{establish, LiveSession, SessionResources, SetupPlan};
use crate::live::snapshot::LiveSnapshot;
use crate::transport::{SessionConnector, SessionEvent};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Reply channel for a command; `None` for fire-and-forget.
pub type Ack = Option<oneshot::Sender<LiveSnapshot>>;

#[derive(Debug)]
pub enum LiveCommand {
    Connect(Ack),
    Disconnect(Ack),
    ToggleMute(Ack),
    Configure {
        live: Box<LiveConfig>,
        audio: AudioSettings,
    },
    Shutdown(Ack),
}

type SetupResult = (u64, Result<SessionResources>);

/// Cloneable handle to the running session driver.
#[derive(Clone)]
pub struct LiveAudioHandle {
    commands: mpsc::UnboundedSender<LiveCommand>,
    snapshots: watch::Receiver<LiveSnapshot>,
}

impl std::fmt::Debug for LiveAudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAudioHandle")
            .field("status", &self.snapshots.borrow().status)
            .finish()
    }
}

impl LiveAudioHandle {
    async fn request(&self, command: impl FnOnce(Ack) -> LiveCommand) -> Result<LiveSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(Some(tx)))
            .map_err(|_| anyhow!("live session driver has stopped"))?;
        rx.await.map_err(|_| anyhow!("live session driver has stopped"))
    }

    /// Start a session. Returns once setup has begun; follow `subscribe()`
    /// for the outcome. A no-op while connecting or connected.
    pub async fn connect(&self) -> Result<LiveSnapshot> {
        self.request(LiveCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<LiveSnapshot> {
        self.request(LiveCommand::Disconnect).await
    }

    pub async fn toggle_mute(&self) -> Result<LiveSnapshot> {
        self.request(LiveCommand::ToggleMute).await
    }

    /// Tear down any session and stop the driver.
    pub async fn shutdown(&self) -> Result<LiveSnapshot> {
        self.request(LiveCommand::Shutdown).await
    }

    /// Settings used by the next connect. Playback timing also applies to the running session.
    pub fn configure(&self, live: LiveConfig, audio: AudioSettings) -> Result<()> {
        self.commands
            .send(LiveCommand::Configure {
                live: Box::new(live),
                audio,
            })
            .map_err(|_| anyhow!("live session driver has stopped"))
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Start the driver task.
pub fn spawn(
    live: LiveConfig,
    audio: AudioSettings,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
) -> LiveAudioHandle {
    let (command_tx, commands) = mpsc::unbounded_channel();
    let (setup_tx, setups) = mpsc::unbounded_channel();
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (ended_tx, ended) = mpsc::unbounded_channel();

    let level_interval = Duration::from_millis(audio.level_interval_ms.max(1));
    let core = LiveSession::new(live, audio, frame_tx, ended_tx);
    let (snapshot_tx, snapshots) = watch::channel(core.snapshot());

    info!(backend = backend.name(), "Starting live session driver");
    let driver = Driver {
        core,
        backend,
        connector,
        commands,
        setup_tx,
        setups,
        frames,
        ended,
        snapshots: snapshot_tx,
        level_interval,
    };
    tokio::spawn(driver.run());

    LiveAudioHandle {
        commands: command_tx,
        snapshots,
    }
}

struct Driver {
    core: LiveSession,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
    commands: mpsc::UnboundedReceiver<LiveCommand>,
    setup_tx: mpsc::UnboundedSender<SetupResult>,
    setups: mpsc::UnboundedReceiver<SetupResult>,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    ended: mpsc::UnboundedReceiver<SourceId>,
    snapshots: watch::Sender<LiveSnapshot>,
    level_interval: Duration,
}

fn level_timer(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Next event of the attached session; pending while none is attached.
async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>) -> SessionEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(SessionEvent::Closed {
            reason: Some("event stream ended".to_string()),
        }),
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let mut levels = level_timer(self.level_interval);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.core.disconnect();
                        break;
                    };
                    match command {
                        LiveCommand::Connect(ack) => {
                            if let Some(plan) = self.core.begin_connect() {
                                self.start_setup(plan);
                            }
                            self.reply(ack);
                        }
                        LiveCommand::Disconnect(ack) => {
                            self.core.disconnect();
                            self.reply(ack);
                        }
                        LiveCommand::ToggleMute(ack) => {
                            self.core.toggle_mute();
                            self.reply(ack);
                        }
                        LiveCommand::Configure { live, audio } => {
                            let period = Duration::from_millis(audio.level_interval_ms.max(1));
                            if period != self.level_interval {
                                self.level_interval = period;
                                levels = level_timer(period);
                            }
                            self.core.configure(*live, audio);
                            debug!("Live session settings updated");
                        }
                        LiveCommand::Shutdown(ack) => {
                            self.core.disconnect();
                            self.reply(ack);
                            break;
                        }
                    }
                }
                Some((generation, outcome)) = self.setups.recv() => {
                    self.core.attach(generation, outcome);
                }
                event = next_event(self.core.events()) => {
                    self.core.handle_event(event);
                }
                Some(frame) = self.frames.recv() => {
                    self.core.handle_frame(frame);
                }
                Some(id) = self.ended.recv() => {
                    self.core.handle_ended(id);
                }
                _ = levels.tick() => {
                    self.core.sample_levels();
                }
            }
            self.publish();
        }

        self.publish();
        info!("Live session driver stopped");
    }

    fn start_setup(&self, plan: SetupPlan) {
        let backend = Arc::clone(&self.backend);
        let connector = Arc::clone(&self.connector);
        let results = self.setup_tx.clone();

        tokio::spawn(async move {
            let generation = plan.generation;
            let outcome = establish(plan, backend, connector).await;
            if let Err(mpsc::error::SendError((_, Ok(resources)))) = results.send((generation, outcome)) {
                // Driver is gone; nobody else will release these
                resources.release();
            }
        });
    }

    fn publish(&self) {
        let snapshot = self.core.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn reply(&self, ack: Ack) {
        self.publish();
        if let Some(ack) = ack {
            let _ = ack.send(self.core.snapshot());
        }
    }
}
