//! # Audio Devices and Backend Selection
//!
//! The live session never touches hardware directly. It asks an `AudioBackend`
//! for two things:
//!
//! - **Microphone**: acquired at connect time, starts delivering samples only
//!   once the remote session is open (`start`), released on teardown (`stop`)
//! - **OutputContext**: an output clock plus scheduled sources, closed on teardown
//!
//! ## Backends:
//! - **native**: cpal input/output streams (feature `native-audio`)
//! - **headless**: silence or a WAV file as the microphone, output rendered
//!   against the wall clock by a background thread

use crate::audio::analyser::AnalyserTap;
use crate::audio::headless::HeadlessBackend;
use crate::audio::timeline::SourceId;
use crate::config::AudioSettings;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Backend preference from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Native devices when compiled in and present, otherwise headless
    #[default]
    Auto,
    /// Force the cpal backend
    Native,
    /// Force the headless backend
    Headless,
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(BackendPreference::Auto),
            "native" | "cpal" => Ok(BackendPreference::Native),
            "headless" | "null" => Ok(BackendPreference::Headless),
            _ => Err(format!("Unknown audio backend: {}", s)),
        }
    }
}

/// What the session asks of the microphone.
///
/// Echo cancellation and noise suppression are requests: backends that can't
/// provide them log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrophoneConstraints {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl MicrophoneConstraints {
    /// Mono voice capture at `sample_rate`.
    pub fn voice(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Receives captured mono samples at the requested rate.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;

/// An acquired microphone.
pub trait Microphone: Send {
    /// Begin delivering samples. Fails if already started or stopped.
    fn start(&mut self, sink: SampleSink) -> Result<()>;
    /// Stop every track. Idempotent.
    fn stop(&mut self);
}

/// An output context: a clock plus sources scheduled against it.
pub trait OutputContext: Send {
    /// Seconds on the output clock.
    fn current_time(&self) -> f64;
    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, start: f64) -> Result<()>;
    fn stop_source(&mut self, id: SourceId) -> Result<()>;
    /// Tap over the rendered output, for level metering.
    fn analyser_tap(&self) -> AnalyserTap;
    /// Close the context. Closing twice is an error.
    fn close(&mut self) -> Result<()>;
}

/// Source of microphones and output contexts.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open an output context at `sample_rate`. Naturally finished sources are
    /// reported on `ended`.
    fn open_output(
        &self,
        sample_rate: u32,
        fft_size: usize,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>>;

    fn open_microphone(&self, constraints: &MicrophoneConstraints) -> Result<Box<dyn Microphone>>;
}

/// Create a backend for the given preference.
pub fn create_backend(preference: BackendPreference, settings: &AudioSettings) -> Result<Arc<dyn AudioBackend>> {
    match preference {
        BackendPreference::Headless => Ok(Arc::new(HeadlessBackend::from_settings(settings)?)),
        BackendPreference::Native => native_backend(),
        BackendPreference::Auto => {
            if native_input_available() {
                match native_backend() {
                    Ok(backend) => return Ok(backend),
                    Err(e) => warn!("Native audio unavailable, falling back to headless: {}", e),
                }
            }
            info!("Using headless audio backend");
            Ok(Arc::new(HeadlessBackend::from_settings(settings)?))
        }
    }
}

/// Create a backend from the configured string, treating unknown values as `auto`.
pub fn create_backend_from_string(value: &str, settings: &AudioSettings) -> Result<Arc<dyn AudioBackend>> {
    let preference = value.parse::<BackendPreference>().unwrap_or_else(|e| {
        warn!("{}, using auto", e);
        BackendPreference::Auto
    });
    create_backend(preference, settings)
}

#[cfg(feature = "native-audio")]
fn native_backend() -> Result<Arc<dyn AudioBackend>> {
    info!("Using native audio backend (cpal)");
    Ok(Arc::new(crate::audio::native::NativeBackend::new()))
}

#[cfg(not(feature = "native-audio"))]
fn native_backend() -> Result<Arc<dyn AudioBackend>> {
    Err(anyhow!("built without the `native-audio` feature"))
}

#[cfg(feature = "native-audio")]
fn native_input_available() -> bool {
    crate::audio::native::default_input_available()
}

#[cfg(not(feature = "native-audio"))]
fn native_input_available() -> bool {
    false
}

/// A background thread that runs `tick` once per period until stopped.
///
/// Used to pace headless capture and to render output against the wall clock.
/// Stopping never joins: it is called from async tasks, and a tick already in
/// progress finishes on its own before the thread exits.
#[derive(Debug)]
pub struct PacedWorker {
    running: Arc<AtomicBool>,
}

impl PacedWorker {
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut deadline = Instant::now();
                while flag.load(Ordering::Acquire) {
                    tick();
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        // Fell behind; don't try to catch up in a burst
                        deadline = now;
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn {} thread: {}", name, e))?;

        debug!(thread = name, ?period, "Paced worker started");
        Ok(Self { running })
    }

    /// Signal the thread to exit after its current tick. Idempotent.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("Paced worker stopping");
        }
    }
}

impl Drop for PacedWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backend_preference_parsing() {
        assert_eq!("auto".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!("CPAL".parse::<BackendPreference>().unwrap(), BackendPreference::Native);
        assert_eq!("native".parse::<BackendPreference>().unwrap(), BackendPreference::Native);
        assert_eq!("null".parse::<BackendPreference>().unwrap(), BackendPreference::Headless);
        assert!("speakers".parse::<BackendPreference>().is_err());
        assert_eq!(BackendPreference::default(), BackendPreference::Auto);
    }

    #[test]
    fn test_headless_backend_selection() {
        let backend = create_backend(BackendPreference::Headless, &AudioSettings::default()).unwrap();
        assert_eq!(backend.name(), "headless");

        let backend = create_backend_from_string("bogus", &AudioSettings::default()).unwrap();
        assert!(!backend.name().is_empty());
    }

    #[cfg(not(feature = "native-audio"))]
    #[test]
    fn test_native_requires_feature() {
        assert!(create_backend(BackendPreference::Native, &AudioSettings::default()).is_err());
        let backend = create_backend(BackendPreference::Auto, &AudioSettings::default()).unwrap();
        assert_eq!(backend.name(), "headless");
    }

    #[test]
    fn test_paced_worker_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut worker = PacedWorker::spawn("test-worker", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        worker.stop();
        thread::sleep(Duration::from_millis(20));

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        worker.stop();
    }

    #[test]
    fn test_stop_returns_without_waiting_for_tick() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let mut worker = PacedWorker::spawn("slow-worker", Duration::from_millis(1), move || {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        worker.stop();
        drop(worker);
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
