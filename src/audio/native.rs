//! Native audio backend (cpal).
//!
//! `cpal::Stream` is not `Send`, so every stream lives on a dedicated thread
//! that builds it, starts it and parks until told to stop. Audio callbacks
//! only touch the shared timeline / sample sink, both behind short-held locks.

use crate::audio::analyser::AnalyserTap;
use crate::audio::device::{AudioBackend, Microphone, MicrophoneConstraints, OutputContext, SampleSink};
use crate::audio::resampler::{SlotResampler, StreamingResampler};
use crate::audio::timeline::{lock_timeline, DriverStop, SharedTimeline, SourceId, Timeline, TimelineOutput};
use anyhow::{anyhow, bail, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn default_input_available() -> bool {
    cpal::default_host().default_input_device().is_some()
}

#[derive(Debug, Default)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open_output(
        &self,
        sample_rate: u32,
        fft_size: usize,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device found"))?;
        let config = output_config(&device, sample_rate)?;
        let device_rate = config.sample_rate().0;

        info!(
            device = %device.name().unwrap_or_default(),
            device_rate,
            channels = config.channels(),
            format = ?config.sample_format(),
            "Opening speaker"
        );

        // The timeline runs at the device rate; incoming buffers are resampled on schedule
        let timeline: SharedTimeline = Arc::new(Mutex::new(Timeline::new(
            device_rate,
            AnalyserTap::new(fft_size),
            ended,
        )));
        let shared = Arc::clone(&timeline);
        let stop = spawn_stream_thread("voxera-speaker", move || build_output_stream(&device, &config, shared))?;

        Ok(Box::new(ResamplingOutput {
            inner: TimelineOutput::new(timeline, Some(stop)),
            slots: (sample_rate != device_rate).then(|| SlotResampler::new(sample_rate, device_rate)),
        }))
    }

    fn open_microphone(&self, constraints: &MicrophoneConstraints) -> Result<Box<dyn Microphone>> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device found"))?;
        let config = device
            .default_input_config()
            .map_err(|e| anyhow!("Failed to get input config: {}", e))?;

        if constraints.echo_cancellation || constraints.noise_suppression {
            debug!("Echo cancellation / noise suppression are left to the OS on native devices");
        }

        info!(
            device = %device.name().unwrap_or_default(),
            device_rate = config.sample_rate().0,
            channels = config.channels(),
            format = ?config.sample_format(),
            "Opening microphone"
        );

        let sink: Arc<Mutex<Option<SampleSink>>> = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&sink);
        let target_rate = constraints.sample_rate;
        let stop = spawn_stream_thread("voxera-microphone", move || {
            build_input_stream(&device, &config, target_rate, shared)
        })?;

        Ok(Box::new(NativeMicrophone {
            sink,
            stop: Some(stop),
            started: false,
        }))
    }
}

/// Build a stream on its own thread and keep it alive until the returned
/// closure is called. Stopping does not wait for the thread to drop the stream.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<DriverStop>
where
    F: FnOnce() -> Result<Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|stream| {
                stream.play().map_err(|e| anyhow!("Failed to start stream: {}", e))?;
                Ok(stream)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Returns once the stop sender is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| anyhow!("failed to spawn {} thread: {}", name, e))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = handle.join();
            return Err(e);
        }
        Err(_) => bail!("{} thread exited before the stream started", name),
    }

    let name = name.to_string();
    Ok(Box::new(move || {
        debug!(thread = %name, "Stopping stream");
        drop(stop_tx);
    }))
}

fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<SupportedStreamConfig> {
    let wanted = SampleRate(sample_rate);
    if let Ok(ranges) = device.supported_output_configs() {
        let exact = ranges
            .filter(|range| matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16))
            .find(|range| range.min_sample_rate() <= wanted && wanted <= range.max_sample_rate());
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(wanted));
        }
    }

    device
        .default_output_config()
        .map_err(|e| anyhow!("Failed to get output config: {}", e))
}

fn build_output_stream(device: &cpal::Device, config: &SupportedStreamConfig, timeline: SharedTimeline) -> Result<Stream> {
    let channels = config.channels().max(1) as usize;
    let stream_config: StreamConfig = config.clone().into();
    let err_fn = |err| warn!("Speaker stream error: {}", err);
    let mut mono = Vec::new();

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                lock_timeline(&timeline).render(&mut mono);
                for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                    frame.fill(sample);
                }
            },
            err_fn,
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                lock_timeline(&timeline).render(&mut mono);
                for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                    frame.fill((sample * 32767.0) as i16);
                }
            },
            err_fn,
            None,
        )?,
        other => bail!("Unsupported output sample format: {:?}", other),
    };

    Ok(stream)
}

fn build_input_stream(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    target_rate: u32,
    sink: Arc<Mutex<Option<SampleSink>>>,
) -> Result<Stream> {
    let channels = config.channels().max(1) as usize;
    let stream_config: StreamConfig = config.clone().into();
    let mut resampler = StreamingResampler::new(config.sample_rate().0, target_rate);
    let err_fn = |err| warn!("Microphone stream error: {}", err);

    // First channel only, converted to f32, then resampled and handed to the sink
    let mut deliver = move |mono: &[f32]| {
        let Ok(mut guard) = sink.try_lock() else {
            return;
        };
        if let Some(callback) = guard.as_mut() {
            let resampled = resampler.process(mono);
            if !resampled.is_empty() {
                callback(&resampled[..]);
            }
        }
    };

    let stream = match config.sample_format() {
        SampleFormat::F32 => {
            let mut mono = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(data.chunks(channels).map(|frame| frame[0]));
                    deliver(&mono[..]);
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::I16 => {
            let mut mono = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(data.chunks(channels).map(|frame| frame[0] as f32 / 32768.0));
                    deliver(&mono[..]);
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::I32 => {
            let mut mono = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[i32], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(data.chunks(channels).map(|frame| frame[0] as f32 / 2_147_483_648.0));
                    deliver(&mono[..]);
                },
                err_fn,
                None,
            )?
        }
        other => bail!("Unsupported input sample format: {:?}", other),
    };

    Ok(stream)
}

pub struct NativeMicrophone {
    sink: Arc<Mutex<Option<SampleSink>>>,
    stop: Option<DriverStop>,
    started: bool,
}

impl Microphone for NativeMicrophone {
    fn start(&mut self, sink: SampleSink) -> Result<()> {
        if self.stop.is_none() {
            bail!("microphone has been stopped");
        }
        if self.started {
            bail!("microphone already started");
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl Drop for NativeMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Timeline output whose device may run at a different rate than the
/// session's playback buffers.
struct ResamplingOutput {
    inner: TimelineOutput,
    /// `None` when the device runs at the session rate
    slots: Option<SlotResampler>,
}

impl OutputContext for ResamplingOutput {
    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, start: f64) -> Result<()> {
        let samples = match self.slots.as_mut() {
            Some(slots) => Arc::from(slots.fit(&samples, start)),
            None => samples,
        };
        self.inner.start_source(id, samples, start)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<()> {
        self.inner.stop_source(id)
    }

    fn analyser_tap(&self) -> AnalyserTap {
        self.inner.analyser_tap()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
