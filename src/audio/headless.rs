//! Headless audio backend.
//!
//! Runs the full pipeline without sound hardware: the microphone is silence
//! or a WAV file replayed at real-time pace, and the output timeline is
//! rendered by a background thread so its clock tracks the wall clock.

use crate::audio::analyser::AnalyserTap;
use crate::audio::codec::pcm16_to_float;
use crate::audio::device::{
    AudioBackend, Microphone, MicrophoneConstraints, OutputContext, PacedWorker, SampleSink,
};
use crate::audio::resampler::StreamingResampler;
use crate::audio::timeline::{lock_timeline, SourceId, Timeline, TimelineOutput};
use crate::config::AudioSettings;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const CAPTURE_PERIOD: Duration = Duration::from_millis(20);
const RENDER_PERIOD: Duration = Duration::from_millis(10);

/// What the headless microphone produces.
#[derive(Debug, Clone)]
pub enum InputSource {
    Silence,
    /// Mono samples at `sample_rate`; played once, then silence
    Wav { samples: Arc<[f32]>, sample_rate: u32 },
}

#[derive(Debug, Clone)]
pub struct HeadlessBackend {
    input: InputSource,
}

impl HeadlessBackend {
    pub fn silent() -> Self {
        Self {
            input: InputSource::Silence,
        }
    }

    pub fn from_wav_file(path: impl AsRef<Path>) -> Result<Self> {
        let (samples, sample_rate) = load_wav_mono(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            sample_rate,
            seconds = samples.len() as f64 / sample_rate as f64,
            "Loaded WAV input"
        );
        Ok(Self {
            input: InputSource::Wav {
                samples: samples.into(),
                sample_rate,
            },
        })
    }

    pub fn from_settings(settings: &AudioSettings) -> Result<Self> {
        match &settings.input_wav_path {
            Some(path) if !path.trim().is_empty() => Self::from_wav_file(path),
            _ => Ok(Self::silent()),
        }
    }
}

impl AudioBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn open_output(
        &self,
        sample_rate: u32,
        fft_size: usize,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>> {
        let timeline = Arc::new(Mutex::new(Timeline::new(sample_rate, AnalyserTap::new(fft_size), ended)));

        let shared = Arc::clone(&timeline);
        let block = (sample_rate as usize / 100).max(1);
        let mut scratch = vec![0.0; block];
        let mut worker = PacedWorker::spawn("voxera-render", RENDER_PERIOD, move || {
            lock_timeline(&shared).render(&mut scratch);
        })?;

        debug!(sample_rate, "Headless output opened");
        Ok(Box::new(TimelineOutput::new(
            timeline,
            Some(Box::new(move || worker.stop())),
        )))
    }

    fn open_microphone(&self, constraints: &MicrophoneConstraints) -> Result<Box<dyn Microphone>> {
        let source = match &self.input {
            InputSource::Silence => None,
            InputSource::Wav { samples, sample_rate } => {
                let mut resampler = StreamingResampler::new(*sample_rate, constraints.sample_rate);
                Some(Arc::from(resampler.process(samples)))
            }
        };

        debug!(
            sample_rate = constraints.sample_rate,
            from_file = source.is_some(),
            "Headless microphone acquired"
        );
        Ok(Box::new(HeadlessMicrophone {
            sample_rate: constraints.sample_rate,
            source,
            worker: None,
            acquired: true,
        }))
    }
}

pub struct HeadlessMicrophone {
    sample_rate: u32,
    source: Option<Arc<[f32]>>,
    worker: Option<PacedWorker>,
    acquired: bool,
}

impl Microphone for HeadlessMicrophone {
    fn start(&mut self, mut sink: SampleSink) -> Result<()> {
        if !self.acquired {
            bail!("microphone has been stopped");
        }
        if self.worker.is_some() {
            bail!("microphone already started");
        }

        let block = (self.sample_rate as usize / 50).max(1);
        let source = self.source.clone();
        let mut position = 0usize;
        let mut buffer = vec![0.0f32; block];

        self.worker = Some(PacedWorker::spawn("voxera-capture", CAPTURE_PERIOD, move || {
            buffer.iter_mut().for_each(|s| *s = 0.0);
            if let Some(samples) = &source {
                let available = samples.len().saturating_sub(position).min(block);
                buffer[..available].copy_from_slice(&samples[position..position + available]);
                position += available;
            }
            sink(&buffer[..]);
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.acquired = false;
    }
}

impl Drop for HeadlessMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read a WAV file and mix it down to mono floats.
pub fn load_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let (header, data) = wav::read(&mut file).with_context(|| format!("cannot parse {}", path.display()))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => pcm16_to_float(&samples),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => return Err(anyhow!("{} contains no audio", path.display())),
    };

    if header.sampling_rate == 0 {
        bail!("{} declares a sample rate of 0", path.display());
    }

    let channels = header.channel_count.max(1) as usize;
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, header.sampling_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_stereo_wav(rate: u32, frames: &[(i16, i16)]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("voxera-test-{}.wav", uuid::Uuid::new_v4()));
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 2, rate, 16);
        let data: Vec<i16> = frames.iter().flat_map(|&(l, r)| [l, r]).collect();
        let mut file = File::create(&path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(data), &mut file).unwrap();
        path
    }

    #[test]
    fn test_load_wav_mixes_down_to_mono() {
        let path = write_stereo_wav(8000, &[(16384, 0), (-16384, -16384)]);
        let (samples, rate) = load_wav_mono(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(rate, 8000);
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_missing_wav_is_an_error() {
        assert!(HeadlessBackend::from_wav_file("/definitely/not/here.wav").is_err());
    }

    #[test]
    fn test_microphone_lifecycle() {
        let backend = HeadlessBackend::silent();
        let mut mic = backend.open_microphone(&MicrophoneConstraints::voice(16_000)).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        mic.start(Box::new(move |samples: &[f32]| {
            assert!(samples.iter().all(|&s| s == 0.0));
            counter.fetch_add(samples.len(), Ordering::SeqCst);
        }))
        .unwrap();
        assert!(mic.start(Box::new(|_: &[f32]| {})).is_err());

        std::thread::sleep(Duration::from_millis(60));
        mic.stop();
        mic.stop();
        assert!(delivered.load(Ordering::SeqCst) >= 320);
        assert!(mic.start(Box::new(|_: &[f32]| {})).is_err());
    }

    #[test]
    fn test_wav_source_is_replayed_then_silent() {
        let path = write_stereo_wav(16_000, &[(8192, 8192); 400]);
        let backend = HeadlessBackend::from_wav_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let mut mic = backend.open_microphone(&MicrophoneConstraints::voice(16_000)).unwrap();
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        mic.start(Box::new(move |samples: &[f32]| {
            sink.lock().unwrap().extend_from_slice(samples);
        }))
        .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        mic.stop();

        let collected = collected.lock().unwrap();
        assert!(collected.len() >= 640);
        assert!(collected[..400].iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(collected[400..640].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_output_clock_runs_and_stops_on_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut output = HeadlessBackend::silent().open_output(24_000, 256, tx).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(output.current_time() > 0.0);

        output.close().unwrap();
        let stopped_at = output.current_time();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(output.current_time(), stopped_at);
        assert!(output.close().is_err());
    }
}
