//! # Output Timeline
//!
//! A sample-accurate render timeline: the output clock of the playback
//! pipeline. Buffers are scheduled at absolute times (seconds on this clock)
//! and mixed into whatever block the driver asks for.
//!
//! ## Clock:
//! `current_time = rendered_frames / sample_rate`. The clock only moves when
//! something renders, so a cpal output callback, a headless render thread and
//! a unit test calling `advance()` all see the same semantics.
//!
//! ## Completion:
//! A source that plays to its end is reported on the `ended` channel. Sources
//! removed with `stop()` are not reported; the caller already knows.

use crate::audio::analyser::AnalyserTap;
use crate::audio::device::OutputContext;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Handle used to stop a scheduled source.
pub type SourceId = u64;

/// The frame a time in seconds lands on at `sample_rate`.
pub fn frame_at(seconds: f64, sample_rate: u32) -> u64 {
    (seconds.max(0.0) * sample_rate as f64).round() as u64
}

#[derive(Debug)]
struct Voice {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
    cursor: usize,
}

#[derive(Debug)]
pub struct Timeline {
    sample_rate: u32,
    rendered_frames: u64,
    voices: Vec<Voice>,
    tap: AnalyserTap,
    ended: mpsc::UnboundedSender<SourceId>,
    closed: bool,
}

impl Timeline {
    pub fn new(sample_rate: u32, tap: AnalyserTap, ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            sample_rate,
            rendered_frames: 0,
            voices: Vec::new(),
            tap,
            ended,
            closed: false,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.rendered_frames as f64 / self.sample_rate as f64
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub fn live_sources(&self) -> usize {
        self.voices.len()
    }

    /// Schedule `samples` to start at `start` seconds. A start time in the
    /// past plays from the next rendered frame.
    pub fn schedule(&mut self, id: SourceId, samples: Arc<[f32]>, start: f64) -> Result<()> {
        if self.closed {
            return Err(anyhow!("output timeline is closed"));
        }

        let start_frame = frame_at(start, self.sample_rate);
        self.voices.push(Voice {
            id,
            samples,
            start_frame: start_frame.max(self.rendered_frames),
            cursor: 0,
        });
        Ok(())
    }

    /// Remove a source immediately. Returns whether it was still scheduled.
    pub fn stop(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    /// Mix the next `out.len()` frames and advance the clock.
    ///
    /// A closed timeline renders silence and keeps its clock where it stopped.
    pub fn render(&mut self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        if self.closed {
            return;
        }

        let block_start = self.rendered_frames;
        let block_len = out.len() as u64;

        for voice in &mut self.voices {
            if voice.start_frame >= block_start + block_len {
                continue;
            }
            let offset = voice.start_frame.saturating_sub(block_start) as usize;
            let remaining = voice.samples.len() - voice.cursor;
            let count = remaining.min(out.len() - offset);

            for (slot, sample) in out[offset..offset + count]
                .iter_mut()
                .zip(&voice.samples[voice.cursor..voice.cursor + count])
            {
                *slot += sample;
            }
            voice.cursor += count;
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.rendered_frames += block_len;

        let ended = &self.ended;
        self.voices.retain(|voice| {
            let done = voice.cursor >= voice.samples.len();
            if done {
                // Receiver gone means the session was torn down
                let _ = ended.send(voice.id);
            }
            !done
        });

        self.tap.push(out);
    }

    /// Render and discard `seconds` worth of output.
    #[cfg(test)]
    pub fn advance(&mut self, seconds: f64) {
        let frames = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        let mut scratch = vec![0.0; frames];
        self.render(&mut scratch);
    }

    /// Stop everything and refuse further scheduling. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(anyhow!("output timeline already closed"));
        }
        self.closed = true;
        self.voices.clear();
        self.tap.disconnect();
        Ok(())
    }
}

/// Timeline shared between the session and whatever drives the clock.
pub type SharedTimeline = Arc<Mutex<Timeline>>;

pub fn lock_timeline(timeline: &SharedTimeline) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops the thread (or device stream) that renders a timeline.
pub type DriverStop = Box<dyn FnOnce() + Send>;

/// `OutputContext` backed by a `Timeline`.
pub struct TimelineOutput {
    timeline: SharedTimeline,
    tap: AnalyserTap,
    driver: Option<DriverStop>,
}

impl TimelineOutput {
    pub fn new(timeline: SharedTimeline, driver: Option<DriverStop>) -> Self {
        let tap = lock_timeline(&timeline).tap.clone();
        Self { timeline, tap, driver }
    }

    fn stop_driver(&mut self) {
        if let Some(stop) = self.driver.take() {
            stop();
        }
    }
}

impl OutputContext for TimelineOutput {
    fn current_time(&self) -> f64 {
        lock_timeline(&self.timeline).current_time()
    }

    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, start: f64) -> Result<()> {
        lock_timeline(&self.timeline).schedule(id, samples, start)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<()> {
        if !lock_timeline(&self.timeline).stop(id) {
            debug!(source = id, "Source already finished");
        }
        Ok(())
    }

    fn analyser_tap(&self) -> AnalyserTap {
        self.tap.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.stop_driver();
        lock_timeline(&self.timeline).close()
    }
}

impl Drop for TimelineOutput {
    fn drop(&mut self) {
        self.stop_driver();
    }
}
