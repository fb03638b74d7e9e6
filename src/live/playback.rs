//! # Playback Scheduling
//!
//! Gapless scheduling of inbound audio chunks against the output clock.
//!
//! ## Rules:
//! 1. A single cursor, `next_start`, in output-clock seconds
//! 2. When the session opens: `next_start = now + jitter_buffer`
//! 3. Per chunk: if the cursor fell behind the clock (underrun), resnap it to
//!    `now + underrun_epsilon`; start the chunk at the cursor, then advance the
//!    cursor by the chunk duration
//! 4. On interruption: every tracked source is stopped and forgotten, and the
//!    cursor resnaps to `now + jitter_buffer`
//!
//! The scheduler only does bookkeeping. Starting and stopping sources on the
//! output context is the session core's job.

use crate::audio::timeline::SourceId;
use crate::config::AudioSettings;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A decoded chunk placed on the output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPlaybackBuffer {
    pub id: SourceId,
    pub samples: Arc<[f32]>,
    /// Start time on the output clock, in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

#[cfg(test)]
impl ScheduledPlaybackBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    jitter_buffer: f64,
    underrun_epsilon: f64,
    next_start: f64,
    next_id: SourceId,
    live: BTreeSet<SourceId>,
    underruns: u64,
}

impl PlaybackScheduler {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            sample_rate: settings.output_sample_rate,
            jitter_buffer: settings.jitter_buffer_secs,
            underrun_epsilon: settings.underrun_epsilon_secs,
            next_start: 0.0,
            next_id: 1,
            live: BTreeSet::new(),
            underruns: 0,
        }
    }

    /// Apply new jitter buffer and underrun epsilon. Ids, counters and the
    /// sample rate of buffers already flowing are kept.
    pub fn reconfigure(&mut self, settings: &AudioSettings) {
        self.jitter_buffer = settings.jitter_buffer_secs;
        self.underrun_epsilon = settings.underrun_epsilon_secs;
    }

    /// Rate of the buffers the next session will deliver.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    /// Arm the cursor when the remote session opens.
    pub fn prime(&mut self, now: f64) {
        self.next_start = now + self.jitter_buffer;
    }

    /// Place `samples` after everything already scheduled.
    pub fn schedule(&mut self, samples: Vec<f32>, now: f64) -> ScheduledPlaybackBuffer {
        if self.next_start < now {
            self.underruns += 1;
            self.next_start = now + self.underrun_epsilon;
        }

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let id = self.next_id;
        self.next_id += 1;

        let buffer = ScheduledPlaybackBuffer {
            id,
            samples: samples.into(),
            start: self.next_start,
            duration,
        };

        self.next_start += duration;
        self.live.insert(id);
        buffer
    }

    /// A source finished on its own. Returns whether it was still tracked.
    pub fn ended(&mut self, id: SourceId) -> bool {
        self.live.remove(&id)
    }

    /// Barge-in: forget every tracked source and re-arm the jitter buffer.
    /// Returns the sources that must be stopped.
    pub fn interrupt(&mut self, now: f64) -> Vec<SourceId> {
        let stopped = self.drain();
        self.next_start = now + self.jitter_buffer;
        stopped
    }

    /// Teardown: forget every tracked source and zero the cursor.
    pub fn reset(&mut self) -> Vec<SourceId> {
        let stopped = self.drain();
        self.next_start = 0.0;
        stopped
    }

    fn drain(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.live).into_iter().collect()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn scheduler() -> PlaybackScheduler {
        PlaybackScheduler::new(&AudioSettings::default())
    }

    #[test]
    fn test_five_half_second_chunks_are_contiguous() {
        let mut scheduler = scheduler();
        scheduler.prime(1.0);
        let t0 = scheduler.next_start();
        assert!((t0 - 1.35).abs() < EPS);

        let buffers: Vec<_> = (0..5).map(|_| scheduler.schedule(vec![0.0; 12_000], 1.0)).collect();

        for pair in buffers.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!((pair[0].end() - pair[1].start).abs() < EPS, "gap or overlap");
        }
        assert!((buffers[0].start - t0).abs() < EPS);
        assert!((buffers[4].end() - (t0 + 2.5)).abs() < EPS);
        assert_eq!(scheduler.live_count(), 5);
        assert_eq!(scheduler.underruns(), 0);
    }

    #[test]
    fn test_underrun_resnaps_after_now() {
        let mut scheduler = scheduler();
        scheduler.prime(0.0);
        scheduler.schedule(vec![0.0; 2400], 0.0); // ends at 0.45

        let late = scheduler.schedule(vec![0.0; 2400], 2.0);
        assert!(late.start >= 2.0);
        assert!((late.start - 2.05).abs() < EPS);
        assert_eq!(scheduler.underruns(), 1);
    }

    #[test]
    fn test_interrupt_flushes_and_rearms() {
        let mut scheduler = scheduler();
        scheduler.prime(0.0);
        let a = scheduler.schedule(vec![0.0; 24_000], 0.0);
        let b = scheduler.schedule(vec![0.0; 24_000], 0.0);

        let stopped = scheduler.interrupt(0.5);
        assert_eq!(stopped, vec![a.id, b.id]);
        assert_eq!(scheduler.live_count(), 0);
        assert!(scheduler.next_start() >= 0.5 + 0.35 - EPS);

        let next = scheduler.schedule(vec![0.0; 240], 0.5);
        assert!(next.id > b.id);
        assert!((next.start - 0.85).abs() < EPS);
    }

    #[test]
    fn test_ended_and_reset() {
        let mut scheduler = scheduler();
        scheduler.prime(0.0);
        let a = scheduler.schedule(vec![0.0; 10], 0.0);
        let b = scheduler.schedule(vec![0.0; 10], 0.0);

        assert!(scheduler.ended(a.id));
        assert!(!scheduler.ended(a.id));
        assert_eq!(scheduler.reset(), vec![b.id]);
        assert_eq!(scheduler.next_start(), 0.0);
        assert!(scheduler.reset().is_empty());
    }

    #[test]
    fn test_reconfigure_keeps_buffer_rate() {
        let mut scheduler = scheduler();
        let mut settings = AudioSettings::default();
        settings.jitter_buffer_secs = 0.1;
        settings.output_sample_rate = 48_000;
        scheduler.reconfigure(&settings);

        scheduler.prime(0.0);
        let buffer = scheduler.schedule(vec![0.0; 24_000], 0.0);
        assert!((buffer.start - 0.1).abs() < EPS);
        assert!((buffer.duration - 1.0).abs() < EPS);

        scheduler.set_sample_rate(48_000);
        let buffer = scheduler.schedule(vec![0.0; 24_000], 0.0);
        assert!((buffer.duration - 0.5).abs() < EPS);
    }
}
