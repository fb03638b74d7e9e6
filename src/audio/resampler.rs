//! Streaming linear resampler.
//!
//! Used when a native device cannot be opened at the rate the session needs
//! (e.g. a 48kHz microphone feeding 16kHz capture). Zero lookahead: the
//! fractional read position and the last sample carry over between calls, so
//! chunked input resamples the same as one long buffer.
//!
//! `SlotResampler` covers the playback side, where every buffer must fill
//! exactly the frames its scheduled slot spans on the device clock.

#[cfg(any(feature = "native-audio", test))]
use crate::audio::timeline::frame_at;

/// Mono f32 → f32 linear interpolation resampler.
#[derive(Debug, Clone)]
pub struct StreamingResampler {
    /// Input samples consumed per output sample (input_rate / output_rate)
    ratio: f64,
    /// Read position of the next output sample, relative to the next chunk.
    /// -1.0 refers to the last sample of the previous chunk.
    position: f64,
    previous: Option<f32>,
}

impl StreamingResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            ratio: input_rate as f64 / output_rate.max(1) as f64,
            position: 0.0,
            previous: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.ratio - 1.0).abs() < f64::EPSILON
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }
        if self.is_passthrough() {
            return input.to_vec();
        }

        let previous = self.previous.unwrap_or(input[0]);
        let last = input.len() - 1;
        let mut output = Vec::with_capacity((input.len() as f64 / self.ratio) as usize + 2);

        while self.position <= last as f64 {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let index = base as isize;

            let a = if index < 0 { previous } else { input[index as usize] };
            let next = (index + 1) as usize;
            let b = if next <= last { input[next] } else { a };

            output.push(a + frac * (b - a));
            self.position += self.ratio;
        }

        self.position -= input.len() as f64;
        self.previous = Some(input[last]);
        output
    }
}

/// Resamples buffers scheduled back to back on an output clock running at
/// another rate.
///
/// A buffer of `n` source samples starting at `start` seconds covers frames
/// `frame_at(start)..frame_at(start + n / source_rate)` on the output clock;
/// the result is padded or trimmed to exactly that length so neighbouring
/// slots meet without a gap. Interpolation state carries over only between
/// buffers whose slots touch.
#[cfg(any(feature = "native-audio", test))]
#[derive(Debug, Clone)]
pub struct SlotResampler {
    source_rate: u32,
    output_rate: u32,
    resampler: StreamingResampler,
    /// Output frame where the previous buffer's slot ended
    next_frame: Option<u64>,
}

#[cfg(any(feature = "native-audio", test))]
impl SlotResampler {
    pub fn new(source_rate: u32, output_rate: u32) -> Self {
        Self {
            source_rate,
            output_rate,
            resampler: StreamingResampler::new(source_rate, output_rate),
            next_frame: None,
        }
    }

    pub fn fit(&mut self, samples: &[f32], start: f64) -> Vec<f32> {
        let first = frame_at(start, self.output_rate);
        let end = frame_at(
            start + samples.len() as f64 / self.source_rate.max(1) as f64,
            self.output_rate,
        );

        // First buffer, underrun resnap or barge-in
        if self.next_frame != Some(first) {
            self.resampler = StreamingResampler::new(self.source_rate, self.output_rate);
        }
        self.next_frame = Some(end);

        let mut output = self.resampler.process(samples);
        let fill = output.last().copied().unwrap_or(0.0);
        output.resize(end.saturating_sub(first) as usize, fill);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_length() {
        let mut resampler = StreamingResampler::new(48_000, 16_000);
        let output = resampler.process(&vec![0.25; 4800]);
        assert!((1599..=1601).contains(&output.len()));
        assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_passthrough() {
        let mut resampler = StreamingResampler::new(16_000, 16_000);
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }

    #[test]
    fn test_chunked_matches_single_pass() {
        let ramp: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();

        let mut whole = StreamingResampler::new(44_100, 16_000);
        let expected = whole.process(&ramp);

        let mut chunked = StreamingResampler::new(44_100, 16_000);
        let mut actual = Vec::new();
        for chunk in ramp.chunks(137) {
            actual.extend(chunked.process(chunk));
        }

        assert_eq!(expected.len(), actual.len());
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_slot_fit_fills_every_scheduled_slot() {
        for device_rate in [48_000, 44_100] {
            let mut slots = SlotResampler::new(24_000, device_rate);
            let mut start = 0.35;
            let mut total = 0;

            for _ in 0..5 {
                let output = slots.fit(&[0.5; 12_000], start);
                let end = start + 12_000.0 / 24_000.0;
                assert_eq!(
                    output.len() as u64,
                    frame_at(end, device_rate) - frame_at(start, device_rate),
                    "device_rate={}",
                    device_rate
                );
                assert!(output.iter().all(|&s| (s - 0.5).abs() < 1e-6));
                total += output.len() as u64;
                start = end;
            }

            assert_eq!(total, frame_at(start, device_rate) - frame_at(0.35, device_rate));
        }

        let mut slots = SlotResampler::new(24_000, 48_000);
        assert_eq!(slots.fit(&[0.0; 12_000], 0.35).len(), 24_000);
        let mut slots = SlotResampler::new(24_000, 44_100);
        assert_eq!(slots.fit(&[0.0; 12_000], 0.35).len(), 22_050);
    }

    #[test]
    fn test_slot_fit_carries_state_only_across_touching_slots() {
        let mut slots = SlotResampler::new(10, 20);
        assert_eq!(slots.fit(&[0.0, 0.0], 0.0), vec![0.0; 4]);

        // Touches the previous slot: starts halfway from its last sample
        assert_eq!(slots.fit(&[1.0, 1.0], 0.2), vec![0.5, 1.0, 1.0, 1.0]);

        // Detached slot starts fresh
        let detached = slots.fit(&[0.0, 0.0], 5.0);
        assert_eq!(detached.len(), 4);
        assert_eq!(detached[0], 0.0);
    }

    #[test]
    fn test_upsample_interpolates() {
        let mut resampler = StreamingResampler::new(1, 2);
        assert_eq!(resampler.process(&[0.0, 1.0]), vec![0.0, 0.5, 1.0]);
        // Continues from the previous chunk's last sample
        assert_eq!(resampler.process(&[0.0]), vec![0.5, 0.0]);
    }
}
