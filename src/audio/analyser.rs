//! # Frequency Analyser
//!
//! Level metering for the UI, split in two halves:
//!
//! - **`AnalyserTap`**: a cheap, cloneable handle that audio callbacks push
//!   samples into. It only keeps the most recent `fft_size` samples.
//! - **`FrequencyAnalyser`**: owned by the level monitor; turns a tap snapshot
//!   into byte-scaled frequency magnitudes with the same semantics as a
//!   browser `AnalyserNode` (Blackman window, smoothing over time, dB range
//!   [-100, -30] mapped to 0..=255).

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

#[derive(Debug)]
struct TapState {
    samples: VecDeque<f32>,
    capacity: usize,
    connected: bool,
}

/// Shared window over the latest samples flowing through a node.
#[derive(Debug, Clone)]
pub struct AnalyserTap {
    state: Arc<Mutex<TapState>>,
}

impl AnalyserTap {
    pub fn new(fft_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TapState {
                samples: VecDeque::with_capacity(fft_size),
                capacity: fft_size,
                connected: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        // A panicking audio callback must not take metering down with it
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples. Ignored once disconnected.
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.lock();
        if !state.connected {
            return;
        }

        let capacity = state.capacity;
        let keep = samples.len().min(capacity);
        let overflow = (state.samples.len() + keep).saturating_sub(capacity);
        state.samples.drain(..overflow);
        state.samples.extend(&samples[samples.len() - keep..]);
    }

    /// The latest `fft_size` samples, zero-padded at the front.
    pub fn snapshot(&self) -> Vec<f32> {
        let state = self.lock();
        let mut window = vec![0.0; state.capacity - state.samples.len()];
        window.extend(state.samples.iter());
        window
    }

    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.samples.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// FFT-based analyser producing byte frequency data.
pub struct FrequencyAnalyser {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    smoothing: f32,
    smoothed: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl FrequencyAnalyser {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        Self {
            window: blackman(fft_size),
            smoothing: smoothing.clamp(0.0, 1.0),
            smoothed: vec![0.0; fft_size / 2],
            fft,
            input,
            spectrum,
            scratch,
        }
    }

    #[cfg(test)]
    pub fn frequency_bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Byte-scaled magnitudes for the current tap contents.
    ///
    /// A disconnected tap yields all zeros and resets the smoothing state.
    pub fn byte_frequency_data(&mut self, tap: &AnalyserTap) -> Vec<u8> {
        if !tap.is_connected() {
            self.smoothed.iter_mut().for_each(|v| *v = 0.0);
            return vec![0; self.smoothed.len()];
        }

        let samples = tap.snapshot();
        let n = self.input.len();
        let offset = samples.len().saturating_sub(n);
        for (i, slot) in self.input.iter_mut().enumerate() {
            *slot = samples.get(offset + i).copied().unwrap_or(0.0) * self.window[i];
        }

        if self
            .fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .is_err()
        {
            return vec![0; self.smoothed.len()];
        }

        let scale = 1.0 / n as f32;
        let smoothing = self.smoothing;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        self.smoothed
            .iter_mut()
            .zip(&self.spectrum)
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * scale;
                *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
                let db = if *smoothed > 0.0 {
                    20.0 * smoothed.log10()
                } else {
                    f32::NEG_INFINITY
                };
                ((255.0 / range) * (db - MIN_DECIBELS)).floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean byte magnitude divided by 255, in [0, 1].
    pub fn average_level(&mut self, tap: &AnalyserTap) -> f32 {
        let bins = self.byte_frequency_data(tap);
        if bins.is_empty() {
            return 0.0;
        }
        let sum: u32 = bins.iter().map(|&b| b as u32).sum();
        sum as f32 / bins.len() as f32 / 255.0
    }
}

fn blackman(n: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42f32, 0.5f32, 0.08f32);
    (0..n)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n as f32;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq: f32, rate: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (std::f32::consts::TAU * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn test_tap_keeps_latest_window() {
        let tap = AnalyserTap::new(4);
        assert_eq!(tap.snapshot(), vec![0.0; 4]);

        tap.push(&[1.0, 2.0]);
        assert_eq!(tap.snapshot(), vec![0.0, 0.0, 1.0, 2.0]);

        tap.push(&[3.0, 4.0, 5.0]);
        assert_eq!(tap.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);

        tap.push(&[6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(tap.snapshot(), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_disconnected_tap_ignores_input() {
        let tap = AnalyserTap::new(4);
        tap.push(&[1.0; 4]);
        tap.disconnect();
        tap.push(&[1.0; 4]);
        assert!(!tap.is_connected());
        assert_eq!(tap.snapshot(), vec![0.0; 4]);
    }

    #[test]
    fn test_silence_is_zero() {
        let tap = AnalyserTap::new(256);
        tap.push(&[0.0; 256]);
        let mut analyser = FrequencyAnalyser::new(256, 0.8);
        assert_eq!(analyser.frequency_bin_count(), 128);
        assert_eq!(analyser.average_level(&tap), 0.0);
    }

    #[test]
    fn test_tone_raises_level_and_smoothing_decays() {
        let tap = AnalyserTap::new(256);
        let mut analyser = FrequencyAnalyser::new(256, 0.8);

        tap.push(&sine(256, 1000.0, 16_000.0, 0.8));
        let first = analyser.average_level(&tap);
        let second = analyser.average_level(&tap);
        assert!(first > 0.0);
        assert!(second >= first);
        assert!(second <= 1.0);

        tap.push(&[0.0; 256]);
        let decaying = analyser.average_level(&tap);
        assert!(decaying > 0.0, "smoothing should keep some energy");
        assert!(decaying < second);
    }

    #[test]
    fn test_disconnected_tap_reads_zero() {
        let tap = AnalyserTap::new(256);
        let mut analyser = FrequencyAnalyser::new(256, 0.0);
        tap.push(&sine(256, 440.0, 16_000.0, 1.0));
        assert!(analyser.average_level(&tap) > 0.0);

        tap.disconnect();
        assert_eq!(analyser.average_level(&tap), 0.0);
    }
}
