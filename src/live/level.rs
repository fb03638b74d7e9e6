//! Level monitor: samples input and output energy for the UI meters.
//!
//! Runs on the driver's level tick, independent of the audio callbacks.
//! Purely observational; nothing in the pipeline depends on it.

use crate::audio::analyser::{AnalyserTap, FrequencyAnalyser};
use crate::config::AudioSettings;
use serde::{Deserialize, Serialize};

/// Current meter values, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VolumeLevel {
    pub user: f32,
    pub model: f32,
}

pub struct LevelMonitor {
    input: FrequencyAnalyser,
    output: FrequencyAnalyser,
}

impl LevelMonitor {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            input: FrequencyAnalyser::new(settings.fft_size, settings.smoothing_time_constant),
            output: FrequencyAnalyser::new(settings.fft_size, settings.smoothing_time_constant),
        }
    }

    /// Take one reading. Zero unless connected; the user level is also zero while muted.
    pub fn sample(
        &mut self,
        connected: bool,
        muted: bool,
        input: Option<&AnalyserTap>,
        output: Option<&AnalyserTap>,
    ) -> VolumeLevel {
        if !connected {
            return VolumeLevel::default();
        }

        let user = match input {
            Some(tap) if !muted => self.input.average_level(tap),
            _ => 0.0,
        };
        let model = output.map_or(0.0, |tap| self.output.average_level(tap));

        VolumeLevel {
            user: user.clamp(0.0, 1.0),
            model: model.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_tap() -> AnalyserTap {
        let tap = AnalyserTap::new(256);
        let tone: Vec<f32> = (0..256)
            .map(|i| 0.9 * (std::f32::consts::TAU * 3000.0 * i as f32 / 16_000.0).sin())
            .collect();
        tap.push(&tone);
        tap
    }

    #[test]
    fn test_levels_are_zero_when_not_connected() {
        let mut monitor = LevelMonitor::new(&AudioSettings::default());
        let tap = loud_tap();
        assert_eq!(monitor.sample(false, false, Some(&tap), Some(&tap)), VolumeLevel::default());
    }

    #[test]
    fn test_mute_zeroes_user_level_only() {
        let mut monitor = LevelMonitor::new(&AudioSettings::default());
        let input = loud_tap();
        let output = loud_tap();

        let level = monitor.sample(true, true, Some(&input), Some(&output));
        assert_eq!(level.user, 0.0);
        assert!(level.model > 0.0);

        let level = monitor.sample(true, false, Some(&input), Some(&output));
        assert!(level.user > 0.0);
        assert!(level.user <= 1.0);
    }

    #[test]
    fn test_missing_taps_read_zero() {
        let mut monitor = LevelMonitor::new(&AudioSettings::default());
        assert_eq!(monitor.sample(true, false, None, None), VolumeLevel::default());
    }
}
