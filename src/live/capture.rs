//! # Capture Pipeline
//!
//! microphone → `CaptureTap` → analyser (input level) + `FrameAssembler` →
//! `AudioFrame` over a channel → session driver → `encode_frame` → remote.
//!
//! The tap runs inside the microphone callback, so it does no encoding and
//! never blocks: it copies samples and sends finished blocks.

use crate::audio::analyser::AnalyserTap;
use crate::audio::codec::create_media_blob;
use crate::audio::device::SampleSink;
use crate::transport::RealtimeInput;
use tokio::sync::mpsc;

/// One fixed-size block of captured mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Connect generation the frame was captured under
    pub generation: u64,
}

/// Cuts an arbitrary sample stream into blocks of exactly `frame_size`.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples and return every block that is now complete.
    pub fn push(&mut self, mut samples: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                blocks.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_size),
                ));
            }
        }
        blocks
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The per-session tap installed on the microphone.
pub struct CaptureTap {
    analyser: AnalyserTap,
    assembler: FrameAssembler,
    frames: mpsc::UnboundedSender<AudioFrame>,
    sample_rate: u32,
    generation: u64,
}

impl CaptureTap {
    pub fn new(
        analyser: AnalyserTap,
        frame_size: usize,
        sample_rate: u32,
        generation: u64,
        frames: mpsc::UnboundedSender<AudioFrame>,
    ) -> Self {
        Self {
            analyser,
            assembler: FrameAssembler::new(frame_size),
            frames,
            sample_rate,
            generation,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.analyser.push(samples);
        for block in self.assembler.push(samples) {
            // The driver may already be gone during shutdown
            let _ = self.frames.send(AudioFrame {
                samples: block,
                sample_rate: self.sample_rate,
                generation: self.generation,
            });
        }
    }

    pub fn into_sink(mut self) -> SampleSink {
        Box::new(move |samples: &[f32]| self.push(samples))
    }
}

/// Encode one frame into the outbound realtime input message.
pub fn encode_frame(frame: &AudioFrame) -> RealtimeInput {
    RealtimeInput {
        media: create_media_blob(&frame.samples, frame.sample_rate),
    }
}
