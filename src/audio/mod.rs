//! # Audio Module
//!
//! Everything below the session logic: sample formats, metering, the output
//! clock and the devices.
//!
//! ## Key Components:
//! - **Codec**: f32 ↔ PCM16 little-endian ↔ base64
//! - **Analyser**: Web-Audio style frequency analyser used for level metering
//! - **Timeline**: sample-accurate output clock that mixes scheduled buffers
//! - **Resampler**: streaming linear resampler for devices at other rates
//! - **Devices**: the `AudioBackend` seam plus headless and native backends
//!
//! ## Audio Formats:
//! - **Capture**: mono, 16kHz by default, sent as 16-bit PCM
//! - **Playback**: mono, 24kHz by default, received as 16-bit PCM

pub mod analyser;
pub mod codec;
pub mod device;
pub mod headless;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod resampler;
pub mod timeline;
