//! # Live Audio Session
//!
//! The realtime voice session manager: connection lifecycle, microphone
//! capture to the remote session, gapless playback of the model's audio,
//! barge-in handling and level metering.
//!
//! ## Layout:
//! - **state**: the connection state machine
//! - **capture**: microphone samples → fixed-size frames → realtime input
//! - **playback**: the gapless playback cursor and tracked sources
//! - **level**: input/output meters
//! - **session**: `LiveSession`, which owns all of the above plus the live resources
//! - **driver**: the tokio task running the session, and `LiveAudioHandle`

pub mod capture;
pub mod driver;
pub mod level;
pub mod playback;
pub mod session;
pub mod snapshot;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{spawn, LiveAudioHandle};
pub use snapshot::LiveSnapshot;
