//! What the UI sees of the live session.

use crate::live::level::VolumeLevel;
use crate::live::state::ConnectionState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cumulative counters over the lifetime of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub sessions_started: u64,
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub chunks_received: u64,
    pub interruptions: u64,
    pub underruns: u64,
}

/// `{ status, is_muted, volume }` plus a little diagnostic context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub status: ConnectionState,
    pub is_muted: bool,
    pub volume: VolumeLevel,
    /// Why the last session ended in `error`, if it did
    pub last_error: Option<String>,
    /// Remote session currently attached
    pub session_id: Option<Uuid>,
    pub counters: SessionCounters,
}
