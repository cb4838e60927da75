use serde::{Deserialize, Serialize};

use stretchkit_foundation::{BufferHealth, BufferingReason, EnginePhase};

use crate::chunk::ChunkState;

/// Events published to external observers. Delivery is synchronous on the
/// control task; handlers must not block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum EngineEvent {
    Progress {
        total: usize,
        ready: usize,
        progress: f64,
    },
    BufferHealth {
        health: BufferHealth,
        ahead_seconds: f64,
    },
    Buffering {
        reason: BufferingReason,
    },
    Buffered {
        stall_ms: u64,
    },
    ChunkReady {
        index: usize,
    },
    /// Every chunk reached a terminal state for the current tempo.
    Complete,
    /// Playback ran off the end of the source.
    Ended,
    /// Reserved; never emitted while looping is unsupported in stretched
    /// playback.
    Loop,
    Error {
        message: String,
        chunk_index: Option<usize>,
        fatal: bool,
    },
}

/// Event discriminant, used for per-kind subscription and clearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Progress,
    BufferHealth,
    Buffering,
    Buffered,
    ChunkReady,
    Complete,
    Ended,
    Loop,
    Error,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Progress { .. } => EventKind::Progress,
            EngineEvent::BufferHealth { .. } => EventKind::BufferHealth,
            EngineEvent::Buffering { .. } => EventKind::Buffering,
            EngineEvent::Buffered { .. } => EventKind::Buffered,
            EngineEvent::ChunkReady { .. } => EventKind::ChunkReady,
            EngineEvent::Complete => EventKind::Complete,
            EngineEvent::Ended => EventKind::Ended,
            EngineEvent::Loop => EventKind::Loop,
            EngineEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Conversion-side status block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionStatus {
    pub total: usize,
    pub ready: usize,
    pub converting: usize,
    pub progress: f64,
}

/// Buffer-side status block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    pub health: BufferHealth,
    pub ahead_seconds: f64,
}

/// Playback-side status block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub position: f64,
    pub duration: f64,
    pub tempo: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: EnginePhase,
    pub conversion: ConversionStatus,
    pub buffer: BufferStatus,
    pub playback: PlaybackStatus,
}

/// Detailed observer snapshot, including the per-chunk state map and the
/// active retention window around the playhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub tempo: f32,
    pub converting: bool,
    pub conversion_progress: f64,
    pub buffer_health: BufferHealth,
    pub ahead_seconds: f64,
    pub buffering: bool,
    pub chunk_states: Vec<ChunkState>,
    pub current_chunk_index: usize,
    pub active_window_start: usize,
    pub active_window_end: usize,
    pub total_chunks: usize,
    /// Ready fraction within the active window only.
    pub window_conversion_progress: f64,
}
