use thiserror::Error;

use crate::state::EnginePhase;

#[derive(Error, Debug)]
pub enum StretchKitError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Worker(#[from] WorkerFault),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

/// Errors surfaced by the engine itself, mostly at construction and on
/// invalid control input.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Tempo must be a positive finite number, got {0}")]
    InvalidTempo(f32),

    #[error("Source buffer has no channels")]
    EmptySource,

    #[error("Source channels have mismatched lengths")]
    RaggedChannels,

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Worker pool size must be at least 1")]
    InvalidPoolSize,

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: EnginePhase, to: EnginePhase },

    #[error("Engine has been disposed")]
    Disposed,
}

/// Faults originating in the conversion workers. These flow back to the
/// orchestrator as messages, never as panics across the pool boundary.
#[derive(Error, Debug, Clone)]
pub enum WorkerFault {
    #[error("Conversion failed for chunk {chunk_index}: {message}")]
    Conversion { chunk_index: usize, message: String },

    #[error("Worker slot {slot} crashed: {message}")]
    Crashed { slot: usize, message: String },

    #[error("Worker slot {slot} retired after {crashes} crashes")]
    SlotRetired { slot: usize, crashes: u32 },

    #[error("All worker slots retired, falling back to inline conversion")]
    AllSlotsRetired,
}
