//! Chunked pitch-preserving time-stretch playback.
//!
//! The engine splits a decoded PCM buffer into overlapping chunks, converts
//! them through a WSOLA worker pool in playhead-priority order, and plays
//! the converted output gaplessly through a clock-scheduled sink — with
//! live tempo changes, seeking, buffering hysteresis, and a bounded memory
//! window around the playhead.

pub mod chunk;
pub mod emitter;
pub mod engine;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod player;
pub mod pool;
pub mod position;
pub mod queue;
pub mod sink;
pub mod source;
pub mod timing;
pub mod trim;

pub use chunk::{Chunk, ChunkState, ChunkStore};
pub use emitter::{EventEmitter, SubscriberId};
pub use engine::{EngineBuilder, ProcessorFactory, StretchEngine};
pub use events::{
    BufferStatus, ConversionStatus, EngineEvent, EngineSnapshot, EngineStatus, EventKind,
    PlaybackStatus,
};
pub use orchestrator::{Command, EngineCore, SharedState};
pub use player::ChunkPlayer;
pub use pool::{
    ChunkProcessor, ConvertJob, InlineProcessor, PoolEvent, ThreadPoolProcessor, WorkerMessage,
};
pub use sink::{BufferSink, Fade, OutputStage, PlaybackSink, SharedBufferSink, SinkEvent, VoiceId, VoiceSpec};
pub use source::{AudioData, SharedAudioData, SourceBuffer};

// The foundation types appear throughout the public API; re-export the
// common ones so hosts rarely need the foundation crate directly.
pub use stretchkit_foundation::{
    BufferHealth, BufferingReason, EngineError, EnginePhase, Tunables,
};
