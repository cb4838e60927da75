use serde::{Deserialize, Serialize};

use stretchkit_foundation::Tunables;

use crate::source::{SharedAudioData, SourceBuffer};

/// Conversion lifecycle of a chunk.
///
/// `Pending -> Queued -> Converting -> Ready`; conversion errors loop back
/// through `Queued` until the retry budget is exhausted, then `Failed` is
/// sticky. `Skipped` marks queued work dropped by a seek; `Evicted` marks a
/// released output that can be restored by re-queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Queued,
    Converting,
    Ready,
    Failed,
    Skipped,
    Evicted,
}

/// One conversion unit: a nominal source range plus surrounding overlap.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    /// Half-open input range handed to the worker, overlap included.
    pub input_start: usize,
    pub input_end: usize,
    /// Nominal (non-overlap) half-open range. Adjacent chunks tile the
    /// source exactly.
    pub nominal_start: usize,
    pub nominal_end: usize,
    pub overlap_before: usize,
    pub overlap_after: usize,
    state: ChunkState,
    output: Option<SharedAudioData>,
    pub priority: f64,
    pub retry_count: u32,
    /// Conversion generation; results carrying a stale epoch are discarded.
    pub epoch: u64,
}

impl Chunk {
    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn output(&self) -> Option<&SharedAudioData> {
        self.output.as_ref()
    }

    /// `Ready` is the only state holding an output buffer.
    pub fn set_ready(&mut self, output: SharedAudioData) {
        self.output = Some(output);
        self.state = ChunkState::Ready;
    }

    pub fn set_state(&mut self, state: ChunkState) {
        debug_assert!(state != ChunkState::Ready, "use set_ready");
        self.output = None;
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChunkState::Ready
    }

    /// Terminal means no further conversion is expected for the current
    /// tempo: either output exists or retries ran out.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ChunkState::Ready | ChunkState::Failed)
    }

    pub fn input_len(&self) -> usize {
        self.input_end - self.input_start
    }

    pub fn nominal_start_sec(&self, sample_rate: u32) -> f64 {
        self.nominal_start as f64 / sample_rate as f64
    }

    /// Duration of the ready output buffer, zero otherwise.
    pub fn output_duration_sec(&self) -> f64 {
        self.output.as_ref().map_or(0.0, |o| o.duration_sec())
    }

    /// Seconds of crossfade lead-in retained at the front of the output.
    pub fn lead_in_sec(&self, crossfade_sec: f64) -> f64 {
        if self.overlap_before > 0 {
            crossfade_sec
        } else {
            0.0
        }
    }
}

/// The ordered chunk list for one source buffer, with sample→chunk lookup
/// and worker input extraction.
#[derive(Debug)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    sample_rate: u32,
}

impl ChunkStore {
    /// Split `source_len` samples into chunks of `chunk_duration_sec`,
    /// adding `overlap_sec` on each interior side. Nominal ranges tile
    /// `[0, source_len)` exactly.
    pub fn split(source_len: usize, sample_rate: u32, tunables: &Tunables) -> Self {
        let chunk_samples =
            ((tunables.chunk_duration_sec * sample_rate as f64).round() as usize).max(1);
        let overlap_samples = (tunables.overlap_sec * sample_rate as f64).round() as usize;

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < source_len {
            let nominal_end = (start + chunk_samples).min(source_len);
            let overlap_before = overlap_samples.min(start);
            let overlap_after = overlap_samples.min(source_len - nominal_end);
            chunks.push(Chunk {
                index: chunks.len(),
                input_start: start - overlap_before,
                input_end: nominal_end + overlap_after,
                nominal_start: start,
                nominal_end,
                overlap_before,
                overlap_after,
                state: ChunkState::Pending,
                output: None,
                priority: 0.0,
                retry_count: 0,
                epoch: 0,
            });
            start = nominal_end;
        }

        Self {
            chunks,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.iter_mut()
    }

    /// Index of the chunk whose nominal range contains `sample`; the last
    /// chunk for positions at or past the end.
    pub fn index_for_sample(&self, sample: usize) -> usize {
        if self.chunks.is_empty() {
            return 0;
        }
        let last = self.chunks.len() - 1;
        self.chunks
            .iter()
            .position(|c| sample < c.nominal_end)
            .unwrap_or(last)
    }

    /// Copy a chunk's full input range (overlap included) for transfer to
    /// a worker.
    pub fn extract_input(&self, source: &SourceBuffer, index: usize) -> Vec<Vec<f32>> {
        let chunk = &self.chunks[index];
        source.extract(chunk.input_start, chunk.input_end)
    }

    pub fn ready_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_ready()).count()
    }

    pub fn converting_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.state() == ChunkState::Converting)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.chunks.iter().all(|c| c.is_terminal())
    }

    pub fn states(&self) -> Vec<ChunkState> {
        self.chunks.iter().map(|c| c.state()).collect()
    }
}
