use std::sync::Arc;

use stretchkit_foundation::EngineError;

/// Immutable decoded PCM source. Channel data is non-interleaved and never
/// mutated after construction; the engine shares it with workers by copying
/// per-chunk input ranges.
#[derive(Debug)]
pub struct SourceBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl SourceBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, EngineError> {
        if channels.is_empty() {
            return Err(EngineError::EmptySource);
        }
        if sample_rate == 0 {
            return Err(EngineError::InvalidSampleRate(sample_rate));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(EngineError::RaggedChannels);
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn len_samples(&self) -> usize {
        self.channels[0].len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_sec(&self) -> f64 {
        self.len_samples() as f64 / self.sample_rate as f64
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Copy the half-open sample range out of every channel, producing
    /// contiguous per-channel arrays suitable for handing to a worker.
    pub fn extract(&self, start: usize, end: usize) -> Vec<Vec<f32>> {
        let end = end.min(self.len_samples());
        let start = start.min(end);
        self.channels.iter().map(|c| c[start..end].to_vec()).collect()
    }
}

/// An owned block of converted output, shared between the chunk record,
/// the tempo cache, and the playback sink.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioData {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn len_samples(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn duration_sec(&self) -> f64 {
        self.len_samples() as f64 / self.sample_rate as f64
    }
}

pub type SharedAudioData = Arc<AudioData>;
