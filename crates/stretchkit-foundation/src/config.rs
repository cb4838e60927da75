use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs. Every field has a production default; hosts override
/// selectively through the engine builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    /// Nominal chunk length in source seconds.
    pub chunk_duration_sec: f64,
    /// Overlap added on each side of a chunk, in source seconds.
    pub overlap_sec: f64,
    /// Crossfade length kept at chunk joins, in output seconds.
    pub crossfade_sec: f64,

    /// WSOLA analysis/synthesis frame length in samples.
    pub frame_size: usize,
    /// Fixed output advance per frame in samples.
    pub synthesis_hop: usize,
    /// Alignment search radius in samples.
    pub tolerance: usize,
    /// Tempo factors within this distance of 1.0 bypass stretching entirely.
    pub identity_tempo_epsilon: f32,

    /// Priority weight for chunks ahead of the playhead.
    pub forward_weight: f64,
    /// Priority weight for chunks behind the playhead.
    pub backward_weight: f64,
    /// In-flight conversions farther than this many chunks from the
    /// playhead are cancelled on seek or tempo change.
    pub cancel_distance_threshold: usize,

    /// Buffer-health band edges, in seconds of ready output ahead.
    pub buffer_healthy_sec: f64,
    pub buffer_low_sec: f64,
    pub buffer_critical_sec: f64,
    /// Hysteresis exit threshold; strictly above `buffer_critical_sec`.
    pub buffer_resume_sec: f64,

    /// Retention window bounds. The effective window is the larger of the
    /// chunk-count bound and the seconds bound divided by chunk duration.
    pub keep_ahead_chunks: usize,
    pub keep_ahead_sec: f64,
    pub keep_behind_chunks: usize,
    pub keep_behind_sec: f64,

    pub worker_pool_size: usize,
    pub max_worker_crashes: u32,
    pub max_chunk_retries: u32,
    pub estimator_window: usize,

    pub lookahead_interval: Duration,
    /// Remaining seconds in the current chunk below which the player asks
    /// for the next chunk.
    pub lookahead_threshold_sec: f64,
    /// Remaining seconds below which a freshly ready next chunk is
    /// scheduled without waiting for the lookahead poll.
    pub proactive_schedule_threshold_sec: f64,
    pub tempo_debounce: Duration,
    pub transition_margin: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            chunk_duration_sec: 8.0,
            overlap_sec: 0.2,
            crossfade_sec: 0.1,
            frame_size: 1024,
            synthesis_hop: 512,
            tolerance: 2048,
            identity_tempo_epsilon: 1e-3,
            forward_weight: 1.0,
            backward_weight: 2.5,
            cancel_distance_threshold: 6,
            buffer_healthy_sec: 30.0,
            buffer_low_sec: 10.0,
            buffer_critical_sec: 3.0,
            buffer_resume_sec: 5.0,
            keep_ahead_chunks: 19,
            keep_ahead_sec: 150.0,
            keep_behind_chunks: 8,
            keep_behind_sec: 60.0,
            worker_pool_size: 2,
            max_worker_crashes: 3,
            max_chunk_retries: 3,
            estimator_window: 10,
            lookahead_interval: Duration::from_millis(200),
            lookahead_threshold_sec: 3.0,
            proactive_schedule_threshold_sec: 5.0,
            tempo_debounce: Duration::from_millis(50),
            transition_margin: Duration::from_millis(50),
        }
    }
}

impl Tunables {
    /// Effective forward retention window in chunks.
    pub fn keep_ahead(&self) -> usize {
        self.keep_ahead_chunks
            .max((self.keep_ahead_sec / self.chunk_duration_sec).ceil() as usize)
    }

    /// Effective backward retention window in chunks.
    pub fn keep_behind(&self) -> usize {
        self.keep_behind_chunks
            .max((self.keep_behind_sec / self.chunk_duration_sec).ceil() as usize)
    }

    pub fn transition_margin_sec(&self) -> f64 {
        self.transition_margin.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_bounds() {
        let t = Tunables::default();
        // 150s / 8s = 18.75 -> 19; count bound is also 19.
        assert_eq!(t.keep_ahead(), 19);
        // 60s / 8s = 7.5 -> 8; count bound is also 8.
        assert_eq!(t.keep_behind(), 8);
    }

    #[test]
    fn seconds_bound_dominates_for_short_chunks() {
        let t = Tunables {
            chunk_duration_sec: 4.0,
            ..Tunables::default()
        };
        assert_eq!(t.keep_ahead(), 38);
        assert_eq!(t.keep_behind(), 15);
    }

    #[test]
    fn hysteresis_thresholds_are_separated() {
        let t = Tunables::default();
        assert!(t.buffer_resume_sec > t.buffer_critical_sec);
    }
}
