use stretchkit_foundation::{BufferHealth, Tunables};

use crate::chunk::ChunkStore;

/// Seconds of ready output ahead of the playhead: the summed duration of
/// the longest all-ready chunk prefix starting at `playhead`.
pub fn ahead_seconds(chunks: &ChunkStore, playhead: usize) -> f64 {
    let mut total = 0.0;
    for i in playhead..chunks.len() {
        match chunks.get(i) {
            Some(chunk) if chunk.is_ready() => total += chunk.output_duration_sec(),
            _ => break,
        }
    }
    total
}

pub fn classify(chunks: &ChunkStore, playhead: usize, tunables: &Tunables) -> BufferHealth {
    BufferHealth::classify(ahead_seconds(chunks, playhead), tunables)
}

fn current_ready(chunks: &ChunkStore, playhead: usize) -> bool {
    chunks.get(playhead).is_some_and(|c| c.is_ready())
}

/// The chunk after the playhead, treated as vacuously ready when the
/// playhead chunk is the last one.
fn next_ready(chunks: &ChunkStore, playhead: usize) -> bool {
    match chunks.get(playhead + 1) {
        Some(chunk) => chunk.is_ready(),
        None => true,
    }
}

/// Underrun test: almost nothing playable remains and the chunks the
/// playhead needs next are missing. Suppressed once every chunk is
/// terminal, because buffering could then never end.
pub fn should_enter_buffering(chunks: &ChunkStore, playhead: usize, tunables: &Tunables) -> bool {
    if chunks.all_terminal() {
        return false;
    }
    ahead_seconds(chunks, playhead) < tunables.buffer_critical_sec
        && (!current_ready(chunks, playhead) || !next_ready(chunks, playhead))
}

/// Buffering exit test. The exit threshold sits strictly above the enter
/// threshold, and the playhead chunk must itself be playable, so enter and
/// exit are never simultaneously true.
pub fn should_exit_buffering(chunks: &ChunkStore, playhead: usize, tunables: &Tunables) -> bool {
    if chunks.all_terminal() {
        return true;
    }
    current_ready(chunks, playhead)
        && (ahead_seconds(chunks, playhead) >= tunables.buffer_resume_sec
            || next_ready(chunks, playhead))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkState;
    use crate::source::AudioData;
    use std::sync::Arc;

    fn store(chunk_count: usize) -> ChunkStore {
        let sr = 1000;
        ChunkStore::split(chunk_count * 8 * sr as usize, sr, &Tunables::default())
    }

    fn make_ready(chunks: &mut ChunkStore, index: usize, seconds: f64) {
        let sr = chunks.sample_rate();
        let len = (seconds * sr as f64) as usize;
        chunks
            .get_mut(index)
            .unwrap()
            .set_ready(Arc::new(AudioData::new(vec![vec![0.0; len]], sr)));
    }

    #[test]
    fn ahead_counts_the_ready_prefix_only() {
        let mut chunks = store(6);
        make_ready(&mut chunks, 1, 8.0);
        make_ready(&mut chunks, 2, 8.0);
        make_ready(&mut chunks, 4, 8.0); // gap at 3 stops the prefix
        assert_eq!(ahead_seconds(&chunks, 1), 16.0);
        assert_eq!(ahead_seconds(&chunks, 0), 0.0);
        assert_eq!(ahead_seconds(&chunks, 4), 8.0);
    }

    #[test]
    fn enter_requires_missing_near_chunks() {
        let t = Tunables::default();
        let mut chunks = store(6);
        assert!(should_enter_buffering(&chunks, 0, &t));

        make_ready(&mut chunks, 0, 8.0);
        make_ready(&mut chunks, 1, 8.0);
        // 16s ahead, current and next ready: healthy enough.
        assert!(!should_enter_buffering(&chunks, 0, &t));
    }

    #[test]
    fn exit_needs_a_playable_current_chunk() {
        let t = Tunables::default();
        let mut chunks = store(6);
        assert!(!should_exit_buffering(&chunks, 0, &t));

        make_ready(&mut chunks, 1, 8.0);
        // Next ready but current missing: still stuck.
        assert!(!should_exit_buffering(&chunks, 0, &t));

        make_ready(&mut chunks, 0, 8.0);
        assert!(should_exit_buffering(&chunks, 0, &t));
    }

    #[test]
    fn exit_threshold_alone_suffices() {
        let t = Tunables::default();
        let mut chunks = store(6);
        make_ready(&mut chunks, 0, 8.0);
        // 8s ahead >= 5s resume threshold even though chunk 1 is missing.
        assert!(should_exit_buffering(&chunks, 0, &t));
    }

    #[test]
    fn all_terminal_forces_exit() {
        let t = Tunables::default();
        let mut chunks = store(3);
        for i in 0..3 {
            chunks.get_mut(i).unwrap().set_state(ChunkState::Failed);
        }
        assert!(should_exit_buffering(&chunks, 0, &t));
        assert!(!should_enter_buffering(&chunks, 0, &t));
    }

    #[test]
    fn enter_and_exit_are_never_both_true() {
        let t = Tunables::default();
        // Sweep every readiness combination of a 4-chunk store at every
        // playhead position.
        for mask in 0u32..16 {
            for playhead in 0..4usize {
                let mut chunks = store(4);
                for i in 0..4 {
                    if mask & (1 << i) != 0 {
                        make_ready(&mut chunks, i, 8.0);
                    }
                }
                let enter = should_enter_buffering(&chunks, playhead, &t);
                let exit = should_exit_buffering(&chunks, playhead, &t);
                assert!(
                    !(enter && exit),
                    "hysteresis violated: mask {:04b} playhead {}",
                    mask,
                    playhead
                );
            }
        }
    }

    #[test]
    fn last_chunk_treats_next_as_ready() {
        let t = Tunables::default();
        let mut chunks = store(3);
        make_ready(&mut chunks, 2, 8.0);
        // Playhead on the final chunk: 8s ahead, no next to wait for.
        assert!(!should_enter_buffering(&chunks, 2, &t));
        assert!(should_exit_buffering(&chunks, 2, &t));
    }
}
