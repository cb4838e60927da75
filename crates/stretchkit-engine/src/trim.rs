use crate::chunk::Chunk;

/// Remove the stretched overlap from a raw conversion result, keeping a
/// crossfade-sized lead-in at the front when the chunk has a predecessor.
///
/// Overlap regions scale with the realized output ratio `len_out / len_in`
/// rather than the requested tempo, so rounding inside the kernel cannot
/// push the trim out of range. A degenerate trim (nothing would remain)
/// returns the raw output unchanged.
pub fn trim_output(
    chunk: &Chunk,
    raw: Vec<Vec<f32>>,
    raw_len: usize,
    crossfade_sec: f64,
    sample_rate: u32,
) -> (Vec<Vec<f32>>, usize) {
    let input_len = chunk.input_len();
    if input_len == 0 || raw_len == 0 {
        return (raw, raw_len);
    }

    let ratio = raw_len as f64 / input_len as f64;
    let overlap_before_out = (chunk.overlap_before as f64 * ratio).round() as usize;
    let overlap_after_out = (chunk.overlap_after as f64 * ratio).round() as usize;

    let keep_before = if chunk.overlap_before > 0 {
        ((crossfade_sec * sample_rate as f64).round() as usize).min(overlap_before_out)
    } else {
        0
    };

    let trim_start = overlap_before_out - keep_before;
    let trim_end = overlap_after_out;
    if trim_start + trim_end >= raw_len {
        return (raw, raw_len);
    }

    let kept_len = raw_len - trim_start - trim_end;
    let trimmed = raw
        .into_iter()
        .map(|ch| ch[trim_start..trim_start + kept_len].to_vec())
        .collect();
    (trimmed, kept_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStore;
    use stretchkit_foundation::Tunables;

    fn middle_chunk(sr: u32) -> Chunk {
        let store = ChunkStore::split(3 * 8 * sr as usize, sr, &Tunables::default());
        store.get(1).unwrap().clone()
    }

    #[test]
    fn interior_chunk_keeps_a_crossfade_lead_in() {
        let sr = 44_100;
        let chunk = middle_chunk(sr);
        let raw_len = chunk.input_len(); // ratio 1.0
        let raw = vec![(0..raw_len).map(|n| n as f32).collect::<Vec<f32>>()];

        let (out, len) = trim_output(&chunk, raw, raw_len, 0.1, sr);
        let overlap_out = chunk.overlap_before; // ratio 1.0
        let keep = (0.1 * sr as f64).round() as usize;
        assert_eq!(len, raw_len - (overlap_out - keep) - chunk.overlap_after);
        // The first kept sample sits crossfade-length before the nominal
        // content.
        assert_eq!(out[0][0], (overlap_out - keep) as f32);
    }

    #[test]
    fn first_chunk_has_no_lead_in() {
        let sr = 44_100;
        let store = ChunkStore::split(3 * 8 * sr as usize, sr, &Tunables::default());
        let chunk = store.get(0).unwrap().clone();
        let raw_len = chunk.input_len();
        let raw = vec![vec![0.5f32; raw_len]];
        let (_, len) = trim_output(&chunk, raw, raw_len, 0.1, sr);
        assert_eq!(len, raw_len - chunk.overlap_after);
    }

    #[test]
    fn overlap_scales_with_the_realized_ratio() {
        let sr = 44_100;
        let chunk = middle_chunk(sr);
        // Stretched to half speed: output is twice as long.
        let raw_len = chunk.input_len() * 2;
        let raw = vec![vec![0.1f32; raw_len]];
        let (_, len) = trim_output(&chunk, raw, raw_len, 0.1, sr);

        let overlap_before_out = chunk.overlap_before * 2;
        let overlap_after_out = chunk.overlap_after * 2;
        let keep = (0.1 * sr as f64).round() as usize; // smaller than overlap_before_out
        assert_eq!(len, raw_len - (overlap_before_out - keep) - overlap_after_out);
    }

    #[test]
    fn degenerate_trim_returns_raw_output() {
        let sr = 44_100;
        let chunk = middle_chunk(sr);
        // Absurdly short raw output; trimming would consume everything.
        let raw = vec![vec![0.2f32; 100]];
        let (out, len) = trim_output(&chunk, raw, 100, 0.1, sr);
        assert_eq!(len, 100);
        assert_eq!(out[0].len(), 100);
    }
}
