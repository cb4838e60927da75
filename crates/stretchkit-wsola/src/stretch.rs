use crate::cancel::CancellationToken;
use crate::ncc::best_alignment;
use crate::window::hann_window;

/// Accumulated-window floor below which an output sample is left
/// unnormalized (it carries no frame contribution worth rescaling).
const OVERLAP_NORM_FLOOR: f32 = 1e-8;

/// Kernel tuning constants. Defaults match the engine-wide tunables.
#[derive(Debug, Clone)]
pub struct StretchParams {
    pub frame_size: usize,
    pub synthesis_hop: usize,
    pub tolerance: usize,
    /// Tempo factors within this distance of 1.0 return a plain copy,
    /// avoiding alignment artifacts near unity.
    pub identity_epsilon: f32,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            synthesis_hop: 512,
            tolerance: 2048,
            identity_epsilon: 1e-3,
        }
    }
}

/// A stretched block of non-interleaved channel data.
#[derive(Debug, Clone, PartialEq)]
pub struct StretchedBlock {
    pub channels: Vec<Vec<f32>>,
    pub len: usize,
}

impl StretchedBlock {
    fn copy_of(channels: &[Vec<f32>]) -> Self {
        let len = channels.first().map_or(0, |c| c.len());
        Self {
            channels: channels.to_vec(),
            len,
        }
    }
}

/// Result of a kernel run. Cancellation discards all in-progress output.
#[derive(Debug, Clone, PartialEq)]
pub enum StretchOutcome {
    Complete(StretchedBlock),
    Cancelled,
}

/// Time-stretch `channels` by `tempo` using windowed overlap-add with NCC
/// alignment. All channels must have equal length; output length is
/// approximately `len / tempo`.
///
/// Fixed synthesis hop, variable analysis hop: the output advances by
/// `synthesis_hop` per frame while the input advances by
/// `round(synthesis_hop * tempo)`, so pitch is preserved and duration
/// scales. Alignment runs on a mono mixdown and the chosen offset applies
/// to every channel, keeping channels phase-locked.
pub fn stretch(
    channels: &[Vec<f32>],
    tempo: f32,
    params: &StretchParams,
    cancel: &CancellationToken,
) -> StretchOutcome {
    let channel_count = channels.len();
    let input_len = channels.first().map_or(0, |c| c.len());
    debug_assert!(channels.iter().all(|c| c.len() == input_len));

    if channel_count == 0 || input_len == 0 {
        return StretchOutcome::Complete(StretchedBlock {
            channels: vec![Vec::new(); channel_count],
            len: 0,
        });
    }
    if !tempo.is_finite() || tempo <= 0.0 {
        return StretchOutcome::Complete(StretchedBlock::copy_of(channels));
    }
    if (tempo - 1.0).abs() < params.identity_epsilon {
        return StretchOutcome::Complete(StretchedBlock::copy_of(channels));
    }

    let frame_size = params.frame_size;
    let hop = params.synthesis_hop;
    let analysis_hop = ((hop as f32 * tempo).round() as usize).max(1);

    if input_len < frame_size {
        return StretchOutcome::Complete(StretchedBlock::copy_of(channels));
    }
    let frame_count = (input_len - frame_size) / analysis_hop + 1;
    let out_len = (frame_count - 1) * hop + frame_size;

    let window = hann_window(frame_size);
    let mix = mixdown(channels, input_len);

    let mut out = vec![vec![0.0f32; out_len]; channel_count];
    let mut norm = vec![0.0f32; out_len];
    let mut reference = vec![0.0f32; frame_size];

    for k in 0..frame_count {
        if cancel.is_cancelled() {
            return StretchOutcome::Cancelled;
        }

        let nominal = k * analysis_hop;
        let pos = if k == 0 || params.tolerance == 0 {
            nominal.min(input_len - frame_size)
        } else {
            best_alignment(
                &reference[frame_size - hop..],
                &mix,
                nominal,
                params.tolerance,
                frame_size,
            )
        };

        let out_base = k * hop;
        for (ch, out_ch) in out.iter_mut().enumerate() {
            let input_ch = &channels[ch];
            for n in 0..frame_size {
                out_ch[out_base + n] += input_ch[pos + n] * window[n];
            }
        }
        for n in 0..frame_size {
            norm[out_base + n] += window[n];
        }
        for n in 0..frame_size {
            reference[n] = mix[pos + n] * window[n];
        }
    }

    for out_ch in &mut out {
        for (sample, &w) in out_ch.iter_mut().zip(&norm) {
            if w > OVERLAP_NORM_FLOOR {
                *sample /= w;
            }
        }
    }

    StretchOutcome::Complete(StretchedBlock {
        channels: out,
        len: out_len,
    })
}

fn mixdown(channels: &[Vec<f32>], len: usize) -> Vec<f32> {
    if channels.len() == 1 {
        return channels[0].clone();
    }
    let scale = 1.0 / channels.len() as f32;
    let mut mix = vec![0.0f32; len];
    for ch in channels {
        for (acc, &s) in mix.iter_mut().zip(ch) {
            *acc += s;
        }
    }
    for s in &mut mix {
        *s *= scale;
    }
    mix
}
