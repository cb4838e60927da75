/// Periodic Hann window of the given length.
///
/// The overlap-add path divides by the accumulated window afterwards, so the
/// periodic form (denominator `len`, not `len - 1`) keeps the normalization
/// buffer flat for hop = len / 2.
pub fn hann_window(len: usize) -> Vec<f32> {
    if len == 0 {
        return Vec::new();
    }
    (0..len)
        .map(|n| {
            let phase = 2.0 * std::f64::consts::PI * n as f64 / len as f64;
            (0.5 * (1.0 - phase.cos())) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_peaks_in_the_middle() {
        let w = hann_window(1024);
        assert_eq!(w.len(), 1024);
        assert!(w[0].abs() < 1e-7);
        assert!((w[512] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_overlapped_windows_sum_flat() {
        let len = 256;
        let hop = len / 2;
        let w = hann_window(len);
        // Interior samples covered by two windows sum to 1.
        for n in 0..hop {
            let sum = w[n] + w[n + hop];
            assert!((sum - 1.0).abs() < 1e-6, "sum at {} was {}", n, sum);
        }
    }

    #[test]
    fn zero_length_is_empty() {
        assert!(hann_window(0).is_empty());
    }
}
