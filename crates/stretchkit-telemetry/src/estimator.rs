use std::collections::VecDeque;

/// Moving average of per-chunk conversion wall time, used for remaining-work
/// estimates while the pipeline is converting.
#[derive(Debug)]
pub struct ConversionEstimator {
    window: usize,
    samples_ms: VecDeque<f64>,
}

impl ConversionEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples_ms: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn record(&mut self, elapsed_ms: f64) {
        if self.samples_ms.len() == self.window {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(elapsed_ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples_ms.is_empty() {
            return 0.0;
        }
        self.samples_ms.iter().sum::<f64>() / self.samples_ms.len() as f64
    }

    /// Estimated milliseconds to convert `remaining_chunks` more chunks.
    /// Zero until at least one sample has landed.
    pub fn estimate_remaining_ms(&self, remaining_chunks: usize) -> f64 {
        self.mean_ms() * remaining_chunks as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples_ms.len()
    }
}
