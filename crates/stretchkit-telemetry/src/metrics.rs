use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters for cross-thread engine monitoring. Cheap to clone;
/// updated with relaxed ordering from the control task and worker threads.
#[derive(Clone, Default)]
pub struct EngineMetrics {
    pub conversions_completed: Arc<AtomicU64>,
    pub conversions_failed: Arc<AtomicU64>,
    pub conversions_cancelled: Arc<AtomicU64>,
    pub chunk_retries: Arc<AtomicU64>,
    pub stale_results_discarded: Arc<AtomicU64>,
    pub worker_crashes: Arc<AtomicU64>,
    pub underruns: Arc<AtomicU64>,
    pub evictions: Arc<AtomicU64>,
    pub seeks: Arc<AtomicU64>,
    pub tempo_changes: Arc<AtomicU64>,
    pub last_conversion_ms: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub conversions_completed: u64,
    pub conversions_failed: u64,
    pub conversions_cancelled: u64,
    pub chunk_retries: u64,
    pub stale_results_discarded: u64,
    pub worker_crashes: u64,
    pub underruns: u64,
    pub evictions: u64,
    pub seeks: u64,
    pub tempo_changes: u64,
    pub last_conversion_ms: u64,
}

impl EngineMetrics {
    pub fn increment_conversions_completed(&self) {
        self.conversions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_conversions_failed(&self) {
        self.conversions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_conversions_cancelled(&self) {
        self.conversions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_chunk_retries(&self) {
        self.chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale_results(&self) {
        self.stale_results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_worker_crashes(&self) {
        self.worker_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_underruns(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_seeks(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tempo_changes(&self) {
        self.tempo_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_last_conversion_ms(&self, ms: u64) {
        self.last_conversion_ms.store(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            conversions_completed: self.conversions_completed.load(Ordering::Relaxed),
            conversions_failed: self.conversions_failed.load(Ordering::Relaxed),
            conversions_cancelled: self.conversions_cancelled.load(Ordering::Relaxed),
            chunk_retries: self.chunk_retries.load(Ordering::Relaxed),
            stale_results_discarded: self.stale_results_discarded.load(Ordering::Relaxed),
            worker_crashes: self.worker_crashes.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            tempo_changes: self.tempo_changes.load(Ordering::Relaxed),
            last_conversion_ms: self.last_conversion_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = EngineMetrics::default();
        let clone = metrics.clone();
        metrics.increment_conversions_completed();
        clone.increment_conversions_completed();
        assert_eq!(metrics.snapshot().conversions_completed, 2);
    }

    #[test]
    fn snapshot_reflects_all_fields() {
        let metrics = EngineMetrics::default();
        metrics.increment_worker_crashes();
        metrics.increment_underruns();
        metrics.add_evictions(5);
        metrics.update_last_conversion_ms(123);
        let snap = metrics.snapshot();
        assert_eq!(snap.worker_crashes, 1);
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.evictions, 5);
        assert_eq!(snap.last_conversion_ms, 123);
    }
}
