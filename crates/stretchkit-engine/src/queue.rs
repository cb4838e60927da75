use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, trace};

use stretchkit_foundation::Tunables;
use stretchkit_telemetry::EngineMetrics;
use stretchkit_wsola::CancellationToken;

use crate::chunk::{ChunkState, ChunkStore};
use crate::pool::{ChunkProcessor, ConvertJob, PoolEvent, WorkerMessage};
use crate::source::{AudioData, SharedAudioData, SourceBuffer};
use crate::trim::trim_output;

/// Min-heap key: lower priority value wins, index breaks ties.
#[derive(Debug, PartialEq)]
struct QueueKey {
    priority: f64,
    index: usize,
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap and we want the smallest
        // priority on top.
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Snapshot of the previous tempo's converted output, kept for one
/// generation so an immediate revert needs no reconversion.
struct TempoCache {
    tempo: f32,
    outputs: Vec<(usize, SharedAudioData)>,
}

/// What became of one worker message after reconciliation with the chunk
/// table.
#[derive(Debug)]
pub enum ResultDisposition {
    Ready {
        chunk_index: usize,
        elapsed_ms: f64,
    },
    /// The chunk left `Converting` while the job was in flight (seek or
    /// tempo change); the payload is dropped.
    Stale,
    Retried {
        chunk_index: usize,
        attempt: u32,
        message: String,
    },
    Failed {
        chunk_index: usize,
        message: String,
    },
    Cancelled {
        chunk_index: usize,
        requeued: bool,
    },
}

/// Priority scheduler: keeps a distance-ordered heap of convertible chunks
/// and feeds the worker pool, reconciling results, retries, seeks, and
/// tempo changes against the chunk table.
pub struct ConversionScheduler {
    processor: Box<dyn ChunkProcessor>,
    heap: BinaryHeap<QueueKey>,
    tempo: f32,
    playhead: usize,
    tempo_cache: Option<TempoCache>,
    tunables: Arc<Tunables>,
    metrics: EngineMetrics,
}

impl ConversionScheduler {
    pub fn new(
        processor: Box<dyn ChunkProcessor>,
        tempo: f32,
        tunables: Arc<Tunables>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            processor,
            heap: BinaryHeap::new(),
            tempo,
            playhead: 0,
            tempo_cache: None,
            tunables,
            metrics,
        }
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn cached_tempo(&self) -> Option<f32> {
        self.tempo_cache.as_ref().map(|c| c.tempo)
    }

    /// Plain tempo assignment for use before any conversion has been
    /// dispatched; live changes go through `handle_tempo_change`.
    pub fn set_tempo(&mut self, tempo: f32) {
        self.tempo = tempo;
    }

    /// Swap in a replacement processor (the inline fallback). Work the dead
    /// pool never delivered is re-queued by the next `update_priorities`.
    pub fn replace_processor(&mut self, processor: Box<dyn ChunkProcessor>) {
        self.processor.shutdown();
        self.processor = processor;
    }

    fn priority_for(&self, index: usize, playhead: usize) -> f64 {
        if index >= playhead {
            (index - playhead) as f64 * self.tunables.forward_weight
        } else {
            (playhead - index) as f64 * self.tunables.backward_weight
        }
    }

    fn in_window(&self, index: usize, playhead: usize) -> bool {
        let lo = playhead.saturating_sub(self.tunables.keep_behind());
        let hi = playhead + self.tunables.keep_ahead();
        (lo..=hi).contains(&index)
    }

    fn push(&mut self, index: usize, priority: f64) {
        self.heap.push(QueueKey { priority, index });
    }

    /// Initial enqueue: every convertible chunk enters the heap, evicted
    /// ones only when inside the retention window.
    pub fn start(&mut self, chunks: &mut ChunkStore, source: &SourceBuffer, playhead: usize) {
        self.playhead = playhead;
        self.heap.clear();
        for i in 0..chunks.len() {
            let priority = self.priority_for(i, playhead);
            let chunk = chunks.get_mut(i).expect("index in range");
            chunk.priority = priority;
            let requeue = match chunk.state() {
                ChunkState::Pending | ChunkState::Queued | ChunkState::Failed => true,
                ChunkState::Evicted | ChunkState::Skipped => self.in_window(i, playhead),
                ChunkState::Converting | ChunkState::Ready => false,
            };
            if requeue {
                chunk.set_state(ChunkState::Queued);
                chunk.retry_count = 0;
                self.push(i, priority);
            }
        }
        self.dispatch_next(chunks, source);
    }

    /// Rebuild the heap for a new playhead. Evicted and skipped chunks
    /// inside the window are restored; conversions far from the playhead
    /// are cooperatively cancelled.
    pub fn update_priorities(&mut self, chunks: &mut ChunkStore, playhead: usize) {
        self.playhead = playhead;
        self.heap.clear();
        let cancel_distance = self.tunables.cancel_distance_threshold;

        for i in 0..chunks.len() {
            let priority = self.priority_for(i, playhead);
            let in_window = self.in_window(i, playhead);
            let chunk = chunks.get_mut(i).expect("index in range");
            chunk.priority = priority;
            match chunk.state() {
                ChunkState::Pending | ChunkState::Queued => {
                    chunk.set_state(ChunkState::Queued);
                    self.push(i, priority);
                }
                ChunkState::Evicted | ChunkState::Skipped if in_window => {
                    chunk.set_state(ChunkState::Queued);
                    chunk.retry_count = 0;
                    self.push(i, priority);
                }
                ChunkState::Converting => {
                    let distance = i.abs_diff(playhead);
                    if distance > cancel_distance {
                        trace!(chunk = i, distance, "cancelling far conversion");
                        self.processor.cancel_chunk(i);
                    }
                }
                _ => {}
            }
        }
    }

    /// Feed the pool until it is full or nothing queueable remains.
    pub fn dispatch_next(&mut self, chunks: &mut ChunkStore, source: &SourceBuffer) {
        while self.processor.has_capacity() {
            let Some(key) = self.heap.pop() else {
                break;
            };
            let Some(chunk) = chunks.get_mut(key.index) else {
                continue;
            };
            // Lazy deletion: a heap entry may outlive the state that
            // produced it.
            if chunk.state() != ChunkState::Queued {
                continue;
            }

            chunk.set_state(ChunkState::Converting);
            chunk.epoch += 1;
            let epoch = chunk.epoch;
            let input = chunks.extract_input(source, key.index);
            let job = ConvertJob {
                chunk_index: key.index,
                epoch,
                input,
                tempo: self.tempo,
                sample_rate: source.sample_rate(),
                cancel: CancellationToken::new(),
            };
            trace!(chunk = key.index, priority = key.priority, "dispatching");
            if let Err(job) = self.processor.submit(job) {
                let chunk = chunks.get_mut(job.chunk_index).expect("index in range");
                chunk.set_state(ChunkState::Queued);
                self.push(job.chunk_index, key.priority);
                break;
            }
        }
    }

    /// Reconcile one worker message with the chunk table and top the pool
    /// back up. Stale payloads (the chunk moved on) are discarded here.
    pub fn on_worker_message(
        &mut self,
        chunks: &mut ChunkStore,
        source: &SourceBuffer,
        msg: WorkerMessage,
    ) -> (ResultDisposition, Vec<PoolEvent>) {
        let pool_events = self.processor.note_settled(&msg);
        let index = msg.chunk_index();
        let epoch = msg.epoch();

        let fresh = chunks
            .get(index)
            .is_some_and(|c| c.state() == ChunkState::Converting && c.epoch == epoch);
        if !fresh {
            self.metrics.increment_stale_results();
            debug!(chunk = index, "discarding stale worker message");
            self.dispatch_next(chunks, source);
            return (ResultDisposition::Stale, pool_events);
        }

        let disposition = match msg {
            WorkerMessage::Result {
                channels,
                output_len,
                elapsed_ms,
                ..
            } => {
                let crossfade = self.tunables.crossfade_sec;
                let sample_rate = source.sample_rate();
                let chunk = chunks.get_mut(index).expect("checked above");
                let (trimmed, _len) = trim_output(chunk, channels, output_len, crossfade, sample_rate);
                chunk.set_ready(Arc::new(AudioData::new(trimmed, sample_rate)));
                self.metrics.increment_conversions_completed();
                self.metrics.update_last_conversion_ms(elapsed_ms as u64);
                ResultDisposition::Ready {
                    chunk_index: index,
                    elapsed_ms,
                }
            }
            WorkerMessage::Cancelled { .. } => {
                self.metrics.increment_conversions_cancelled();
                let in_window = self.in_window(index, self.playhead);
                let priority = self.priority_for(index, self.playhead);
                let chunk = chunks.get_mut(index).expect("checked above");
                if in_window {
                    chunk.set_state(ChunkState::Queued);
                    self.push(index, priority);
                } else {
                    chunk.set_state(ChunkState::Skipped);
                }
                ResultDisposition::Cancelled {
                    chunk_index: index,
                    requeued: in_window,
                }
            }
            WorkerMessage::Error { message, .. } => {
                self.metrics.increment_conversions_failed();
                let max_retries = self.tunables.max_chunk_retries;
                let priority = self.priority_for(index, self.playhead);
                let chunk = chunks.get_mut(index).expect("checked above");
                chunk.retry_count += 1;
                if chunk.retry_count <= max_retries {
                    self.metrics.increment_chunk_retries();
                    chunk.set_state(ChunkState::Queued);
                    self.push(index, priority);
                    ResultDisposition::Retried {
                        chunk_index: index,
                        attempt: chunk.retry_count,
                        message,
                    }
                } else {
                    chunk.set_state(ChunkState::Failed);
                    ResultDisposition::Failed {
                        chunk_index: index,
                        message,
                    }
                }
            }
        };

        self.dispatch_next(chunks, source);
        (disposition, pool_events)
    }

    /// Seek invalidation: cancel far conversions, then reorder and refill.
    pub fn handle_seek(
        &mut self,
        chunks: &mut ChunkStore,
        source: &SourceBuffer,
        new_playhead: usize,
    ) {
        self.update_priorities(chunks, new_playhead);
        self.dispatch_next(chunks, source);
    }

    /// Tempo invalidation. The current generation of in-window outputs is
    /// snapshotted so an immediate revert restores instantly; everything
    /// else resets for reconversion at the new tempo.
    pub fn handle_tempo_change(
        &mut self,
        chunks: &mut ChunkStore,
        source: &SourceBuffer,
        new_tempo: f32,
    ) {
        let playhead = self.playhead;
        let outputs: Vec<(usize, SharedAudioData)> = chunks
            .iter()
            .filter(|c| c.is_ready() && self.in_window(c.index, playhead))
            .filter_map(|c| c.output().map(|o| (c.index, Arc::clone(o))))
            .collect();
        debug!(
            cached = outputs.len(),
            from = self.tempo,
            to = new_tempo,
            "tempo change"
        );
        self.tempo_cache = Some(TempoCache {
            tempo: self.tempo,
            outputs,
        });

        for i in 0..chunks.len() {
            let in_window = self.in_window(i, playhead);
            let chunk = chunks.get_mut(i).expect("index in range");
            if chunk.state() == ChunkState::Evicted {
                continue;
            }
            chunk.retry_count = 0;
            if in_window {
                chunk.set_state(ChunkState::Pending);
            } else {
                chunk.set_state(ChunkState::Evicted);
            }
        }

        self.processor.cancel_all();
        self.tempo = new_tempo;
        self.metrics.increment_tempo_changes();
        self.update_priorities(chunks, playhead);
        self.dispatch_next(chunks, source);
    }

    /// Put the cached previous-tempo outputs back. Returns whether a cache
    /// generation existed.
    pub fn restore_previous_tempo(
        &mut self,
        chunks: &mut ChunkStore,
        source: &SourceBuffer,
    ) -> bool {
        let Some(cache) = self.tempo_cache.take() else {
            return false;
        };
        debug!(tempo = cache.tempo, restored = cache.outputs.len(), "restoring previous tempo");
        self.tempo = cache.tempo;
        for (index, output) in cache.outputs {
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.set_ready(output);
                chunk.retry_count = 0;
            }
        }
        self.processor.cancel_all();
        self.update_priorities(chunks, self.playhead);
        self.dispatch_next(chunks, source);
        true
    }

    pub fn has_capacity(&self) -> bool {
        self.processor.has_capacity()
    }

    pub fn cancel_all(&mut self) {
        self.processor.cancel_all();
    }

    pub fn dispose(&mut self) {
        self.heap.clear();
        self.tempo_cache = None;
        self.processor.shutdown();
    }
}
