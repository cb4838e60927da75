use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use stretchkit_engine::{
    BufferSink, ChunkProcessor, ConvertJob, EngineEvent, PoolEvent, SharedBufferSink,
    SourceBuffer, StretchEngine, Tunables, WorkerMessage,
};
use stretchkit_foundation::ManualAudioClock;
use stretchkit_wsola::{stretch, StretchOutcome, StretchParams};
use tokio::sync::mpsc::UnboundedSender;

pub const TEST_SR: u32 = 8_000;

/// Small chunks and frames keep real conversions around a millisecond.
pub fn test_tunables() -> Tunables {
    Tunables {
        chunk_duration_sec: 0.5,
        overlap_sec: 0.05,
        crossfade_sec: 0.02,
        frame_size: 256,
        synthesis_hop: 128,
        tolerance: 64,
        buffer_critical_sec: 0.1,
        buffer_resume_sec: 0.2,
        ..Tunables::default()
    }
}

pub fn sine_source(seconds: f64) -> SourceBuffer {
    let len = (seconds * TEST_SR as f64).round() as usize;
    let samples = (0..len)
        .map(|n| 0.5 * (2.0 * std::f32::consts::PI * n as f32 / 80.0).sin())
        .collect();
    SourceBuffer::new(vec![samples], TEST_SR).unwrap()
}

pub struct TestRig {
    pub engine: StretchEngine,
    pub clock: Arc<ManualAudioClock>,
    #[allow(dead_code)]
    pub sink: SharedBufferSink,
    pub events: Arc<Mutex<Vec<EngineEvent>>>,
}

pub fn build_engine(source: SourceBuffer, tunables: Tunables) -> TestRig {
    let clock = Arc::new(ManualAudioClock::new());
    let sink: SharedBufferSink = Arc::new(Mutex::new(BufferSink::new(clock.clone())));
    let engine = StretchEngine::builder(source)
        .with_tunables(tunables)
        .with_audio_clock(clock.clone())
        .with_sink(Box::new(sink.clone()))
        .build()
        .expect("engine builds");

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    engine.subscribe(move |event| log.lock().push(event.clone()));

    TestRig {
        engine,
        clock,
        sink,
        events,
    }
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Synchronous in-process conversion backend with scripted one-shot
/// failures, used to exercise the retry path deterministically.
pub struct FlakyProcessor {
    result_tx: UnboundedSender<WorkerMessage>,
    params: StretchParams,
    fail_once: Mutex<Vec<usize>>,
}

impl FlakyProcessor {
    pub fn new(result_tx: UnboundedSender<WorkerMessage>, fail_once: Vec<usize>) -> Self {
        Self {
            result_tx,
            params: StretchParams {
                frame_size: 256,
                synthesis_hop: 128,
                tolerance: 64,
                identity_epsilon: 1e-3,
            },
            fail_once: Mutex::new(fail_once),
        }
    }
}

impl ChunkProcessor for FlakyProcessor {
    fn has_capacity(&self) -> bool {
        true
    }

    fn parallelism(&self) -> usize {
        1
    }

    fn submit(&mut self, job: ConvertJob) -> Result<(), ConvertJob> {
        let mut fail = self.fail_once.lock();
        let msg = if let Some(at) = fail.iter().position(|&i| i == job.chunk_index) {
            fail.remove(at);
            WorkerMessage::Error {
                chunk_index: job.chunk_index,
                epoch: job.epoch,
                slot: 0,
                message: "injected worker fault".into(),
            }
        } else {
            match stretch(&job.input, job.tempo, &self.params, &job.cancel) {
                StretchOutcome::Complete(block) => WorkerMessage::Result {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    slot: 0,
                    channels: block.channels,
                    output_len: block.len,
                    elapsed_ms: 1.0,
                },
                StretchOutcome::Cancelled => WorkerMessage::Cancelled {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    slot: 0,
                },
            }
        };
        let _ = self.result_tx.send(msg);
        Ok(())
    }

    fn cancel_chunk(&mut self, _chunk_index: usize) -> bool {
        false
    }

    fn cancel_all(&mut self) {}

    fn note_settled(&mut self, _msg: &WorkerMessage) -> Vec<PoolEvent> {
        Vec::new()
    }

    fn shutdown(&mut self) {}
}
