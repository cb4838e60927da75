use crossbeam_channel::Sender;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use stretchkit_wsola::{stretch, CancellationToken, StretchOutcome, StretchParams};

/// One conversion request. Input ownership moves to the processor and comes
/// back inside the result message.
#[derive(Debug)]
pub struct ConvertJob {
    pub chunk_index: usize,
    /// Conversion generation of the chunk at dispatch time.
    pub epoch: u64,
    pub input: Vec<Vec<f32>>,
    pub tempo: f32,
    pub sample_rate: u32,
    pub cancel: CancellationToken,
}

/// Responses posted to the shared result channel. Delivery is ordered per
/// slot; no ordering holds across slots.
#[derive(Debug)]
pub enum WorkerMessage {
    Result {
        chunk_index: usize,
        epoch: u64,
        slot: usize,
        channels: Vec<Vec<f32>>,
        output_len: usize,
        elapsed_ms: f64,
    },
    Cancelled {
        chunk_index: usize,
        epoch: u64,
        slot: usize,
    },
    Error {
        chunk_index: usize,
        epoch: u64,
        slot: usize,
        message: String,
    },
}

impl WorkerMessage {
    pub fn chunk_index(&self) -> usize {
        match self {
            WorkerMessage::Result { chunk_index, .. }
            | WorkerMessage::Cancelled { chunk_index, .. }
            | WorkerMessage::Error { chunk_index, .. } => *chunk_index,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            WorkerMessage::Result { epoch, .. }
            | WorkerMessage::Cancelled { epoch, .. }
            | WorkerMessage::Error { epoch, .. } => *epoch,
        }
    }

    fn slot(&self) -> usize {
        match self {
            WorkerMessage::Result { slot, .. }
            | WorkerMessage::Cancelled { slot, .. }
            | WorkerMessage::Error { slot, .. } => *slot,
        }
    }
}

/// Pool lifecycle notifications derived from settling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    SlotRetired { slot: usize, crashes: u32 },
    AllRetired,
}

/// Executes conversion jobs off the control task. Implementations must
/// deliver exactly one message per accepted job.
pub trait ChunkProcessor: Send {
    fn has_capacity(&self) -> bool;
    fn parallelism(&self) -> usize;
    /// Accept a job, or hand it back when no live slot can take it.
    fn submit(&mut self, job: ConvertJob) -> Result<(), ConvertJob>;
    /// Cooperatively cancel the in-flight conversion of one chunk.
    fn cancel_chunk(&mut self, chunk_index: usize) -> bool;
    fn cancel_all(&mut self);
    /// Update slot bookkeeping for a drained message. Returns lifecycle
    /// events (slot retirement, pool exhaustion).
    fn note_settled(&mut self, msg: &WorkerMessage) -> Vec<PoolEvent>;
    fn shutdown(&mut self);
}

struct InFlight {
    chunk_index: usize,
    epoch: u64,
    cancel: CancellationToken,
}

struct WorkerSlot {
    tx: Option<Sender<ConvertJob>>,
    handle: Option<JoinHandle<()>>,
    in_flight: Option<InFlight>,
    crash_count: u32,
    retired: bool,
}

/// Fixed-size pool of dedicated conversion threads.
pub struct ThreadPoolProcessor {
    slots: Vec<WorkerSlot>,
    params: StretchParams,
    result_tx: UnboundedSender<WorkerMessage>,
    max_crashes: u32,
}

impl ThreadPoolProcessor {
    pub fn new(
        size: usize,
        params: StretchParams,
        result_tx: UnboundedSender<WorkerMessage>,
        max_crashes: u32,
    ) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(size),
            params,
            result_tx,
            max_crashes,
        };
        for slot in 0..size.max(1) {
            let (tx, handle) = pool.spawn_worker(slot);
            pool.slots.push(WorkerSlot {
                tx: Some(tx),
                handle: Some(handle),
                in_flight: None,
                crash_count: 0,
                retired: false,
            });
        }
        pool
    }

    fn spawn_worker(&self, slot: usize) -> (Sender<ConvertJob>, JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::unbounded::<ConvertJob>();
        let params = self.params.clone();
        let result_tx = self.result_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("stretch-worker-{}", slot))
            .spawn(move || {
                debug!(slot, "stretch worker started");
                for job in rx.iter() {
                    let started = Instant::now();
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        stretch(&job.input, job.tempo, &params, &job.cancel)
                    }));
                    let msg = match outcome {
                        Ok(StretchOutcome::Complete(block)) => WorkerMessage::Result {
                            chunk_index: job.chunk_index,
                            epoch: job.epoch,
                            slot,
                            channels: block.channels,
                            output_len: block.len,
                            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                        },
                        Ok(StretchOutcome::Cancelled) => WorkerMessage::Cancelled {
                            chunk_index: job.chunk_index,
                            epoch: job.epoch,
                            slot,
                        },
                        Err(panic) => WorkerMessage::Error {
                            chunk_index: job.chunk_index,
                            epoch: job.epoch,
                            slot,
                            message: panic_message(panic),
                        },
                    };
                    if result_tx.send(msg).is_err() {
                        // Engine gone; nothing left to report to.
                        break;
                    }
                }
                debug!(slot, "stretch worker stopped");
            })
            .expect("failed to spawn stretch worker thread");
        (tx, handle)
    }

    fn retire_slot(&mut self, slot: usize) {
        let state = &mut self.slots[slot];
        state.retired = true;
        state.tx = None;
        if let Some(flight) = &state.in_flight {
            flight.cancel.cancel();
        }
        error!(
            slot,
            crashes = state.crash_count,
            "worker slot retired permanently"
        );
    }

    fn all_retired(&self) -> bool {
        self.slots.iter().all(|s| s.retired)
    }
}

impl ChunkProcessor for ThreadPoolProcessor {
    fn has_capacity(&self) -> bool {
        self.slots
            .iter()
            .any(|s| !s.retired && s.in_flight.is_none())
    }

    fn parallelism(&self) -> usize {
        self.slots.iter().filter(|s| !s.retired).count()
    }

    fn submit(&mut self, job: ConvertJob) -> Result<(), ConvertJob> {
        let Some(slot) = self
            .slots
            .iter()
            .position(|s| !s.retired && s.in_flight.is_none())
        else {
            return Err(job);
        };

        let in_flight = InFlight {
            chunk_index: job.chunk_index,
            epoch: job.epoch,
            cancel: job.cancel.clone(),
        };

        let tx = self.slots[slot].tx.as_ref().expect("live slot has sender");
        match tx.send(job) {
            Ok(()) => {
                self.slots[slot].in_flight = Some(in_flight);
                Ok(())
            }
            Err(send_err) => {
                // The thread died without reporting; treat as a crash and
                // respawn before giving up on the job.
                warn!(slot, "worker thread found dead at dispatch, respawning");
                self.slots[slot].crash_count += 1;
                if self.slots[slot].crash_count >= self.max_crashes {
                    self.retire_slot(slot);
                    return Err(send_err.0);
                }
                let (tx, handle) = self.spawn_worker(slot);
                self.slots[slot].tx = Some(tx);
                self.slots[slot].handle = Some(handle);
                let job = send_err.0;
                let in_flight = InFlight {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    cancel: job.cancel.clone(),
                };
                match self.slots[slot].tx.as_ref().expect("just spawned").send(job) {
                    Ok(()) => {
                        self.slots[slot].in_flight = Some(in_flight);
                        Ok(())
                    }
                    Err(send_err) => Err(send_err.0),
                }
            }
        }
    }

    fn cancel_chunk(&mut self, chunk_index: usize) -> bool {
        for slot in &self.slots {
            if let Some(flight) = &slot.in_flight {
                if flight.chunk_index == chunk_index {
                    flight.cancel.cancel();
                    return true;
                }
            }
        }
        false
    }

    fn cancel_all(&mut self) {
        for slot in &self.slots {
            if let Some(flight) = &slot.in_flight {
                flight.cancel.cancel();
            }
        }
    }

    fn note_settled(&mut self, msg: &WorkerMessage) -> Vec<PoolEvent> {
        let slot = msg.slot();
        let mut events = Vec::new();
        if slot >= self.slots.len() {
            return events;
        }

        let matches = self.slots[slot]
            .in_flight
            .as_ref()
            .is_some_and(|f| f.chunk_index == msg.chunk_index() && f.epoch == msg.epoch());
        if matches {
            self.slots[slot].in_flight = None;
        }

        if let WorkerMessage::Error { message, .. } = msg {
            self.slots[slot].crash_count += 1;
            warn!(
                slot,
                crashes = self.slots[slot].crash_count,
                %message,
                "worker reported a conversion fault"
            );
            if !self.slots[slot].retired && self.slots[slot].crash_count >= self.max_crashes {
                self.retire_slot(slot);
                events.push(PoolEvent::SlotRetired {
                    slot,
                    crashes: self.slots[slot].crash_count,
                });
                if self.all_retired() {
                    events.push(PoolEvent::AllRetired);
                }
            }
        }
        events
    }

    fn shutdown(&mut self) {
        for slot in &mut self.slots {
            if let Some(flight) = &slot.in_flight {
                flight.cancel.cancel();
            }
            slot.tx = None;
        }
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadPoolProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fallback processor used once every pool slot has retired: runs the
/// kernel on the blocking-task queue, one conversion at a time. The caller
/// never blocks; parallelism drops to one.
pub struct InlineProcessor {
    params: StretchParams,
    result_tx: UnboundedSender<WorkerMessage>,
    busy: Arc<AtomicBool>,
    in_flight: Option<InFlight>,
}

impl InlineProcessor {
    pub fn new(params: StretchParams, result_tx: UnboundedSender<WorkerMessage>) -> Self {
        Self {
            params,
            result_tx,
            busy: Arc::new(AtomicBool::new(false)),
            in_flight: None,
        }
    }
}

impl ChunkProcessor for InlineProcessor {
    fn has_capacity(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn parallelism(&self) -> usize {
        1
    }

    fn submit(&mut self, job: ConvertJob) -> Result<(), ConvertJob> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(job);
        }
        self.in_flight = Some(InFlight {
            chunk_index: job.chunk_index,
            epoch: job.epoch,
            cancel: job.cancel.clone(),
        });

        let params = self.params.clone();
        let result_tx = self.result_tx.clone();
        let busy = self.busy.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                stretch(&job.input, job.tempo, &params, &job.cancel)
            }));
            let msg = match outcome {
                Ok(StretchOutcome::Complete(block)) => WorkerMessage::Result {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    slot: 0,
                    channels: block.channels,
                    output_len: block.len,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                },
                Ok(StretchOutcome::Cancelled) => WorkerMessage::Cancelled {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    slot: 0,
                },
                Err(panic) => WorkerMessage::Error {
                    chunk_index: job.chunk_index,
                    epoch: job.epoch,
                    slot: 0,
                    message: panic_message(panic),
                },
            };
            busy.store(false, Ordering::SeqCst);
            let _ = result_tx.send(msg);
        });
        Ok(())
    }

    fn cancel_chunk(&mut self, chunk_index: usize) -> bool {
        match &self.in_flight {
            Some(flight) if flight.chunk_index == chunk_index => {
                flight.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn cancel_all(&mut self) {
        if let Some(flight) = &self.in_flight {
            flight.cancel.cancel();
        }
    }

    fn note_settled(&mut self, msg: &WorkerMessage) -> Vec<PoolEvent> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.chunk_index == msg.chunk_index() && f.epoch == msg.epoch());
        if matches {
            self.in_flight = None;
        }
        Vec::new()
    }

    fn shutdown(&mut self) {
        self.cancel_all();
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
