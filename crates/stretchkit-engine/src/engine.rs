use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use stretchkit_foundation::{
    system_clock, EngineError, EnginePhase, SharedAudioClock, SharedWallClock, StreamClock,
    Tunables,
};
use stretchkit_telemetry::{EngineMetrics, MetricsSnapshot};
use stretchkit_wsola::StretchParams;

use crate::emitter::{EventEmitter, SubscriberId};
use crate::events::{EngineEvent, EngineSnapshot, EngineStatus, EventKind};
use crate::orchestrator::{Command, EngineCore, SharedState};
use crate::pool::{ChunkProcessor, ThreadPoolProcessor, WorkerMessage};
use crate::sink::{BufferSink, OutputStage, PlaybackSink};
use crate::source::SourceBuffer;

/// Builder for [`StretchEngine`]. The source buffer is the only required
/// input; everything else has production defaults.
pub struct EngineBuilder {
    source: SourceBuffer,
    tempo: f32,
    offset: f64,
    sink: Option<Box<dyn PlaybackSink>>,
    output_chain: Vec<Box<dyn OutputStage>>,
    audio_clock: Option<SharedAudioClock>,
    wall_clock: Option<SharedWallClock>,
    tunables: Tunables,
    worker_pool_size: Option<usize>,
    processor: Option<ProcessorFactory>,
}

/// Builds a conversion backend around the engine's result channel.
pub type ProcessorFactory =
    Box<dyn FnOnce(mpsc::UnboundedSender<WorkerMessage>) -> Box<dyn ChunkProcessor> + Send>;

impl EngineBuilder {
    pub fn new(source: SourceBuffer) -> Self {
        Self {
            source,
            tempo: 1.0,
            offset: 0.0,
            sink: None,
            output_chain: Vec::new(),
            audio_clock: None,
            wall_clock: None,
            tunables: Tunables::default(),
            worker_pool_size: None,
            processor: None,
        }
    }

    pub fn with_tempo(mut self, tempo: f32) -> Self {
        self.tempo = tempo;
        self
    }

    pub fn with_offset(mut self, offset_sec: f64) -> Self {
        self.offset = offset_sec;
        self
    }

    /// Terminal output node. Defaults to a software [`BufferSink`] on the
    /// engine's audio clock.
    pub fn with_sink(mut self, sink: Box<dyn PlaybackSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Passive DSP nodes the player connects between its sources and the
    /// sink, in order.
    pub fn with_output_chain(mut self, chain: Vec<Box<dyn OutputStage>>) -> Self {
        self.output_chain = chain;
        self
    }

    pub fn with_audio_clock(mut self, clock: SharedAudioClock) -> Self {
        self.audio_clock = Some(clock);
        self
    }

    pub fn with_wall_clock(mut self, clock: SharedWallClock) -> Self {
        self.wall_clock = Some(clock);
        self
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    /// Replace the conversion backend entirely. The factory receives the
    /// engine's result channel; mainly a seam for tests and for hosts with
    /// their own execution environment.
    pub fn with_processor(mut self, factory: ProcessorFactory) -> Self {
        self.processor = Some(factory);
        self
    }

    /// Validate inputs, assemble the pipeline, and spawn the control task.
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<StretchEngine, EngineError> {
        if !self.tempo.is_finite() || self.tempo <= 0.0 {
            return Err(EngineError::InvalidTempo(self.tempo));
        }
        let pool_size = self.worker_pool_size.unwrap_or(self.tunables.worker_pool_size);
        if pool_size == 0 {
            return Err(EngineError::InvalidPoolSize);
        }
        // Offsets are clamped rather than rejected.
        let offset = self.offset.clamp(0.0, self.source.duration_sec());

        let audio_clock = self
            .audio_clock
            .unwrap_or_else(|| Arc::new(StreamClock::new()));
        let wall_clock = self.wall_clock.unwrap_or_else(system_clock);
        let sink = self
            .sink
            .unwrap_or_else(|| Box::new(BufferSink::new(audio_clock.clone())));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<WorkerMessage>();

        let params = StretchParams {
            frame_size: self.tunables.frame_size,
            synthesis_hop: self.tunables.synthesis_hop,
            tolerance: self.tunables.tolerance,
            identity_epsilon: self.tunables.identity_tempo_epsilon,
        };
        let processor: Box<dyn ChunkProcessor> = match self.processor {
            Some(factory) => factory(result_tx.clone()),
            None => Box::new(ThreadPoolProcessor::new(
                pool_size,
                params,
                result_tx.clone(),
                self.tunables.max_worker_crashes,
            )),
        };

        let emitter = Arc::new(EventEmitter::new());
        let metrics = EngineMetrics::default();
        let core = EngineCore::new(
            Arc::new(self.source),
            Arc::new(self.tunables),
            self.tempo,
            offset,
            processor,
            sink,
            self.output_chain,
            audio_clock.clone(),
            wall_clock,
            emitter.clone(),
            metrics.clone(),
            result_tx,
        );
        let shared = core.shared();
        let task = tokio::spawn(run_control_task(core, cmd_rx, result_rx));

        Ok(StretchEngine {
            cmd_tx,
            shared,
            emitter,
            metrics,
            audio_clock,
            disposed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

/// Control loop: commands, worker results, and a periodic tick multiplexed
/// onto one task that owns the [`EngineCore`].
async fn run_control_task(
    mut core: EngineCore,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut result_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    // 50ms matches the transition margin and tempo debounce, the two
    // tightest deadlines the tick has to observe; the lookahead poll
    // rate-limits itself to its own 200ms interval.
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Dispose) | None => {
                    core.dispose();
                    break;
                }
                Some(command) => core.handle_command(command),
            },
            message = result_rx.recv() => {
                if let Some(message) = message {
                    core.on_worker_message(message);
                }
            }
            _ = tick.tick() => core.tick(),
        }
    }
    debug!("engine control task stopped");
}

/// Handle to a running time-stretch playback engine.
///
/// Control operations post to the engine's control task and return
/// immediately; queries read shared state combined with a live clock
/// reading. All operations after [`dispose`](Self::dispose) are silent
/// no-ops, and queries keep returning the last observed values.
pub struct StretchEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SharedState>,
    emitter: Arc<EventEmitter>,
    metrics: EngineMetrics,
    audio_clock: SharedAudioClock,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StretchEngine {
    pub fn builder(source: SourceBuffer) -> EngineBuilder {
        EngineBuilder::new(source)
    }

    fn send(&self, command: Command) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(command);
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn seek(&self, position_sec: f64) {
        self.send(Command::Seek(position_sec));
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn set_tempo(&self, tempo: f32) {
        self.send(Command::SetTempo(tempo));
    }

    /// Stored but inert: looping is unsupported in stretched playback.
    pub fn set_loop(&self, enabled: bool) {
        self.send(Command::SetLoop(enabled));
    }

    /// Tear everything down: workers, scheduled voices, subscriptions.
    /// Idempotent; queries continue to answer from the last snapshot.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Dispose);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Wait for the control task to finish shutting down after
    /// [`dispose`](Self::dispose).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.emitter.subscribe(callback)
    }

    pub fn subscribe_kind<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.emitter.subscribe_kind(kind, callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.emitter.unsubscribe(id);
    }

    pub fn get_current_position(&self) -> f64 {
        self.shared.position_at(self.audio_clock.now())
    }

    pub fn get_status(&self) -> EngineStatus {
        self.shared.status_at(self.audio_clock.now())
    }

    pub fn get_snapshot(&self) -> EngineSnapshot {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.phase()
    }

    /// Estimated wall-clock milliseconds to convert everything still
    /// outstanding, from the moving average of recent conversions.
    pub fn estimated_remaining_ms(&self) -> f64 {
        self.shared.remaining_estimate_ms()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for StretchEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
