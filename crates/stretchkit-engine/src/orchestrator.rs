use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use stretchkit_foundation::{
    BufferingReason, EnginePhase, PhaseTracker, SharedAudioClock, SharedWallClock, Tunables,
};
use stretchkit_telemetry::{ConversionEstimator, EngineMetrics};
use stretchkit_wsola::StretchParams;

use crate::chunk::{ChunkState, ChunkStore};
use crate::emitter::EventEmitter;
use crate::events::{
    BufferStatus, ConversionStatus, EngineEvent, EngineSnapshot, EngineStatus, PlaybackStatus,
};
use crate::monitor;
use crate::player::{ChunkPlayer, PlayerBasis};
use crate::pool::{ChunkProcessor, InlineProcessor, PoolEvent, WorkerMessage};
use crate::position::{self, PositionQuery};
use crate::queue::{ConversionScheduler, ResultDisposition};
use crate::sink::{OutputStage, PlaybackSink};
use crate::source::SourceBuffer;
use crate::timing;

/// Control operations posted by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Seek(f64),
    Stop,
    SetTempo(f32),
    SetLoop(bool),
    Dispose,
}

/// State published for lock-cheap cross-thread queries. The control task
/// refreshes it after every mutation; readers combine it with a live clock
/// reading for positions.
pub struct SharedState {
    status: RwLock<EngineStatus>,
    snapshot: RwLock<EngineSnapshot>,
    query_basis: RwLock<PositionQuery>,
    player_basis: RwLock<PlayerBasis>,
    remaining_estimate_ms: RwLock<f64>,
}

impl SharedState {
    fn new(duration: f64, tempo: f32, start_offset: f64, crossfade_sec: f64, total: usize) -> Self {
        Self {
            status: RwLock::new(EngineStatus {
                phase: EnginePhase::Waiting,
                conversion: ConversionStatus {
                    total,
                    ready: 0,
                    converting: 0,
                    progress: 0.0,
                },
                buffer: BufferStatus {
                    health: stretchkit_foundation::BufferHealth::Empty,
                    ahead_seconds: 0.0,
                },
                playback: PlaybackStatus {
                    position: start_offset,
                    duration,
                    tempo,
                },
            }),
            snapshot: RwLock::new(EngineSnapshot {
                tempo,
                converting: false,
                conversion_progress: 0.0,
                buffer_health: stretchkit_foundation::BufferHealth::Empty,
                ahead_seconds: 0.0,
                buffering: false,
                chunk_states: vec![ChunkState::Pending; total],
                current_chunk_index: 0,
                active_window_start: 0,
                active_window_end: total.saturating_sub(1),
                total_chunks: total,
                window_conversion_progress: 0.0,
            }),
            query_basis: RwLock::new(PositionQuery {
                phase: EnginePhase::Waiting,
                duration,
                start_offset,
                buffering_resume_position: None,
                tempo,
                crossfade_sec,
                chunk_nominal_start_sec: None,
                chunk_has_lead_in: false,
                pos_in_chunk: 0.0,
            }),
            player_basis: RwLock::new(PlayerBasis::Inactive),
            remaining_estimate_ms: RwLock::new(0.0),
        }
    }

    /// Source position at audio-clock time `now`.
    pub fn position_at(&self, now: f64) -> f64 {
        let mut query = self.query_basis.read().clone();
        query.pos_in_chunk = self.player_basis.read().position_at(now);
        position::current_position(&query)
    }

    pub fn status_at(&self, now: f64) -> EngineStatus {
        let mut status = self.status.read().clone();
        status.playback.position = self.position_at(now);
        status
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.read().clone()
    }

    pub fn phase(&self) -> EnginePhase {
        self.status.read().phase
    }

    pub fn remaining_estimate_ms(&self) -> f64 {
        *self.remaining_estimate_ms.read()
    }
}

struct PendingTransition {
    deadline: f64,
    chunk_index: usize,
}

struct TempoDebounce {
    target: f32,
    deadline: Instant,
}

/// The engine state machine. Owns every mutable piece of the pipeline and
/// runs single-threaded on the control task; workers and the sink talk to
/// it exclusively through drained messages.
pub struct EngineCore {
    source: Arc<SourceBuffer>,
    chunks: ChunkStore,
    scheduler: ConversionScheduler,
    player: ChunkPlayer,
    phase: PhaseTracker,
    tunables: Arc<Tunables>,
    params: StretchParams,
    emitter: Arc<EventEmitter>,
    metrics: EngineMetrics,
    estimator: ConversionEstimator,
    wall: SharedWallClock,
    audio_clock: SharedAudioClock,
    shared: Arc<SharedState>,
    result_tx: tokio::sync::mpsc::UnboundedSender<WorkerMessage>,

    current_chunk: usize,
    start_offset: f64,
    buffering_resume_position: Option<f64>,
    buffering_since: Option<Instant>,
    pending_transition: Option<PendingTransition>,
    tempo_debounce: Option<TempoDebounce>,
    pending_tempo_paused: Option<f32>,
    last_lookahead: Option<Instant>,
    loop_enabled: bool,
    started: bool,
    disposed: bool,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<SourceBuffer>,
        tunables: Arc<Tunables>,
        initial_tempo: f32,
        initial_offset: f64,
        processor: Box<dyn ChunkProcessor>,
        mut sink: Box<dyn PlaybackSink>,
        output_chain: Vec<Box<dyn OutputStage>>,
        audio_clock: SharedAudioClock,
        wall: SharedWallClock,
        emitter: Arc<EventEmitter>,
        metrics: EngineMetrics,
        result_tx: tokio::sync::mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        let chunks = ChunkStore::split(source.len_samples(), source.sample_rate(), &tunables);
        let params = StretchParams {
            frame_size: tunables.frame_size,
            synthesis_hop: tunables.synthesis_hop,
            tolerance: tunables.tolerance,
            identity_epsilon: tunables.identity_tempo_epsilon,
        };
        sink.install_chain(output_chain);
        let player = ChunkPlayer::new(sink, audio_clock.clone(), tunables.crossfade_sec);
        let scheduler = ConversionScheduler::new(
            processor,
            initial_tempo,
            tunables.clone(),
            metrics.clone(),
        );
        let shared = Arc::new(SharedState::new(
            source.duration_sec(),
            initial_tempo,
            initial_offset,
            tunables.crossfade_sec,
            chunks.len(),
        ));
        let estimator = ConversionEstimator::new(tunables.estimator_window);

        Self {
            source,
            chunks,
            scheduler,
            player,
            phase: PhaseTracker::new(),
            tunables,
            params,
            emitter,
            metrics,
            estimator,
            wall,
            audio_clock,
            shared,
            result_tx,
            current_chunk: 0,
            start_offset: initial_offset,
            buffering_resume_position: None,
            buffering_since: None,
            pending_transition: None,
            tempo_debounce: None,
            pending_tempo_paused: None,
            last_lookahead: None,
            loop_enabled: false,
            started: false,
            disposed: false,
        }
    }

    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// The stored loop flag. Accepted for interface parity; stretched
    /// playback ignores it.
    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    #[cfg(test)]
    pub(crate) fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    #[cfg(test)]
    pub(crate) fn current_chunk_index(&self) -> usize {
        self.current_chunk
    }

    // ---- command handling -------------------------------------------------

    pub fn handle_command(&mut self, command: Command) {
        if self.disposed {
            return;
        }
        match command {
            Command::Start => self.start(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Seek(position) => self.seek(position),
            Command::Stop => self.stop(),
            Command::SetTempo(tempo) => self.set_tempo(tempo),
            Command::SetLoop(enabled) => self.set_loop(enabled),
            Command::Dispose => self.dispose(),
        }
    }

    fn start(&mut self) {
        if self.started {
            debug!("start ignored: engine already started");
            return;
        }
        self.started = true;

        if self.chunks.is_empty() {
            info!("zero-length source: ending immediately");
            self.set_phase(EnginePhase::Ended);
            self.emitter.emit(&EngineEvent::Ended);
            self.update_shared();
            return;
        }

        let sample = (self.start_offset * self.source.sample_rate() as f64).round() as usize;
        self.current_chunk = self.chunks.index_for_sample(sample);
        self.buffering_resume_position = Some(self.start_offset);
        self.enter_buffering(BufferingReason::Initial);
        self.scheduler
            .start(&mut self.chunks, &self.source, self.current_chunk);
        self.update_shared();
    }

    fn pause(&mut self) {
        if !matches!(
            self.phase.current(),
            EnginePhase::Playing | EnginePhase::Buffering { .. }
        ) {
            return;
        }
        if self.phase.current() == EnginePhase::Playing {
            self.player.pause();
        }
        self.pending_transition = None;
        self.set_phase(EnginePhase::Paused);
        self.update_shared();
    }

    fn resume(&mut self) {
        if self.phase.current() != EnginePhase::Paused {
            return;
        }

        if let Some(target) = self.pending_tempo_paused.take() {
            self.enter_buffering(BufferingReason::TempoChange);
            self.apply_tempo(target);
            self.update_shared();
            return;
        }

        let ready = self
            .chunks
            .get(self.current_chunk)
            .is_some_and(|c| c.is_ready());
        if ready {
            let offset = match self.player.paused_position() {
                Some(paused) => paused,
                None => self.resume_offset_in_buffer(),
            };
            let buffer = self
                .chunks
                .get(self.current_chunk)
                .and_then(|c| c.output())
                .cloned()
                .expect("ready chunk has output");
            self.player
                .play_chunk(self.current_chunk, buffer, offset, true);
            self.set_phase(EnginePhase::Playing);
            self.buffering_resume_position = None;
            self.buffering_since = None;
        } else {
            if self.buffering_resume_position.is_none() {
                let resume = self
                    .player
                    .paused_position()
                    .map(|p| self.chunk_position_to_source(p))
                    .unwrap_or_else(|| self.nominal_start_sec(self.current_chunk));
                self.buffering_resume_position = Some(resume);
            }
            self.enter_buffering(BufferingReason::Underrun);
        }
        self.update_shared();
    }

    fn seek(&mut self, position: f64) {
        if self.phase.current() == EnginePhase::Ended {
            return;
        }
        let position = position.clamp(0.0, self.source.duration_sec());
        self.metrics.increment_seeks();
        let sample = (position * self.source.sample_rate() as f64).round() as usize;
        let new_chunk = self.chunks.index_for_sample(sample);
        debug!(position, chunk = new_chunk, "seek");

        self.pending_transition = None;
        self.current_chunk = new_chunk;

        if self.phase.current() == EnginePhase::Waiting {
            // Not started yet; just move the start point.
            self.start_offset = position;
            self.update_shared();
            return;
        }

        self.scheduler
            .handle_seek(&mut self.chunks, &self.source, new_chunk);
        self.evict_distant();

        if self.phase.current() == EnginePhase::Paused {
            self.player.stop();
            self.buffering_resume_position = Some(position);
            self.update_shared();
            return;
        }

        let ready = self.chunks.get(new_chunk).is_some_and(|c| c.is_ready());
        if ready {
            self.buffering_resume_position = Some(position);
            let offset = self.resume_offset_in_buffer();
            let buffer = self
                .chunks
                .get(new_chunk)
                .and_then(|c| c.output())
                .cloned()
                .expect("ready chunk has output");
            self.player.handle_seek(new_chunk, buffer, offset);
            if self.phase.current() != EnginePhase::Playing {
                self.set_phase(EnginePhase::Playing);
            }
            self.buffering_resume_position = None;
            self.buffering_since = None;
        } else {
            self.buffering_resume_position = Some(position);
            self.enter_buffering(BufferingReason::Seek);
        }
        self.update_shared();
    }

    fn stop(&mut self) {
        if self.phase.current() == EnginePhase::Ended {
            return;
        }
        self.pending_transition = None;
        self.tempo_debounce = None;
        self.player.stop();
        self.scheduler.cancel_all();
        self.set_phase(EnginePhase::Ended);
        self.update_shared();
    }

    fn set_tempo(&mut self, tempo: f32) {
        if self.phase.current() == EnginePhase::Ended {
            return;
        }
        if !tempo.is_finite() || tempo <= 0.0 {
            warn!(tempo, "rejecting invalid tempo");
            self.emitter.emit(&EngineEvent::Error {
                message: format!("invalid tempo factor: {}", tempo),
                chunk_index: None,
                fatal: false,
            });
            return;
        }
        if tempo == self.target_tempo() {
            return;
        }

        match self.phase.current() {
            EnginePhase::Waiting => {
                // Nothing converted yet; the new tempo simply becomes the
                // starting tempo.
                self.scheduler.set_tempo(tempo);
            }
            EnginePhase::Paused => {
                if self.buffering_resume_position.is_none() {
                    self.buffering_resume_position = Some(self.position());
                }
                self.pending_tempo_paused = Some(tempo);
            }
            _ => {
                if self.buffering_resume_position.is_none() {
                    self.buffering_resume_position = Some(self.position());
                }
                self.enter_buffering(BufferingReason::TempoChange);
                // Coalesce slider bursts: only the last target within the
                // debounce window reaches the scheduler.
                self.tempo_debounce = Some(TempoDebounce {
                    target: tempo,
                    deadline: self.wall.now() + self.tunables.tempo_debounce,
                });
            }
        }
        self.update_shared();
    }

    fn set_loop(&mut self, enabled: bool) {
        // Accepted but inert: looping is unsupported in stretched playback.
        self.loop_enabled = enabled;
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        info!("disposing engine");
        self.disposed = true;
        self.tempo_debounce = None;
        self.pending_transition = None;
        self.player.stop();
        self.scheduler.dispose();
        self.update_shared();
        self.emitter.clear();
    }

    // ---- worker + sink message handling -----------------------------------

    pub fn on_worker_message(&mut self, msg: WorkerMessage) {
        if self.disposed {
            return;
        }
        let (disposition, pool_events) =
            self.scheduler
                .on_worker_message(&mut self.chunks, &self.source, msg);

        for event in &pool_events {
            self.on_pool_event(event);
        }

        match disposition {
            ResultDisposition::Ready {
                chunk_index,
                elapsed_ms,
            } => self.on_chunk_ready(chunk_index, elapsed_ms),
            ResultDisposition::Retried {
                chunk_index,
                attempt,
                message,
            } => {
                debug!(chunk = chunk_index, attempt, "retrying failed conversion");
                self.emitter.emit(&EngineEvent::Error {
                    message,
                    chunk_index: Some(chunk_index),
                    fatal: false,
                });
                self.update_shared();
            }
            ResultDisposition::Failed {
                chunk_index,
                message,
            } => {
                warn!(chunk = chunk_index, "chunk failed permanently");
                self.emitter.emit(&EngineEvent::Error {
                    message,
                    chunk_index: Some(chunk_index),
                    fatal: true,
                });
                if self.phase.current().is_buffering()
                    && monitor::should_exit_buffering(&self.chunks, self.current_chunk, &self.tunables)
                {
                    self.exit_buffering();
                }
                if self.chunks.all_terminal() {
                    self.emitter.emit(&EngineEvent::Complete);
                }
                self.update_shared();
            }
            ResultDisposition::Cancelled { .. } | ResultDisposition::Stale => {
                self.update_shared();
            }
        }
    }

    fn on_pool_event(&mut self, event: &PoolEvent) {
        match event {
            PoolEvent::SlotRetired { slot, crashes } => {
                self.metrics.increment_worker_crashes();
                warn!(slot, crashes, "worker slot retired");
            }
            PoolEvent::AllRetired => {
                warn!("all worker slots retired; switching to inline fallback");
                self.emitter.emit(&EngineEvent::Error {
                    message: "all conversion workers failed; continuing single-threaded".into(),
                    chunk_index: None,
                    fatal: false,
                });
                let inline = InlineProcessor::new(self.params.clone(), self.result_tx.clone());
                self.scheduler.replace_processor(Box::new(inline));
                self.scheduler
                    .update_priorities(&mut self.chunks, self.current_chunk);
                self.scheduler.dispatch_next(&mut self.chunks, &self.source);
            }
        }
    }

    fn on_chunk_ready(&mut self, chunk_index: usize, elapsed_ms: f64) {
        self.estimator.record(elapsed_ms);
        self.emitter.emit(&EngineEvent::ChunkReady { index: chunk_index });
        self.emit_progress_and_health();

        match self.phase.current() {
            EnginePhase::Buffering { .. } => {
                if monitor::should_exit_buffering(&self.chunks, self.current_chunk, &self.tunables) {
                    self.exit_buffering();
                }
            }
            EnginePhase::Playing => {
                if chunk_index == self.current_chunk + 1
                    && !self.player.has_next_scheduled()
                    && self.player.remaining_in_chunk()
                        <= self.tunables.proactive_schedule_threshold_sec
                {
                    self.schedule_next_chunk();
                }
            }
            _ => {}
        }

        if self.chunks.all_terminal() {
            self.emitter.emit(&EngineEvent::Complete);
        }
        self.evict_distant();
        self.update_shared();
    }

    // ---- periodic tick ----------------------------------------------------

    /// Drive everything time-based: sink notifications, pending gapless
    /// transitions, the tempo debounce, and the lookahead poll.
    pub fn tick(&mut self) {
        if self.disposed {
            return;
        }

        if let Some(ended_chunk) = self.player.poll_ended() {
            self.on_chunk_ended(ended_chunk);
        }

        if let Some(transition) = &self.pending_transition {
            if self.audio_clock.now() >= transition.deadline {
                self.finish_transition();
            }
        }

        if let Some(debounce) = &self.tempo_debounce {
            if self.wall.now() >= debounce.deadline {
                let target = debounce.target;
                self.tempo_debounce = None;
                self.apply_tempo(target);
            }
        }

        let lookahead_due = self
            .last_lookahead
            .map_or(true, |last| self.wall.now() - last >= self.tunables.lookahead_interval);
        if lookahead_due {
            self.last_lookahead = Some(self.wall.now());
            if self.phase.current() == EnginePhase::Playing
                && self.player.needs_next(self.tunables.lookahead_threshold_sec)
            {
                self.on_need_next();
            }
        }
    }

    fn on_need_next(&mut self) {
        let next = self.current_chunk + 1;
        if next >= self.chunks.len() {
            return;
        }
        if self.chunks.get(next).is_some_and(|c| c.is_ready()) {
            self.schedule_next_chunk();
        }
        // Not ready: the underrun, if it comes, is handled at chunk end.
    }

    fn on_chunk_ended(&mut self, ended_chunk: usize) {
        if ended_chunk != self.current_chunk {
            return;
        }
        let next = self.current_chunk + 1;
        if next >= self.chunks.len() {
            self.finish_ended();
            return;
        }

        self.current_chunk = next;
        self.scheduler
            .update_priorities(&mut self.chunks, self.current_chunk);
        self.scheduler.dispatch_next(&mut self.chunks, &self.source);
        self.evict_distant();

        let chunk_ready = self.chunks.get(next).is_some_and(|c| c.is_ready());
        if chunk_ready {
            let (buffer, lead_in) = {
                let chunk = self.chunks.get(next).expect("index checked");
                (
                    chunk.output().cloned().expect("ready chunk has output"),
                    chunk.lead_in_sec(self.tunables.crossfade_sec),
                )
            };
            self.player.play_chunk(next, buffer, lead_in, false);
        } else {
            self.buffering_resume_position = Some(self.nominal_start_sec(next));
            self.metrics.increment_underruns();
            self.enter_buffering(BufferingReason::Underrun);
        }
        self.update_shared();
    }

    fn schedule_next_chunk(&mut self) {
        let next = self.current_chunk + 1;
        let Some(join_at) = self.player.current_end_time() else {
            return;
        };
        let Some(chunk) = self.chunks.get(next) else {
            return;
        };
        let Some(buffer) = chunk.output().cloned() else {
            return;
        };
        let lead_in = chunk.lead_in_sec(self.tunables.crossfade_sec);
        self.player.schedule_next(next, buffer, join_at, lead_in);
        self.pending_transition = Some(PendingTransition {
            deadline: timing::transition_deadline(
                join_at,
                self.audio_clock.now(),
                self.tunables.transition_margin,
            ),
            chunk_index: next,
        });
    }

    fn finish_transition(&mut self) {
        let Some(transition) = self.pending_transition.take() else {
            return;
        };
        if self.player.promote_next() == Some(transition.chunk_index) {
            self.current_chunk = transition.chunk_index;
            self.scheduler
                .update_priorities(&mut self.chunks, self.current_chunk);
            self.scheduler.dispatch_next(&mut self.chunks, &self.source);
            self.evict_distant();
            self.update_shared();
        }
    }

    fn finish_ended(&mut self) {
        info!("playback reached the end of the source");
        self.player.stop();
        self.pending_transition = None;
        self.buffering_resume_position = None;
        self.set_phase(EnginePhase::Ended);
        self.emitter.emit(&EngineEvent::Ended);
        self.update_shared();
    }

    // ---- buffering --------------------------------------------------------

    fn enter_buffering(&mut self, reason: BufferingReason) {
        if let EnginePhase::Buffering { reason: current } = self.phase.current() {
            if current == reason {
                return;
            }
        }
        if self.phase.current() == EnginePhase::Playing {
            self.player.stop();
        }
        self.pending_transition = None;
        if self
            .phase
            .transition(EnginePhase::Buffering { reason })
            .is_ok()
        {
            if self.buffering_since.is_none() {
                self.buffering_since = Some(self.wall.now());
            }
            self.emitter.emit(&EngineEvent::Buffering { reason });
        }
    }

    fn exit_buffering(&mut self) {
        // Skip over permanently failed regions; land on the next chunk
        // that can actually sound.
        loop {
            if self.current_chunk >= self.chunks.len() {
                self.finish_ended();
                return;
            }
            let state = self
                .chunks
                .get(self.current_chunk)
                .map(|c| c.state())
                .unwrap_or(ChunkState::Failed);
            match state {
                ChunkState::Ready => break,
                ChunkState::Failed | ChunkState::Skipped => {
                    debug!(chunk = self.current_chunk, "skipping unplayable chunk");
                    self.current_chunk += 1;
                    self.buffering_resume_position =
                        Some(self.nominal_start_sec(self.current_chunk.min(self.chunks.len())));
                }
                _ => return, // still converting; stay in buffering
            }
        }

        let offset = self.resume_offset_in_buffer();
        let (buffer, output_duration) = {
            let chunk = self.chunks.get(self.current_chunk).expect("index checked");
            (
                chunk.output().cloned().expect("ready chunk has output"),
                chunk.output_duration_sec(),
            )
        };

        // A resume target at the very tail of the chunk belongs to the
        // next chunk.
        if offset > output_duration - 0.05 {
            self.current_chunk += 1;
            if self.current_chunk >= self.chunks.len() {
                self.finish_ended();
                return;
            }
            self.buffering_resume_position = Some(self.nominal_start_sec(self.current_chunk));
            self.scheduler
                .update_priorities(&mut self.chunks, self.current_chunk);
            self.scheduler.dispatch_next(&mut self.chunks, &self.source);
            if self
                .chunks
                .get(self.current_chunk)
                .is_some_and(|c| c.is_ready())
            {
                self.exit_buffering();
            }
            return;
        }

        self.player
            .play_chunk(self.current_chunk, buffer, offset, false);
        self.set_phase(EnginePhase::Playing);

        let stall_ms = self
            .buffering_since
            .take()
            .map(|since| self.wall.now().duration_since(since).as_millis() as u64)
            .unwrap_or(0);
        self.buffering_resume_position = None;
        self.emitter.emit(&EngineEvent::Buffered { stall_ms });
        self.update_shared();
    }

    // ---- tempo ------------------------------------------------------------

    fn target_tempo(&self) -> f32 {
        self.tempo_debounce
            .as_ref()
            .map(|d| d.target)
            .or(self.pending_tempo_paused)
            .unwrap_or_else(|| self.scheduler.tempo())
    }

    fn apply_tempo(&mut self, target: f32) {
        if target == self.scheduler.tempo() {
            // The burst settled back on the current tempo: nothing to
            // reconvert, resume straight away.
            debug!(tempo = target, "tempo change collapsed to a no-op");
        } else if self.scheduler.cached_tempo() == Some(target) {
            info!(tempo = target, "restoring cached tempo generation");
            self.scheduler
                .restore_previous_tempo(&mut self.chunks, &self.source);
        } else {
            info!(tempo = target, "applying tempo change");
            self.scheduler
                .handle_tempo_change(&mut self.chunks, &self.source, target);
        }

        self.emit_progress_and_health();
        if self.phase.current().is_buffering()
            && monitor::should_exit_buffering(&self.chunks, self.current_chunk, &self.tunables)
        {
            self.exit_buffering();
        }
        self.update_shared();
    }

    // ---- helpers ----------------------------------------------------------

    fn set_phase(&mut self, phase: EnginePhase) {
        if let Err(err) = self.phase.transition(phase) {
            warn!(%err, "phase transition rejected");
        }
    }

    fn nominal_start_sec(&self, chunk_index: usize) -> f64 {
        self.chunks
            .get(chunk_index)
            .map(|c| c.nominal_start_sec(self.source.sample_rate()))
            .unwrap_or_else(|| self.source.duration_sec())
    }

    /// Offset into the current chunk's output buffer for the pending
    /// resume position.
    fn resume_offset_in_buffer(&self) -> f64 {
        let Some(chunk) = self.chunks.get(self.current_chunk) else {
            return 0.0;
        };
        let resume = self
            .buffering_resume_position
            .unwrap_or_else(|| chunk.nominal_start_sec(self.source.sample_rate()));
        let nominal_start = chunk.nominal_start_sec(self.source.sample_rate());
        let offset_in_output =
            ((resume - nominal_start) / self.scheduler.tempo() as f64).max(0.0);
        chunk.lead_in_sec(self.tunables.crossfade_sec) + offset_in_output
    }

    /// Map an in-chunk output position back to source seconds.
    fn chunk_position_to_source(&self, pos_in_chunk: f64) -> f64 {
        let Some(chunk) = self.chunks.get(self.current_chunk) else {
            return 0.0;
        };
        let lead_in = chunk.lead_in_sec(self.tunables.crossfade_sec);
        let nominal_start = chunk.nominal_start_sec(self.source.sample_rate());
        nominal_start + (pos_in_chunk - lead_in).max(0.0) * self.scheduler.tempo() as f64
    }

    pub fn position(&self) -> f64 {
        let query = self.position_query();
        position::current_position(&query)
    }

    fn position_query(&self) -> PositionQuery {
        let chunk = self.chunks.get(self.current_chunk);
        PositionQuery {
            phase: self.phase.current(),
            duration: self.source.duration_sec(),
            start_offset: self.start_offset,
            buffering_resume_position: self.buffering_resume_position,
            tempo: self.scheduler.tempo(),
            crossfade_sec: self.tunables.crossfade_sec,
            chunk_nominal_start_sec: chunk
                .map(|c| c.nominal_start_sec(self.source.sample_rate())),
            chunk_has_lead_in: chunk.map(|c| c.overlap_before > 0).unwrap_or(false),
            pos_in_chunk: self.player.position_in_chunk(),
        }
    }

    fn evict_distant(&mut self) {
        let keep_behind = self.tunables.keep_behind();
        let keep_ahead = self.tunables.keep_ahead();
        let lo = self.current_chunk.saturating_sub(keep_behind);
        let hi = self.current_chunk + keep_ahead;
        let mut evicted = 0u64;
        for chunk in self.chunks.iter_mut() {
            if chunk.is_ready() && !(lo..=hi).contains(&chunk.index) {
                chunk.set_state(ChunkState::Evicted);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, window = ?(lo..=hi), "evicted distant chunk outputs");
            self.metrics.add_evictions(evicted);
        }
    }

    fn emit_progress_and_health(&self) {
        let total = self.chunks.len();
        let ready = self.chunks.ready_count();
        self.emitter.emit(&EngineEvent::Progress {
            total,
            ready,
            progress: if total == 0 {
                1.0
            } else {
                ready as f64 / total as f64
            },
        });
        let ahead = monitor::ahead_seconds(&self.chunks, self.current_chunk);
        self.emitter.emit(&EngineEvent::BufferHealth {
            health: monitor::classify(&self.chunks, self.current_chunk, &self.tunables),
            ahead_seconds: ahead,
        });
    }

    // ---- shared-state publication -----------------------------------------

    fn update_shared(&mut self) {
        let total = self.chunks.len();
        let ready = self.chunks.ready_count();
        let converting = self.chunks.converting_count();
        let ahead = monitor::ahead_seconds(&self.chunks, self.current_chunk);
        let health = monitor::classify(&self.chunks, self.current_chunk, &self.tunables);
        let phase = self.phase.current();
        let tempo = self.target_tempo();

        let window_start = self.current_chunk.saturating_sub(self.tunables.keep_behind());
        let window_end = (self.current_chunk + self.tunables.keep_ahead())
            .min(total.saturating_sub(1));
        let window_ready = (window_start..=window_end)
            .filter(|&i| self.chunks.get(i).is_some_and(|c| c.is_ready()))
            .count();
        let window_len = if total == 0 {
            0
        } else {
            window_end - window_start + 1
        };

        *self.shared.status.write() = EngineStatus {
            phase,
            conversion: ConversionStatus {
                total,
                ready,
                converting,
                progress: if total == 0 {
                    1.0
                } else {
                    ready as f64 / total as f64
                },
            },
            buffer: BufferStatus {
                health,
                ahead_seconds: ahead,
            },
            playback: PlaybackStatus {
                position: self.position(),
                duration: self.source.duration_sec(),
                tempo,
            },
        };

        *self.shared.snapshot.write() = EngineSnapshot {
            tempo,
            converting: converting > 0,
            conversion_progress: if total == 0 {
                1.0
            } else {
                ready as f64 / total as f64
            },
            buffer_health: health,
            ahead_seconds: ahead,
            buffering: phase.is_buffering(),
            chunk_states: self.chunks.states(),
            current_chunk_index: self.current_chunk,
            active_window_start: window_start,
            active_window_end: window_end,
            total_chunks: total,
            window_conversion_progress: if window_len == 0 {
                1.0
            } else {
                window_ready as f64 / window_len as f64
            },
        };

        *self.shared.query_basis.write() = self.position_query();
        *self.shared.player_basis.write() = self.player.position_basis();

        let unresolved = total
            - self
                .chunks
                .iter()
                .filter(|c| c.is_terminal())
                .count();
        *self.shared.remaining_estimate_ms.write() =
            self.estimator.estimate_remaining_ms(unresolved);
    }
}
