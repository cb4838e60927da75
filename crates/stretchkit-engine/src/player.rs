use tracing::{debug, trace};

use stretchkit_foundation::SharedAudioClock;

use crate::sink::{Fade, PlaybackSink, SinkEvent, VoiceId, VoiceSpec};
use crate::source::SharedAudioData;

struct PlayingVoice {
    id: VoiceId,
    chunk_index: usize,
    duration_sec: f64,
    started_at: f64,
    start_offset: f64,
}

struct ScheduledVoice {
    id: VoiceId,
    chunk_index: usize,
    /// Clock time at which this voice's nominal content takes over from
    /// the current voice.
    join_at: f64,
    lead_in_sec: f64,
    duration_sec: f64,
}

/// Player timing state exported for cross-thread position queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerBasis {
    Inactive,
    Paused {
        position: f64,
    },
    Active {
        started_at: f64,
        start_offset: f64,
        duration_sec: f64,
    },
}

impl PlayerBasis {
    /// In-chunk output-time position at audio-clock time `now`.
    pub fn position_at(&self, now: f64) -> f64 {
        match *self {
            PlayerBasis::Inactive => 0.0,
            PlayerBasis::Paused { position } => position,
            PlayerBasis::Active {
                started_at,
                start_offset,
                duration_sec,
            } => (now - started_at + start_offset).clamp(0.0, duration_sec),
        }
    }
}

/// Double-buffered gapless playback over a clock-scheduled sink.
///
/// At most two voices are live: `current`, and a `next` scheduled so that
/// its crossfade lead-in overlaps the tail of `current`. Gain ramps are in
/// audio-clock time, so continuity does not depend on control-task jitter.
pub struct ChunkPlayer {
    sink: Box<dyn PlaybackSink>,
    clock: SharedAudioClock,
    crossfade_sec: f64,
    current: Option<PlayingVoice>,
    next: Option<ScheduledVoice>,
    paused_position: Option<f64>,
    stopped: bool,
}

impl ChunkPlayer {
    pub fn new(sink: Box<dyn PlaybackSink>, clock: SharedAudioClock, crossfade_sec: f64) -> Self {
        Self {
            sink,
            clock,
            crossfade_sec,
            current: None,
            next: None,
            paused_position: None,
            stopped: false,
        }
    }

    pub fn install_chain(&mut self, chain: Vec<Box<dyn crate::sink::OutputStage>>) {
        self.sink.install_chain(chain);
    }

    /// Hard-start a chunk at `offset_sec` into its output buffer, tearing
    /// down whatever was playing. A short fade-in masks the edge unless
    /// `skip_fade_in` is set (resume-from-pause) or the crossfade is zero.
    pub fn play_chunk(
        &mut self,
        chunk_index: usize,
        buffer: SharedAudioData,
        offset_sec: f64,
        skip_fade_in: bool,
    ) {
        self.stop_voices();
        let now = self.clock.now();
        let duration_sec = buffer.duration_sec();
        let offset_sec = offset_sec.clamp(0.0, duration_sec);

        let fade_in = if skip_fade_in || self.crossfade_sec <= 0.0 {
            None
        } else {
            Some(Fade {
                begin: now,
                duration: self.crossfade_sec,
                from: 0.0,
                to: 1.0,
            })
        };

        let id = self.sink.start_voice(VoiceSpec {
            buffer,
            start_at: now,
            offset_sec,
            fade_in,
        });
        debug!(chunk = chunk_index, offset = offset_sec, "playing chunk");
        self.current = Some(PlayingVoice {
            id,
            chunk_index,
            duration_sec,
            started_at: now,
            start_offset: offset_sec,
        });
        self.paused_position = None;
        self.stopped = false;
    }

    /// Schedule the following chunk so its nominal content takes over at
    /// `join_at`. When the buffer carries a crossfade lead-in the voice
    /// starts `lead_in_sec` early, ramping in while the current voice
    /// ramps out over the same interval.
    pub fn schedule_next(
        &mut self,
        chunk_index: usize,
        buffer: SharedAudioData,
        join_at: f64,
        lead_in_sec: f64,
    ) {
        if self.next.is_some() {
            return;
        }
        let duration_sec = buffer.duration_sec();
        let start_at = join_at - lead_in_sec;

        let fade_in = if lead_in_sec > 0.0 {
            Some(Fade {
                begin: start_at,
                duration: lead_in_sec,
                from: 0.0,
                to: 1.0,
            })
        } else {
            None
        };
        let id = self.sink.start_voice(VoiceSpec {
            buffer,
            start_at,
            offset_sec: 0.0,
            fade_in,
        });
        if lead_in_sec > 0.0 {
            if let Some(current) = &self.current {
                self.sink.apply_fade(
                    current.id,
                    Fade {
                        begin: start_at,
                        duration: lead_in_sec,
                        from: 1.0,
                        to: 0.0,
                    },
                );
            }
        }

        debug!(chunk = chunk_index, join_at, "scheduled gapless transition");
        self.next = Some(ScheduledVoice {
            id,
            chunk_index,
            join_at,
            lead_in_sec,
            duration_sec,
        });
    }

    /// Finish a transition: the scheduled voice becomes current and the
    /// old one is torn down. Returns the chunk index now playing.
    pub fn promote_next(&mut self) -> Option<usize> {
        let next = self.next.take()?;
        if let Some(old) = self.current.take() {
            self.sink.stop_voice(old.id);
        }
        trace!(chunk = next.chunk_index, "transition complete");
        self.current = Some(PlayingVoice {
            id: next.id,
            chunk_index: next.chunk_index,
            duration_sec: next.duration_sec,
            started_at: next.join_at - next.lead_in_sec,
            start_offset: 0.0,
        });
        Some(next.chunk_index)
    }

    pub fn handle_seek(&mut self, chunk_index: usize, buffer: SharedAudioData, offset_sec: f64) {
        self.play_chunk(chunk_index, buffer, offset_sec, false);
    }

    /// Capture the in-chunk position and silence both voices. Playback
    /// resumes through a fresh `play_chunk` at a computed offset.
    pub fn pause(&mut self) {
        if self.current.is_some() {
            self.paused_position = Some(self.position_in_chunk());
        }
        self.stop_voices();
    }

    pub fn stop(&mut self) {
        self.stop_voices();
        self.paused_position = None;
        self.stopped = true;
    }

    fn stop_voices(&mut self) {
        if let Some(current) = self.current.take() {
            self.sink.stop_voice(current.id);
        }
        if let Some(next) = self.next.take() {
            self.sink.stop_voice(next.id);
        }
    }

    /// Output-time position within the current chunk buffer. Paused
    /// returns the captured position; stopped returns zero.
    pub fn position_in_chunk(&self) -> f64 {
        if let Some(paused) = self.paused_position {
            return paused;
        }
        if self.stopped {
            return 0.0;
        }
        match &self.current {
            Some(voice) => {
                let elapsed = self.clock.now() - voice.started_at + voice.start_offset;
                elapsed.clamp(0.0, voice.duration_sec)
            }
            None => 0.0,
        }
    }

    pub fn remaining_in_chunk(&self) -> f64 {
        match &self.current {
            Some(voice) => (voice.duration_sec - self.position_in_chunk()).max(0.0),
            None => 0.0,
        }
    }

    /// Lookahead trigger: a chunk is playing, nothing is scheduled, and
    /// less than `threshold_sec` of it remains.
    pub fn needs_next(&self, threshold_sec: f64) -> bool {
        self.current.is_some()
            && self.next.is_none()
            && self.paused_position.is_none()
            && self.remaining_in_chunk() <= threshold_sec
    }

    /// Clock time at which the current voice runs out.
    pub fn current_end_time(&self) -> Option<f64> {
        self.current
            .as_ref()
            .map(|v| v.started_at + (v.duration_sec - v.start_offset))
    }

    pub fn pending_join_time(&self) -> Option<f64> {
        self.next.as_ref().map(|n| n.join_at)
    }

    pub fn has_next_scheduled(&self) -> bool {
        self.next.is_some()
    }

    pub fn current_chunk_index(&self) -> Option<usize> {
        self.current.as_ref().map(|v| v.chunk_index)
    }

    pub fn is_paused(&self) -> bool {
        self.paused_position.is_some()
    }

    pub fn paused_position(&self) -> Option<f64> {
        self.paused_position
    }

    /// Timing basis for recomputing the in-chunk position off-thread.
    pub fn position_basis(&self) -> PlayerBasis {
        if let Some(position) = self.paused_position {
            return PlayerBasis::Paused { position };
        }
        match &self.current {
            Some(voice) if !self.stopped => PlayerBasis::Active {
                started_at: voice.started_at,
                start_offset: voice.start_offset,
                duration_sec: voice.duration_sec,
            },
            _ => PlayerBasis::Inactive,
        }
    }

    /// Drain sink notifications. Returns the chunk index of the current
    /// voice if it reached its natural end with no successor scheduled;
    /// the pre-join end of a superseded voice is absorbed here.
    pub fn poll_ended(&mut self) -> Option<usize> {
        let events = self.sink.take_events();
        let mut ended_chunk = None;
        for SinkEvent::VoiceEnded { voice } in events {
            let is_current = self.current.as_ref().is_some_and(|c| c.id == voice);
            if !is_current {
                continue;
            }
            if self.next.is_some() {
                // The old voice ran out inside the crossfade; the pending
                // transition owns what happens next.
                continue;
            }
            let current = self.current.take().expect("checked above");
            ended_chunk = Some(current.chunk_index);
        }
        ended_chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BufferSink, SharedBufferSink};
    use crate::source::AudioData;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stretchkit_foundation::ManualAudioClock;

    fn data(seconds: f64, value: f32) -> SharedAudioData {
        let sr = 1000u32;
        let len = (seconds * sr as f64).round() as usize;
        Arc::new(AudioData::new(vec![vec![value; len]], sr))
    }

    fn player() -> (Arc<ManualAudioClock>, SharedBufferSink, ChunkPlayer) {
        let clock = Arc::new(ManualAudioClock::new());
        let sink: SharedBufferSink = Arc::new(Mutex::new(BufferSink::new(clock.clone())));
        let player = ChunkPlayer::new(Box::new(sink.clone()), clock.clone(), 0.1);
        (clock, sink, player)
    }

    #[test]
    fn position_tracks_the_clock() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(0, data(8.0, 0.5), 0.25, false);
        assert!((player.position_in_chunk() - 0.25).abs() < 1e-9);
        clock.advance(2.0);
        assert!((player.position_in_chunk() - 2.25).abs() < 1e-9);
        assert!((player.remaining_in_chunk() - 5.75).abs() < 1e-9);
    }

    #[test]
    fn pause_captures_and_holds_position() {
        let (clock, sink, mut player) = player();
        player.play_chunk(0, data(8.0, 0.5), 0.0, false);
        clock.advance(3.0);
        player.pause();
        assert!(player.is_paused());
        clock.advance(5.0);
        assert!((player.position_in_chunk() - 3.0).abs() < 1e-9);
        assert_eq!(sink.lock().active_voice_count(), 0);
    }

    #[test]
    fn stop_resets_position_to_zero() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(0, data(8.0, 0.5), 0.0, false);
        clock.advance(3.0);
        player.stop();
        assert_eq!(player.position_in_chunk(), 0.0);
    }

    #[test]
    fn lookahead_fires_inside_the_threshold() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(0, data(8.0, 0.5), 0.0, false);
        assert!(!player.needs_next(3.0));
        clock.advance(5.5);
        assert!(player.needs_next(3.0));
    }

    #[test]
    fn scheduled_transition_promotes_to_current() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(0, data(8.0, 0.5), 0.0, false);
        let join = player.current_end_time().unwrap();
        player.schedule_next(1, data(8.1, 0.5), join, 0.1);
        assert!(player.has_next_scheduled());
        assert!(!player.needs_next(3.0));

        clock.set(join + 0.05);
        let promoted = player.promote_next();
        assert_eq!(promoted, Some(1));
        assert_eq!(player.current_chunk_index(), Some(1));
        // Position in the new chunk: now - (join - lead_in).
        assert!((player.position_in_chunk() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn natural_end_reports_the_chunk_once() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(4, data(2.0, 0.5), 0.0, false);
        clock.set(2.5);
        assert_eq!(player.poll_ended(), Some(4));
        assert_eq!(player.poll_ended(), None);
        assert_eq!(player.current_chunk_index(), None);
    }

    #[test]
    fn superseded_voice_end_is_absorbed() {
        let (clock, _sink, mut player) = player();
        player.play_chunk(0, data(2.0, 0.5), 0.0, false);
        let join = player.current_end_time().unwrap();
        player.schedule_next(1, data(2.0, 0.5), join, 0.1);
        // Old voice runs out at the join while the transition is pending.
        clock.set(join + 0.01);
        assert_eq!(player.poll_ended(), None);
        assert_eq!(player.promote_next(), Some(1));
    }

    #[test]
    fn crossfaded_join_renders_continuously() {
        // Constant-amplitude buffers with a linear crossfade must mix back
        // to the same constant across the join.
        let (clock, sink, mut player) = player();
        player.play_chunk(0, data(2.0, 0.5), 0.0, true);
        let join = player.current_end_time().unwrap();
        player.schedule_next(1, data(2.1, 0.5), join, 0.1);

        let _ = clock;
        let sr = 1000u32;
        // Render 200ms around the join.
        let from = join - 0.1;
        let out = sink.lock().render(from, 200, sr);
        for (i, sample) in out[0].iter().enumerate() {
            assert!(
                (sample - 0.5).abs() < 0.02,
                "discontinuity at sample {}: {}",
                i,
                sample
            );
        }
    }
}
