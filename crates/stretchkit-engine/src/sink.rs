use std::sync::Arc;

use stretchkit_foundation::SharedAudioClock;

use crate::source::SharedAudioData;

pub type VoiceId = u64;

/// A linear gain ramp in audio-clock time. Before `begin` the gain is
/// `from`; after `begin + duration` it is `to`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fade {
    pub begin: f64,
    pub duration: f64,
    pub from: f32,
    pub to: f32,
}

impl Fade {
    pub fn gain_at(&self, time: f64) -> f32 {
        if self.duration <= 0.0 || time >= self.begin + self.duration {
            return self.to;
        }
        if time <= self.begin {
            return self.from;
        }
        let t = ((time - self.begin) / self.duration) as f32;
        self.from + (self.to - self.from) * t
    }
}

/// One buffer submitted for playback at a clock-based start time.
#[derive(Debug, Clone)]
pub struct VoiceSpec {
    pub buffer: SharedAudioData,
    /// Audio-clock time at which the first sample sounds. Values at or
    /// before "now" start immediately.
    pub start_at: f64,
    /// Offset into the buffer, in seconds.
    pub offset_sec: f64,
    /// Optional fade applied from the start of the voice.
    pub fade_in: Option<Fade>,
}

/// Notifications drained from the sink by the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    VoiceEnded { voice: VoiceId },
}

/// A passive DSP node in the output chain. Stages process buffers in
/// place, in order; the last stage feeds the terminal sink.
pub trait OutputStage: Send {
    fn process(&mut self, channels: &mut [Vec<f32>], sample_rate: u32);
}

/// Terminal audio output owned by the host. The engine schedules voices
/// against the sink's hardware clock and drains ended notifications at its
/// tick cadence; everything else about rendering is the sink's business.
pub trait PlaybackSink: Send {
    fn install_chain(&mut self, chain: Vec<Box<dyn OutputStage>>);
    fn start_voice(&mut self, spec: VoiceSpec) -> VoiceId;
    /// Apply an additional gain ramp to a live voice. Ramps compose
    /// multiplicatively.
    fn apply_fade(&mut self, voice: VoiceId, fade: Fade);
    fn stop_voice(&mut self, voice: VoiceId);
    fn take_events(&mut self) -> Vec<SinkEvent>;
}

struct Voice {
    id: VoiceId,
    buffer: SharedAudioData,
    start_at: f64,
    offset_sec: f64,
    fades: Vec<Fade>,
    stopped_at: Option<f64>,
    ended_reported: bool,
}

impl Voice {
    fn playable_sec(&self) -> f64 {
        (self.buffer.duration_sec() - self.offset_sec).max(0.0)
    }

    fn end_time(&self) -> f64 {
        let natural = self.start_at + self.playable_sec();
        match self.stopped_at {
            Some(stop) => natural.min(stop),
            None => natural,
        }
    }

    fn gain_at(&self, time: f64) -> f32 {
        self.fades.iter().map(|f| f.gain_at(time)).product()
    }
}

/// Software sink driven by any [`AudioClock`]: voices are mixed
/// sample-accurately on demand. Serves offline rendering and deterministic
/// tests; hardware-backed hosts provide their own implementation of
/// [`PlaybackSink`].
///
/// [`AudioClock`]: stretchkit_foundation::AudioClock
pub struct BufferSink {
    clock: SharedAudioClock,
    chain: Vec<Box<dyn OutputStage>>,
    voices: Vec<Voice>,
    next_id: VoiceId,
}

impl BufferSink {
    pub fn new(clock: SharedAudioClock) -> Self {
        Self {
            clock,
            chain: Vec::new(),
            voices: Vec::new(),
            next_id: 0,
        }
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.stopped_at.is_none() && !v.ended_reported)
            .count()
    }

    /// Mix every voice over `[from, from + len/sr)` and run the output
    /// chain. `sample_rate` must match the submitted buffers.
    pub fn render(&mut self, from: f64, len: usize, sample_rate: u32) -> Vec<Vec<f32>> {
        let channel_count = self
            .voices
            .iter()
            .map(|v| v.buffer.channels.len())
            .max()
            .unwrap_or(1);
        let mut out = vec![vec![0.0f32; len]; channel_count];

        for voice in &self.voices {
            if voice.buffer.channels.is_empty() {
                continue;
            }
            let sr = voice.buffer.sample_rate as f64;
            for i in 0..len {
                let t = from + i as f64 / sample_rate as f64;
                if t < voice.start_at || t >= voice.end_time() {
                    continue;
                }
                let src_pos = ((t - voice.start_at + voice.offset_sec) * sr).round() as usize;
                let gain = voice.gain_at(t);
                for (ch, out_ch) in out.iter_mut().enumerate() {
                    let src_ch = &voice.buffer.channels[ch.min(voice.buffer.channels.len() - 1)];
                    if src_pos < src_ch.len() {
                        out_ch[i] += src_ch[src_pos] * gain;
                    }
                }
            }
        }

        for stage in &mut self.chain {
            stage.process(&mut out, sample_rate);
        }
        out
    }
}

impl PlaybackSink for BufferSink {
    fn install_chain(&mut self, chain: Vec<Box<dyn OutputStage>>) {
        self.chain = chain;
    }

    fn start_voice(&mut self, spec: VoiceSpec) -> VoiceId {
        self.next_id += 1;
        let id = self.next_id;
        let start_at = spec.start_at.max(self.clock.now());
        self.voices.push(Voice {
            id,
            buffer: spec.buffer,
            start_at,
            offset_sec: spec.offset_sec,
            fades: spec.fade_in.into_iter().collect(),
            stopped_at: None,
            ended_reported: false,
        });
        id
    }

    fn apply_fade(&mut self, voice: VoiceId, fade: Fade) {
        if let Some(v) = self.voices.iter_mut().find(|v| v.id == voice) {
            v.fades.push(fade);
        }
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        let now = self.clock.now();
        if let Some(v) = self.voices.iter_mut().find(|v| v.id == voice) {
            if v.stopped_at.is_none() {
                v.stopped_at = Some(now);
            }
            // Stopped voices end silently, without an ended notification.
            v.ended_reported = true;
        }
    }

    fn take_events(&mut self) -> Vec<SinkEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();
        for voice in &mut self.voices {
            if !voice.ended_reported && voice.stopped_at.is_none() && now >= voice.end_time() {
                voice.ended_reported = true;
                events.push(SinkEvent::VoiceEnded { voice: voice.id });
            }
        }
        // Keep finished voices around only as long as a render might still
        // touch their tail.
        self.voices
            .retain(|v| !(v.ended_reported && now > v.end_time() + 1.0));
        events
    }
}

/// Shared handle to a [`BufferSink`], letting a host keep rendering access
/// while the engine owns the sink as a trait object.
pub type SharedBufferSink = Arc<parking_lot::Mutex<BufferSink>>;

impl PlaybackSink for SharedBufferSink {
    fn install_chain(&mut self, chain: Vec<Box<dyn OutputStage>>) {
        self.lock().install_chain(chain);
    }

    fn start_voice(&mut self, spec: VoiceSpec) -> VoiceId {
        self.lock().start_voice(spec)
    }

    fn apply_fade(&mut self, voice: VoiceId, fade: Fade) {
        self.lock().apply_fade(voice, fade);
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.lock().stop_voice(voice);
    }

    fn take_events(&mut self) -> Vec<SinkEvent> {
        self.lock().take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AudioData;
    use stretchkit_foundation::ManualAudioClock;

    fn data(len: usize, value: f32, sr: u32) -> SharedAudioData {
        Arc::new(AudioData::new(vec![vec![value; len]], sr))
    }

    fn sink() -> (Arc<ManualAudioClock>, BufferSink) {
        let clock = Arc::new(ManualAudioClock::new());
        let sink = BufferSink::new(clock.clone());
        (clock, sink)
    }

    #[test]
    fn voice_ends_after_its_playable_length() {
        let (clock, mut sink) = sink();
        let id = sink.start_voice(VoiceSpec {
            buffer: data(1000, 0.5, 1000), // 1 second
            start_at: 0.0,
            offset_sec: 0.25,
            fade_in: None,
        });
        clock.set(0.5);
        assert!(sink.take_events().is_empty());
        clock.set(0.76);
        assert_eq!(sink.take_events(), vec![SinkEvent::VoiceEnded { voice: id }]);
        // Reported once only.
        assert!(sink.take_events().is_empty());
    }

    #[test]
    fn stopped_voice_reports_nothing() {
        let (clock, mut sink) = sink();
        let id = sink.start_voice(VoiceSpec {
            buffer: data(1000, 0.5, 1000),
            start_at: 0.0,
            offset_sec: 0.0,
            fade_in: None,
        });
        sink.stop_voice(id);
        clock.set(2.0);
        assert!(sink.take_events().is_empty());
    }

    #[test]
    fn render_mixes_with_fades() {
        let (clock, mut sink) = sink();
        let id = sink.start_voice(VoiceSpec {
            buffer: data(1000, 1.0, 1000),
            start_at: 0.0,
            offset_sec: 0.0,
            fade_in: Some(Fade {
                begin: 0.0,
                duration: 0.1,
                from: 0.0,
                to: 1.0,
            }),
        });
        // Fade the same voice back out over [0.5, 0.6].
        sink.apply_fade(
            id,
            Fade {
                begin: 0.5,
                duration: 0.1,
                from: 1.0,
                to: 0.0,
            },
        );
        let _ = clock; // render reads explicit times

        let out = sink.render(0.0, 1000, 1000);
        assert!(out[0][0].abs() < 1e-6); // fade-in starts silent
        assert!((out[0][300] - 1.0).abs() < 1e-4); // plateau
        assert!(out[0][700].abs() < 1e-6); // faded out
    }

    #[test]
    fn scheduled_voice_waits_for_its_start_time() {
        let (_clock, mut sink) = sink();
        sink.start_voice(VoiceSpec {
            buffer: data(1000, 1.0, 1000),
            start_at: 0.5,
            offset_sec: 0.0,
            fade_in: None,
        });
        let out = sink.render(0.0, 1000, 1000);
        assert_eq!(out[0][100], 0.0);
        assert!((out[0][600] - 1.0).abs() < 1e-6);
    }

    struct HalfGain;
    impl OutputStage for HalfGain {
        fn process(&mut self, channels: &mut [Vec<f32>], _sample_rate: u32) {
            for ch in channels {
                for s in ch.iter_mut() {
                    *s *= 0.5;
                }
            }
        }
    }

    #[test]
    fn output_chain_processes_the_mix() {
        let (_clock, mut sink) = sink();
        sink.install_chain(vec![Box::new(HalfGain)]);
        sink.start_voice(VoiceSpec {
            buffer: data(100, 0.8, 1000),
            start_at: 0.0,
            offset_sec: 0.0,
            fade_in: None,
        });
        let out = sink.render(0.0, 50, 1000);
        assert!((out[0][10] - 0.4).abs() < 1e-6);
    }
}
