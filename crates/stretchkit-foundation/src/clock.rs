//! Clock abstractions for test determinism.
//!
//! Two clock domains exist: wall time (`Instant`-based, used for debounce,
//! stall measurement, and conversion timing) and the audio output clock
//! (seconds as `f64`, owned by the playback sink's hardware scheduler).
//! Both have manual implementations so timing-dependent logic can be tested
//! without sleeping.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall-time source.
pub trait WallClock: Send + Sync {
    fn now(&self) -> Instant;
}

/// System wall clock.
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced wall clock for tests.
pub struct ManualClock {
    current: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

/// Audio-hardware clock, in seconds. Monotonic and independent of wall time;
/// every scheduled voice start time is expressed against this clock.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Audio clock derived from the process monotonic clock. Suitable for
/// software sinks; hardware-backed hosts supply their own implementation.
pub struct StreamClock {
    origin: Instant,
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl AudioClock for StreamClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually advanced audio clock for tests.
pub struct ManualAudioClock {
    seconds: Mutex<f64>,
}

impl Default for ManualAudioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualAudioClock {
    pub fn new() -> Self {
        Self {
            seconds: Mutex::new(0.0),
        }
    }

    pub fn advance(&self, seconds: f64) {
        *self.seconds.lock() += seconds;
    }

    pub fn set(&self, seconds: f64) {
        *self.seconds.lock() = seconds;
    }
}

impl AudioClock for ManualAudioClock {
    fn now(&self) -> f64 {
        *self.seconds.lock()
    }
}

pub type SharedWallClock = Arc<dyn WallClock>;
pub type SharedAudioClock = Arc<dyn AudioClock>;

pub fn system_clock() -> SharedWallClock {
    Arc::new(SystemClock)
}

pub fn stream_clock() -> SharedAudioClock {
    Arc::new(StreamClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn manual_audio_clock_advances() {
        let clock = ManualAudioClock::new();
        assert_eq!(clock.now(), 0.0);
        clock.advance(1.5);
        clock.advance(0.25);
        assert!((clock.now() - 1.75).abs() < 1e-12);
    }
}
