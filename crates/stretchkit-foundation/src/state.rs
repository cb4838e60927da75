use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Why the engine entered the buffering phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferingReason {
    Initial,
    Seek,
    TempoChange,
    Underrun,
}

/// Top-level playback phase. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "phase")]
pub enum EnginePhase {
    Waiting,
    Buffering { reason: BufferingReason },
    Playing,
    Paused,
    Ended,
}

impl EnginePhase {
    pub fn is_buffering(&self) -> bool {
        matches!(self, EnginePhase::Buffering { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::Ended)
    }
}

/// Tracks the engine phase and rejects transitions the state machine does
/// not define. Owned by the control task; snapshots are copied out for
/// cross-thread queries.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: EnginePhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: EnginePhase::Waiting,
        }
    }

    pub fn current(&self) -> EnginePhase {
        self.phase
    }

    pub fn transition(&mut self, new_phase: EnginePhase) -> Result<(), EngineError> {
        let valid = matches!(
            (&self.phase, &new_phase),
            (EnginePhase::Waiting, EnginePhase::Buffering { .. })
                | (EnginePhase::Waiting, EnginePhase::Ended)
                | (EnginePhase::Buffering { .. }, EnginePhase::Playing)
                | (EnginePhase::Buffering { .. }, EnginePhase::Buffering { .. })
                | (EnginePhase::Buffering { .. }, EnginePhase::Paused)
                | (EnginePhase::Buffering { .. }, EnginePhase::Ended)
                | (EnginePhase::Playing, EnginePhase::Buffering { .. })
                | (EnginePhase::Playing, EnginePhase::Paused)
                | (EnginePhase::Playing, EnginePhase::Ended)
                | (EnginePhase::Paused, EnginePhase::Playing)
                | (EnginePhase::Paused, EnginePhase::Buffering { .. })
                | (EnginePhase::Paused, EnginePhase::Ended)
        );

        if !valid {
            return Err(EngineError::InvalidTransition {
                from: self.phase,
                to: new_phase,
            });
        }

        tracing::info!("Phase transition: {:?} -> {:?}", self.phase, new_phase);
        self.phase = new_phase;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_playback_path() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.current(), EnginePhase::Waiting);
        tracker
            .transition(EnginePhase::Buffering {
                reason: BufferingReason::Initial,
            })
            .unwrap();
        tracker.transition(EnginePhase::Playing).unwrap();
        tracker
            .transition(EnginePhase::Buffering {
                reason: BufferingReason::Underrun,
            })
            .unwrap();
        tracker.transition(EnginePhase::Playing).unwrap();
        tracker.transition(EnginePhase::Ended).unwrap();
    }

    #[test]
    fn ended_is_terminal() {
        let mut tracker = PhaseTracker::new();
        tracker.transition(EnginePhase::Ended).unwrap();
        assert!(tracker.transition(EnginePhase::Playing).is_err());
        assert!(tracker
            .transition(EnginePhase::Buffering {
                reason: BufferingReason::Seek,
            })
            .is_err());
    }

    #[test]
    fn waiting_cannot_jump_to_playing() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.transition(EnginePhase::Playing).is_err());
    }

    #[test]
    fn pause_and_resume() {
        let mut tracker = PhaseTracker::new();
        tracker
            .transition(EnginePhase::Buffering {
                reason: BufferingReason::Initial,
            })
            .unwrap();
        tracker.transition(EnginePhase::Playing).unwrap();
        tracker.transition(EnginePhase::Paused).unwrap();
        tracker
            .transition(EnginePhase::Buffering {
                reason: BufferingReason::Underrun,
            })
            .unwrap();
    }
}
