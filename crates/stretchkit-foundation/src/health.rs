use serde::{Deserialize, Serialize};

use crate::config::Tunables;

/// Four-band classification of how much converted output lies ahead of the
/// playhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    Healthy,
    Low,
    Critical,
    Empty,
}

impl BufferHealth {
    pub fn classify(ahead_seconds: f64, tunables: &Tunables) -> Self {
        if ahead_seconds >= tunables.buffer_healthy_sec {
            BufferHealth::Healthy
        } else if ahead_seconds >= tunables.buffer_low_sec {
            BufferHealth::Low
        } else if ahead_seconds >= tunables.buffer_critical_sec {
            BufferHealth::Critical
        } else {
            BufferHealth::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges() {
        let t = Tunables::default();
        assert_eq!(BufferHealth::classify(45.0, &t), BufferHealth::Healthy);
        assert_eq!(BufferHealth::classify(30.0, &t), BufferHealth::Healthy);
        assert_eq!(BufferHealth::classify(29.9, &t), BufferHealth::Low);
        assert_eq!(BufferHealth::classify(10.0, &t), BufferHealth::Low);
        assert_eq!(BufferHealth::classify(9.9, &t), BufferHealth::Critical);
        assert_eq!(BufferHealth::classify(3.0, &t), BufferHealth::Critical);
        assert_eq!(BufferHealth::classify(2.9, &t), BufferHealth::Empty);
        assert_eq!(BufferHealth::classify(0.0, &t), BufferHealth::Empty);
    }
}
