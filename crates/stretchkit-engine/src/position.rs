use stretchkit_foundation::EnginePhase;

/// Inputs for the phase-aware position mapping. All times are seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionQuery {
    pub phase: EnginePhase,
    pub duration: f64,
    /// Initial start offset, reported while nothing has played yet.
    pub start_offset: f64,
    pub buffering_resume_position: Option<f64>,
    pub tempo: f32,
    pub crossfade_sec: f64,
    /// Nominal start of the current chunk in source seconds, when a chunk
    /// is current.
    pub chunk_nominal_start_sec: Option<f64>,
    /// Whether the current chunk's output carries a crossfade lead-in.
    pub chunk_has_lead_in: bool,
    /// Output-time position within the current chunk buffer.
    pub pos_in_chunk: f64,
}

/// Map playback state to a position in the original source.
///
/// The crossfade lead-in of an interior chunk sits before its nominal
/// start in output time, so it is subtracted before scaling by tempo.
pub fn current_position(query: &PositionQuery) -> f64 {
    match query.phase {
        EnginePhase::Ended => query.duration,
        EnginePhase::Waiting => query.start_offset,
        EnginePhase::Buffering { .. } if query.buffering_resume_position.is_some() => {
            query.buffering_resume_position.unwrap_or(0.0)
        }
        _ => {
            let Some(nominal_start_sec) = query.chunk_nominal_start_sec else {
                return query.start_offset.min(query.duration);
            };
            let adjusted = if query.chunk_has_lead_in {
                query.pos_in_chunk - query.crossfade_sec
            } else {
                query.pos_in_chunk
            };
            let position = nominal_start_sec + adjusted.max(0.0) * query.tempo as f64;
            position.clamp(0.0, query.duration)
        }
    }
}
