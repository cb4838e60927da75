use std::time::Duration;

/// Delay before finalizing a gapless transition: the time until the
/// scheduled join plus a safety margin, floored at the margin so a join
/// already in the past still settles slightly later rather than instantly.
pub fn transition_delay(join_at: f64, now: f64, margin: Duration) -> Duration {
    let until_join = (join_at - now).max(0.0);
    Duration::from_secs_f64(until_join) + margin
}

/// Absolute clock time at which the transition should settle.
pub fn transition_deadline(join_at: f64, now: f64, margin: Duration) -> f64 {
    now + transition_delay(join_at, now, margin).as_secs_f64()
}
