use crate::model::WorkingInterval;
use crate::time::{generate_candidates, Minutes, TimeOfDay};

/// Candidate start times for one staff member's working interval on the target
/// weekday: every `granularity` minutes from the interval start, each leaving
/// room for the full service `duration` before the interval ends.
///
/// No interval, an inactive one, or a zero duration means the staff member
/// does not work that slot day; that is an empty list, not an error.
pub fn generate_slots(
    interval: Option<&WorkingInterval>,
    duration: Minutes,
    granularity: Minutes,
) -> Vec<TimeOfDay> {
    match interval {
        Some(wi) if wi.active && duration > 0 => {
            generate_candidates(wi.start_time, wi.end_time, duration, granularity).collect()
        }
        _ => Vec::new(),
    }
}
