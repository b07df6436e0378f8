use chrono::{NaiveDate, NaiveDateTime};

use crate::time::{MinuteSpan, Minutes, TimeOfDay};

/// Whether a candidate `[start, start + duration)` collides with an existing
/// reservation once that reservation is extended by `buffer`.
///
/// The buffer only trails the existing reservation. A candidate may end
/// exactly where an existing reservation starts.
pub fn is_blocked(
    start: TimeOfDay,
    duration: Minutes,
    existing: &MinuteSpan,
    buffer: Minutes,
) -> bool {
    MinuteSpan::starting_at(start, duration).overlaps(&existing.extend_end(buffer))
}

/// Keep the candidates that collide with none of `reservations` and, when
/// `date` is today, that start strictly after `now`. Dates before today keep
/// nothing. Order is preserved.
pub fn filter_conflicts(
    candidates: Vec<TimeOfDay>,
    duration: Minutes,
    reservations: &[MinuteSpan],
    buffer: Minutes,
    date: NaiveDate,
    now: NaiveDateTime,
) -> Vec<TimeOfDay> {
    let today = now.date();
    if date < today {
        return Vec::new();
    }
    let cutoff = (date == today).then(|| now.time());

    candidates
        .into_iter()
        .filter(|c| cutoff.is_none_or(|t| c.to_naive_time() > t))
        .filter(|&c| {
            !reservations
                .iter()
                .any(|existing| is_blocked(c, duration, existing, buffer))
        })
        .collect()
}
