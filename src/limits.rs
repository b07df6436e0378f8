use crate::time::Minutes;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;

pub const MAX_BUSINESSES: usize = 10_000;
pub const MAX_STAFF_PER_BUSINESS: usize = 1_000;
/// One reservation per minute of the day is already more than any real day book holds.
pub const MAX_RESERVATIONS_PER_DAY: usize = 1_440;

pub const MAX_SERVICE_DURATION_MINUTES: Minutes = 24 * 60;
pub const MAX_BUFFER_MINUTES: Minutes = 24 * 60;
pub const MIN_GRANULARITY_MINUTES: Minutes = 1;
pub const MAX_GRANULARITY_MINUTES: Minutes = 24 * 60;
pub const MAX_ADVANCE_DAYS: u32 = 3 * 366;

pub const MAX_CREDENTIALS: usize = 64;
