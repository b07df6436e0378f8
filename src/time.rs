use std::fmt;
use std::iter::FusedIterator;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Whole minutes. Durations, buffers and granularity are all expressed in this unit.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("invalid time of day {0:?}: expected HH:MM between 00:00 and 23:59")]
    InvalidFormat(String),
}

/// Wall-clock time of day at one-minute resolution, business-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self((hour * 60 + minute) as u16))
    }

    pub fn from_minutes(minutes: Minutes) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes as u16))
    }

    /// Minutes since midnight.
    pub fn minutes(self) -> Minutes {
        self.0 as Minutes
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_num_seconds_from_midnight_opt(self.minutes() * 60, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    /// Truncates seconds: 09:14:59 becomes 09:14.
    pub fn from_naive_time(t: NaiveTime) -> Self {
        Self((t.hour() * 60 + t.minute()) as u16)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_time_of_day(s)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_time_of_day(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse strict `HH:MM`. `9:00`, `09:00:00` and `24:00` are all rejected.
pub fn parse_time_of_day(s: &str) -> Result<TimeOfDay, TimeError> {
    let invalid = || TimeError::InvalidFormat(s.to_string());
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return Err(invalid());
    }
    let digit = |b: u8| b.is_ascii_digit().then(|| (b - b'0') as u32);
    let (h1, h2, m1, m2) = match (digit(bytes[0]), digit(bytes[1]), digit(bytes[3]), digit(bytes[4])) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return Err(invalid()),
    };
    TimeOfDay::from_hm(h1 * 10 + h2, m1 * 10 + m2).ok_or_else(invalid)
}

/// Add minutes within the same day. `None` if the result would cross midnight.
pub fn add_minutes(t: TimeOfDay, m: Minutes) -> Option<TimeOfDay> {
    t.minutes().checked_add(m).and_then(TimeOfDay::from_minutes)
}

/// Weekday index used by working intervals: 0 = Sunday … 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Lazy sequence `start, start+interval, start+2*interval, …`, each leaving at
/// least `step` minutes before `end`. Clone it to restart from the beginning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    next: Minutes,
    end: Minutes,
    step: Minutes,
    interval: Minutes,
}

pub fn generate_candidates(
    start: TimeOfDay,
    end: TimeOfDay,
    step: Minutes,
    interval: Minutes,
) -> Candidates {
    Candidates {
        next: start.minutes(),
        end: end.minutes(),
        step,
        interval,
    }
}

impl Iterator for Candidates {
    type Item = TimeOfDay;

    fn next(&mut self) -> Option<TimeOfDay> {
        if self.interval == 0 || self.next.saturating_add(self.step) > self.end {
            return None;
        }
        let current = TimeOfDay::from_minutes(self.next)?;
        self.next = self.next.saturating_add(self.interval);
        Some(current)
    }
}

impl FusedIterator for Candidates {}

/// Half-open minute interval `[start, end)`. `end` may reach past the last
/// minute of the day once a buffer is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteSpan {
    pub start: Minutes,
    pub end: Minutes,
}

impl MinuteSpan {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start <= end, "MinuteSpan start must not be after end");
        Self { start, end }
    }

    /// `[start, start + duration)`.
    pub fn starting_at(start: TimeOfDay, duration: Minutes) -> Self {
        Self::new(start.minutes(), start.minutes() + duration)
    }

    pub fn between(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self::new(start.minutes(), end.minutes())
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &MinuteSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The interval an existing reservation blocks: its own span plus the trailing buffer.
    pub fn extend_end(&self, buffer: Minutes) -> Self {
        Self::new(self.start, self.end + buffer)
    }
}
