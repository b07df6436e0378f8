use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::{MinuteSpan, Minutes, TimeOfDay};

/// Unix milliseconds. Only used for audit timestamps (`created_at`).
pub type Ms = i64;

pub const DEFAULT_GRANULARITY_MINUTES: Minutes = 15;
pub const DEFAULT_MAX_ADVANCE_DAYS: u32 = 60;

/// Business-level booking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessSettings {
    pub id: Ulid,
    pub name: Option<String>,
    /// Gap required after a reservation ends before the next may start.
    pub buffer_minutes: Minutes,
    /// How far ahead of today customers may book.
    pub max_advance_days: u32,
    /// Spacing between candidate start times.
    pub granularity_minutes: Minutes,
}

impl BusinessSettings {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            name: None,
            buffer_minutes: 0,
            max_advance_days: DEFAULT_MAX_ADVANCE_DAYS,
            granularity_minutes: DEFAULT_GRANULARITY_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_minutes: Minutes,
}

/// Recurring weekly availability window for one staff member and weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingInterval {
    pub staff_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }

    /// Only a confirmed reservation can move, and only out of `confirmed`.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        self == ReservationStatus::Confirmed && next != ReservationStatus::Confirmed
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            "no_show" => Ok(ReservationStatus::NoShow),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub contact: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub status: ReservationStatus,
    pub customer: CustomerInfo,
    pub created_at: Ms,
}

impl Reservation {
    pub fn span(&self) -> MinuteSpan {
        MinuteSpan::between(self.start_time, self.end_time)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// An offered booking instant. Advisory only until admission succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub time: TimeOfDay,
    pub staff_id: Ulid,
    pub staff_name: String,
}

/// The only recognised reservation filters. Anything else is rejected where the
/// filter is parsed, never silently ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationFilter {
    pub business_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn for_business(business_id: Ulid) -> Self {
        Self {
            business_id,
            staff_id: None,
            date: None,
            status: None,
        }
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        r.business_id == self.business_id
            && self.staff_id.is_none_or(|s| r.staff_id == s)
            && self.date.is_none_or(|d| r.date == d)
            && self.status.is_none_or(|s| r.status == s)
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessSaved(BusinessSettings),
    StaffSaved(StaffMember),
    ServiceSaved(ServiceSpec),
    WorkingIntervalSaved(WorkingInterval),
    QualificationGranted {
        staff_id: Ulid,
        service_id: Ulid,
    },
    QualificationRevoked {
        staff_id: Ulid,
        service_id: Ulid,
    },
    ReservationCommitted(Reservation),
    ReservationStatusChanged {
        id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        status: ReservationStatus,
    },
}
