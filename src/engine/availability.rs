use chrono::{Days, NaiveDate, NaiveDateTime};
use futures::future::try_join_all;
use ulid::Ulid;

use crate::model::*;
use crate::time::{weekday_index, MinuteSpan, TimeOfDay};

use super::conflict::filter_conflicts;
use super::slots::generate_slots;
use super::{Engine, EngineError};

/// Whether `date` lies in the bookable window `[today, today + max_advance_days]`.
pub fn within_horizon(date: NaiveDate, today: NaiveDate, max_advance_days: u32) -> bool {
    if date < today {
        return false;
    }
    match today.checked_add_days(Days::new(u64::from(max_advance_days))) {
        Some(last) => date <= last,
        None => true,
    }
}

/// A business and one of its services, resolved once per request.
pub(super) struct BookingContext {
    pub business: BusinessSettings,
    pub service: ServiceSpec,
}

impl Engine {
    /// Every open slot for `service_id` on `date`, across all qualified staff
    /// or just `staff_id`, ordered by time.
    ///
    /// Unknown ids, unqualified or inactive staff, non-working days and dates
    /// outside the booking window all yield an empty list.
    pub async fn list_available_slots(
        &self,
        business_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let Some(ctx) = self.booking_context(business_id, service_id).await? else {
            return Ok(Vec::new());
        };
        let now = self.now();
        if !within_horizon(date, now.date(), ctx.business.max_advance_days) {
            return Ok(Vec::new());
        }

        let staff = self.resolve_staff(&ctx, staff_id).await?;
        let per_staff = try_join_all(staff.iter().map(|member| async {
            let times = self.open_times(&ctx, member.id, date, now).await?;
            Ok::<_, EngineError>(
                times
                    .into_iter()
                    .map(|time| Slot {
                        time,
                        staff_id: member.id,
                        staff_name: member.name.clone(),
                    })
                    .collect::<Vec<_>>(),
            )
        }))
        .await?;

        // Stable: equal times keep staff resolution order.
        let mut slots: Vec<Slot> = per_staff.into_iter().flatten().collect();
        slots.sort_by_key(|s| s.time);
        Ok(slots)
    }

    /// Open start times for one staff member on `date`: the working-interval
    /// grid minus everything blocked by confirmed reservations or already past.
    pub(super) async fn open_times(
        &self,
        ctx: &BookingContext,
        staff_id: Ulid,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        let interval = self
            .catalog
            .working_interval(staff_id, weekday_index(date))
            .await?;
        let duration = ctx.service.duration_minutes;
        let candidates = generate_slots(
            interval.as_ref(),
            duration,
            ctx.business.granularity_minutes,
        );
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let booked: Vec<MinuteSpan> = self
            .reservations
            .confirmed_reservations(staff_id, date)
            .await?
            .iter()
            .map(Reservation::span)
            .collect();
        Ok(filter_conflicts(
            candidates,
            duration,
            &booked,
            ctx.business.buffer_minutes,
            date,
            now,
        ))
    }

    /// `None` unless both exist and the service belongs to the business.
    pub(super) async fn booking_context(
        &self,
        business_id: Ulid,
        service_id: Ulid,
    ) -> Result<Option<BookingContext>, EngineError> {
        let Some(business) = self.catalog.business(business_id).await? else {
            return Ok(None);
        };
        let Some(service) = self.catalog.service(service_id).await? else {
            return Ok(None);
        };
        if service.business_id != business_id {
            return Ok(None);
        }
        Ok(Some(BookingContext { business, service }))
    }

    /// Active staff of the business qualified for the service. With `only`,
    /// at most that one member.
    pub(super) async fn resolve_staff(
        &self,
        ctx: &BookingContext,
        only: Option<Ulid>,
    ) -> Result<Vec<StaffMember>, EngineError> {
        let ids = match only {
            Some(id) => {
                if !self.catalog.is_qualified(id, ctx.service.id).await? {
                    return Ok(Vec::new());
                }
                vec![id]
            }
            None => self.catalog.qualified_staff(ctx.service.id).await?,
        };

        let mut staff = Vec::with_capacity(ids.len());
        for id in ids {
            match self.catalog.staff_member(id).await? {
                Some(member) if member.active && member.business_id == ctx.business.id => {
                    staff.push(member)
                }
                _ => {}
            }
        }
        Ok(staff)
    }
}
