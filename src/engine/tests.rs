use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::model::*;
use crate::notify::Notice;
use crate::repo::{CommitOutcome, RepoError};
use crate::time::{parse_time_of_day, Minutes, TimeOfDay};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(s: &str) -> TimeOfDay {
    parse_time_of_day(s).unwrap()
}

/// Tuesday.
fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 11, 3).unwrap()
}

fn at(d: NaiveDate, hm: &str) -> NaiveDateTime {
    d.and_time(t(hm).to_naive_time())
}

fn texts(slots: &[Slot]) -> Vec<String> {
    slots.iter().map(|s| s.time.to_string()).collect()
}

struct Salon {
    store: Arc<Store>,
    engine: Arc<Engine>,
    business: Ulid,
    mia: Ulid,
    cut: Ulid,
}

async fn add_staff(store: &Store, business: Ulid, name: &str, start: &str, end: &str) -> Ulid {
    let id = Ulid::new();
    store
        .save_staff(StaffMember {
            id,
            business_id: business,
            name: name.into(),
            active: true,
        })
        .await
        .unwrap();
    store
        .save_working_interval(WorkingInterval {
            staff_id: id,
            weekday: 2,
            start_time: t(start),
            end_time: t(end),
            active: true,
        })
        .await
        .unwrap();
    id
}

/// One business, buffer 10, granularity 15, a 30-minute "Cut" and Mia working
/// Tuesdays 09:00-12:00. The clock reads Monday 08:00 unless overridden.
async fn salon_at(name: &str, now: NaiveDateTime) -> Salon {
    let store = Arc::new(Store::open(test_wal_path(name)).unwrap());
    let business = Ulid::new();
    let mut settings = BusinessSettings::new(business);
    settings.name = Some("Salon".into());
    settings.buffer_minutes = 10;
    store.save_business(settings).await.unwrap();

    let cut = Ulid::new();
    store
        .save_service(ServiceSpec {
            id: cut,
            business_id: business,
            name: "Cut".into(),
            duration_minutes: 30,
        })
        .await
        .unwrap();
    let mia = add_staff(&store, business, "Mia", "09:00", "12:00").await;
    store.grant_qualification(mia, cut).await.unwrap();

    let engine = Engine::with_store(store.clone(), Arc::new(NotifyHub::new()))
        .with_clock(Arc::new(FixedClock(now)));
    Salon {
        store,
        engine: Arc::new(engine),
        business,
        mia,
        cut,
    }
}

async fn salon(name: &str) -> Salon {
    salon_at(name, at(date().pred_opt().unwrap(), "08:00")).await
}

fn request(s: &Salon, staff: Ulid, time: &str) -> BookingRequest {
    BookingRequest {
        business_id: s.business,
        staff_id: staff,
        service_id: s.cut,
        date: date(),
        time: t(time),
        customer: CustomerInfo {
            name: "Sam".into(),
            contact: "sam@example.com".into(),
            notes: None,
        },
    }
}

async fn book(s: &Salon, time: &str) -> BookingOutcome {
    s.engine.request_booking(request(s, s.mia, time)).await.unwrap()
}

async fn slots(s: &Salon) -> Vec<Slot> {
    s.engine
        .list_available_slots(s.business, s.cut, None, date())
        .await
        .unwrap()
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn empty_day_offers_full_grid() {
    let s = salon("empty_day.wal").await;
    let open = slots(&s).await;
    assert_eq!(
        texts(&open),
        vec![
            "09:00", "09:15", "09:30", "09:45", "10:00", "10:15", "10:30", "10:45", "11:00",
            "11:15", "11:30",
        ]
    );
    assert!(open.iter().all(|slot| slot.staff_id == s.mia && slot.staff_name == "Mia"));
}

#[tokio::test]
async fn booking_blocks_its_span_and_trailing_buffer() {
    let s = salon("blocks_buffer.wal").await;
    assert!(matches!(book(&s, "10:00").await, BookingOutcome::Committed(_)));

    assert_eq!(
        texts(&slots(&s).await),
        vec!["09:00", "09:15", "09:30", "10:45", "11:00", "11:15", "11:30"]
    );
}

#[tokio::test]
async fn slots_merge_across_staff_in_time_order() {
    let s = salon("merge_staff.wal").await;
    let leo = add_staff(&s.store, s.business, "Leo", "10:30", "11:30").await;
    s.store.grant_qualification(leo, s.cut).await.unwrap();

    let open = slots(&s).await;
    assert_eq!(open.len(), 11 + 3);
    for pair in open.windows(2) {
        assert!(pair[0].time <= pair[1].time);
    }
    let leo_times: Vec<String> = open
        .iter()
        .filter(|slot| slot.staff_id == leo)
        .map(|slot| slot.time.to_string())
        .collect();
    assert_eq!(leo_times, vec!["10:30", "10:45", "11:00"]);

    let only_leo = s
        .engine
        .list_available_slots(s.business, s.cut, Some(leo), date())
        .await
        .unwrap();
    assert_eq!(only_leo.len(), 3);
}

#[tokio::test]
async fn unknown_or_unqualified_yield_nothing() {
    let s = salon("unknown_ids.wal").await;
    let e = &s.engine;
    assert!(e.list_available_slots(Ulid::new(), s.cut, None, date()).await.unwrap().is_empty());
    assert!(e.list_available_slots(s.business, Ulid::new(), None, date()).await.unwrap().is_empty());
    assert!(e
        .list_available_slots(s.business, s.cut, Some(Ulid::new()), date())
        .await
        .unwrap()
        .is_empty());

    let unqualified = add_staff(&s.store, s.business, "Ivy", "09:00", "17:00").await;
    assert!(e
        .list_available_slots(s.business, s.cut, Some(unqualified), date())
        .await
        .unwrap()
        .is_empty());

    // Mia doesn't work Wednesdays.
    let wednesday = date().succ_opt().unwrap();
    assert!(e.list_available_slots(s.business, s.cut, None, wednesday).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_staff_offer_nothing() {
    let s = salon("inactive_staff.wal").await;
    s.store
        .save_staff(StaffMember {
            id: s.mia,
            business_id: s.business,
            name: "Mia".into(),
            active: false,
        })
        .await
        .unwrap();
    assert!(slots(&s).await.is_empty());
    assert_eq!(
        book(&s, "09:00").await,
        BookingOutcome::Rejected(RejectReason::NotQualified)
    );
}

#[tokio::test]
async fn service_of_another_business_is_not_offered() {
    let s = salon("foreign_service.wal").await;
    let other = Ulid::new();
    s.store.save_business(BusinessSettings::new(other)).await.unwrap();
    assert!(s
        .engine
        .list_available_slots(other, s.cut, None, date())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn today_hides_started_slots() {
    let s = salon_at("today.wal", at(date(), "10:05")).await;
    assert_eq!(
        texts(&slots(&s).await),
        vec!["10:15", "10:30", "10:45", "11:00", "11:15", "11:30"]
    );
    assert_eq!(
        book(&s, "10:00").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );
}

#[tokio::test]
async fn outside_booking_window() {
    let tuesday_after = date().checked_add_days(chrono::Days::new(7)).unwrap();
    // Today is after the target date.
    let s = salon_at("past_date.wal", at(tuesday_after, "08:00")).await;
    assert!(slots(&s).await.is_empty());
    assert_eq!(
        book(&s, "09:00").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );

    // Today is more than max_advance_days before the target date.
    let far = date().checked_sub_days(chrono::Days::new(61)).unwrap();
    let s = salon_at("beyond_horizon.wal", at(far, "08:00")).await;
    assert!(slots(&s).await.is_empty());

    let edge = date().checked_sub_days(chrono::Days::new(60)).unwrap();
    let s = salon_at("horizon_edge.wal", at(edge, "08:00")).await;
    assert_eq!(slots(&s).await.len(), 11);
}

#[test]
fn horizon_bounds() {
    let today = date();
    assert!(within_horizon(today, today, 0));
    assert!(!within_horizon(today.succ_opt().unwrap(), today, 0));
    assert!(!within_horizon(today.pred_opt().unwrap(), today, 60));
}

#[tokio::test]
async fn granularity_comes_from_business() {
    let s = salon("granularity.wal").await;
    let mut settings = BusinessSettings::new(s.business);
    settings.buffer_minutes = 10;
    settings.granularity_minutes = 30;
    s.store.save_business(settings).await.unwrap();
    assert_eq!(
        texts(&slots(&s).await),
        vec!["09:00", "09:30", "10:00", "10:30", "11:00", "11:30"]
    );
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn committed_reservation_has_service_span() {
    let s = salon("commit_span.wal").await;
    let BookingOutcome::Committed(r) = book(&s, "09:15").await else {
        panic!("expected commit");
    };
    assert_eq!(r.start_time, t("09:15"));
    assert_eq!(r.end_time, t("09:45"));
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.business_id, s.business);
    assert_eq!(assert_ok!(s.engine.reservation(r.id).await), r);
}

#[tokio::test]
async fn rejections_carry_reason() {
    let s = salon("reject_reasons.wal").await;

    let mut bad = request(&s, s.mia, "09:00");
    bad.customer.name = "   ".into();
    assert!(matches!(
        s.engine.request_booking(bad).await.unwrap(),
        BookingOutcome::Rejected(RejectReason::InvalidInput(_))
    ));

    let unqualified = add_staff(&s.store, s.business, "Ivy", "09:00", "17:00").await;
    assert_eq!(
        s.engine
            .request_booking(request(&s, unqualified, "09:00"))
            .await
            .unwrap(),
        BookingOutcome::Rejected(RejectReason::NotQualified)
    );

    // Off the grid.
    assert_eq!(
        book(&s, "09:07").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );
    // Would run past the end of the working interval.
    assert_eq!(
        book(&s, "11:45").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );
}

#[tokio::test]
async fn same_slot_twice_commits_once() {
    let s = salon("same_slot_twice.wal").await;
    assert!(matches!(book(&s, "10:00").await, BookingOutcome::Committed(_)));
    assert_eq!(
        book(&s, "10:00").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );
    // Inside the trailing buffer of the first booking.
    assert_eq!(
        book(&s, "10:30").await,
        BookingOutcome::Rejected(RejectReason::SlotUnavailable)
    );
    // Ends exactly where the first begins.
    assert!(matches!(book(&s, "09:30").await, BookingOutcome::Committed(_)));
}

#[tokio::test]
async fn every_offered_slot_is_bookable() {
    let s = salon("offered_bookable.wal").await;
    // Each fresh day: pick any listed slot and it commits.
    for slot in slots(&s).await {
        let fresh = salon(&format!("offered_{}.wal", slot.time.minutes())).await;
        let outcome = book(&fresh, &slot.time.to_string()).await;
        assert!(matches!(outcome, BookingOutcome::Committed(_)), "{}", slot.time);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_commit_exactly_once() {
    let s = salon("concurrent_same.wal").await;
    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = s.engine.clone();
        let req = request(&s, s.mia, "10:00");
        handles.push(tokio::spawn(async move { engine.request_booking(req).await }));
    }

    let mut committed = 0;
    for h in handles {
        match h.await.unwrap().unwrap() {
            BookingOutcome::Committed(_) => committed += 1,
            BookingOutcome::Rejected(reason) => assert_eq!(reason, RejectReason::SlotUnavailable),
        }
    }
    assert_eq!(committed, 1);
    let stored = s.store.confirmed_reservations(s.mia, date()).await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_commit_once() {
    let s = salon("concurrent_overlap.wal").await;
    let mut notices = s.engine.notify().subscribe(s.business);
    let mut handles = Vec::new();
    for time in ["10:00", "10:15", "10:00", "10:15", "09:45", "10:30", "10:45", "09:30"] {
        let engine = s.engine.clone();
        let req = request(&s, s.mia, time);
        handles.push(tokio::spawn(async move { engine.request_booking(req).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let committed = commit_order(&s, &mut notices).await;
    assert!(!committed.is_empty());
    assert_no_collisions(&committed, 10);
}

/// Confirmed reservations in the order they committed. Confirmation notices
/// are sent while the admission lock is held, so for one staff member and
/// date their order is the commit order.
async fn commit_order(
    s: &Salon,
    notices: &mut tokio::sync::broadcast::Receiver<Notice>,
) -> Vec<Reservation> {
    let mut ordered = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::ReservationConfirmed { reservation_id, .. } = notice {
            ordered.push(s.store.reservation(reservation_id).await.unwrap().unwrap());
        }
    }
    let stored = s.store.confirmed_reservations(s.mia, date()).await.unwrap();
    assert_eq!(ordered.len(), stored.len(), "every commit announced once");
    ordered
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_staff_do_not_contend() {
    let s = salon("different_staff.wal").await;
    let leo = add_staff(&s.store, s.business, "Leo", "09:00", "12:00").await;
    s.store.grant_qualification(leo, s.cut).await.unwrap();

    let a = tokio::spawn({
        let engine = s.engine.clone();
        let req = request(&s, s.mia, "10:00");
        async move { engine.request_booking(req).await }
    });
    let b = tokio::spawn({
        let engine = s.engine.clone();
        let req = request(&s, leo, "10:00");
        async move { engine.request_booking(req).await }
    });
    assert!(matches!(a.await.unwrap().unwrap(), BookingOutcome::Committed(_)));
    assert!(matches!(b.await.unwrap().unwrap(), BookingOutcome::Committed(_)));
}

#[tokio::test]
async fn admission_locks_are_released() {
    let s = salon("locks_released.wal").await;
    book(&s, "09:00").await;
    book(&s, "09:00").await;
    assert!(s.engine.admission_locks.held.is_empty());
}

/// Raw spans never overlap, and each later commit clears the trailing
/// buffer of every earlier one.
fn assert_no_collisions(committed_in_order: &[Reservation], buffer: u32) {
    for (i, a) in committed_in_order.iter().enumerate() {
        for b in &committed_in_order[i + 1..] {
            assert!(!a.span().overlaps(&b.span()), "{a:?} overlaps {b:?}");
            assert!(!b.span().overlaps(&a.span().extend_end(buffer)));
        }
    }
}

/// Reservation storage whose commits always fail; reads go to the store.
struct FailingCommits(Arc<Store>);

#[async_trait::async_trait]
impl ReservationRepository for FailingCommits {
    async fn confirmed_reservations(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, RepoError> {
        self.0.confirmed_reservations(staff_id, date).await
    }

    async fn try_commit(
        &self,
        _candidate: Reservation,
        _buffer: Minutes,
    ) -> Result<CommitOutcome, RepoError> {
        Err(RepoError::Storage("disk unavailable".into()))
    }

    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, RepoError> {
        self.0.reservation(id).await
    }

    async fn update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        next: ReservationStatus,
    ) -> Result<Option<Reservation>, RepoError> {
        self.0.update_status(id, expected, next).await
    }

    async fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, RepoError> {
        self.0.list(filter).await
    }
}

#[tokio::test]
async fn storage_failure_commits_nothing() {
    let s = salon("storage_failure.wal").await;
    let engine = Engine::new(
        s.store.clone(),
        Arc::new(FailingCommits(s.store.clone())),
        Arc::new(NotifyHub::new()),
    )
    .with_clock(Arc::new(FixedClock(at(date().pred_opt().unwrap(), "08:00"))));
    let mut listener = engine.notify().subscribe(s.business);
    let before = engine
        .list_available_slots(s.business, s.cut, None, date())
        .await
        .unwrap();

    let err = assert_err!(engine.request_booking(request(&s, s.mia, "10:00")).await);
    assert!(matches!(err, EngineError::Repository(RepoError::Storage(_))));
    assert!(err.is_retryable());

    assert!(s.store.confirmed_reservations(s.mia, date()).await.unwrap().is_empty());
    let after = engine
        .list_available_slots(s.business, s.cut, None, date())
        .await
        .unwrap();
    assert_eq!(after, before);
    assert!(listener.try_recv().is_err());
    assert!(engine.admission_locks.held.is_empty());

    // The same request goes through once storage is healthy.
    assert!(matches!(book(&s, "10:00").await, BookingOutcome::Committed(_)));
}

// ── Status transitions ───────────────────────────────────

#[tokio::test]
async fn cancel_frees_the_slot() {
    let s = salon("cancel_frees.wal").await;
    let mut listener = s.engine.notify().subscribe(s.business);

    let BookingOutcome::Committed(r) = book(&s, "10:00").await else {
        panic!("expected commit");
    };
    assert_eq!(listener.recv().await.unwrap(), Notice::confirmed(&r));
    assert!(!texts(&slots(&s).await).contains(&"10:00".to_string()));

    let cancelled = assert_ok!(s.engine.cancel_reservation(r.id).await);
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(listener.recv().await.unwrap(), Notice::status_changed(&cancelled));

    assert_eq!(slots(&s).await.len(), 11);
    assert!(matches!(book(&s, "10:00").await, BookingOutcome::Committed(_)));
}

#[tokio::test]
async fn final_states_do_not_move() {
    let s = salon("final_states.wal").await;
    let BookingOutcome::Committed(r) = book(&s, "09:00").await else {
        panic!("expected commit");
    };
    assert_ok!(s.engine.complete_reservation(r.id).await);

    let err = assert_err!(s.engine.cancel_reservation(r.id).await);
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: ReservationStatus::Completed,
            to: ReservationStatus::Cancelled,
        }
    ));
    assert!(matches!(
        s.engine.transition(r.id, ReservationStatus::Confirmed).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        s.engine.mark_no_show(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn no_show_keeps_record_and_frees_time() {
    let s = salon("no_show.wal").await;
    let BookingOutcome::Committed(r) = book(&s, "09:00").await else {
        panic!("expected commit");
    };
    assert_ok!(s.engine.mark_no_show(r.id).await);

    let mut filter = ReservationFilter::for_business(s.business);
    filter.status = Some(ReservationStatus::NoShow);
    let listed = s.engine.list_reservations(&filter).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, r.id);
    assert!(texts(&slots(&s).await).contains(&"09:00".to_string()));
}

// ── Properties ───────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Whatever sequence of requests arrives, confirmed reservations never
        /// collide, and a slot listed right before a request commits.
        #[test]
        fn admitted_reservations_never_collide(
            picks in proptest::collection::vec(0u32..12, 1..20),
            buffer in 0u32..45,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let s = salon(&format!("prop_{}.wal", Ulid::new())).await;
                let mut settings = BusinessSettings::new(s.business);
                settings.buffer_minutes = buffer;
                s.store.save_business(settings).await.unwrap();

                let mut committed = Vec::new();
                for pick in picks {
                    let time = TimeOfDay::from_minutes(9 * 60 + pick * 15).unwrap();
                    let listed = slots(&s).await.iter().any(|slot| slot.time == time);
                    let outcome = book(&s, &time.to_string()).await;
                    match outcome {
                        BookingOutcome::Committed(r) => {
                            assert!(listed, "{time} committed without being offered");
                            committed.push(r);
                        }
                        BookingOutcome::Rejected(reason) => {
                            assert!(!listed, "{time} offered but rejected");
                            assert_eq!(reason, RejectReason::SlotUnavailable);
                        }
                    }
                }

                assert_no_collisions(&committed, buffer);
            });
        }

        /// Requests racing on a multi-thread runtime for random times still
        /// leave a collision-free book, judged in commit order.
        #[test]
        fn concurrent_admissions_never_collide(
            picks in proptest::collection::vec(0u32..11, 2..24),
            buffer in 0u32..45,
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let s = salon(&format!("prop_race_{}.wal", Ulid::new())).await;
                let mut settings = BusinessSettings::new(s.business);
                settings.buffer_minutes = buffer;
                s.store.save_business(settings).await.unwrap();
                let mut notices = s.engine.notify().subscribe(s.business);

                let handles: Vec<_> = picks
                    .iter()
                    .map(|pick| {
                        let time = TimeOfDay::from_minutes(9 * 60 + pick * 15).unwrap();
                        let engine = s.engine.clone();
                        let req = request(&s, s.mia, &time.to_string());
                        tokio::spawn(async move { engine.request_booking(req).await })
                    })
                    .collect();
                let mut committed_count = 0;
                for h in handles {
                    match h.await.unwrap().unwrap() {
                        BookingOutcome::Committed(_) => committed_count += 1,
                        BookingOutcome::Rejected(reason) => {
                            assert_eq!(reason, RejectReason::SlotUnavailable)
                        }
                    }
                }

                let committed = commit_order(&s, &mut notices).await;
                assert!(committed_count >= 1);
                assert_eq!(committed.len(), committed_count);
                assert_no_collisions(&committed, buffer);
            });
        }
    }
}
