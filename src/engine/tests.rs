use std::path::PathBuf;
use std::time::Duration;

use futures::FutureExt;
use tokio_test::{assert_err, assert_ok};

use super::*;
use super::conflict::now_ms;
use crate::notify::Notice;
use crate::waitlist::{WaitTarget, WaitlistEntry};

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;

// A Monday, far enough ahead that nothing here is in the past.
const T0: Ms = 1_704_067_200_000 + 520 * 7 * DAY_MS;

fn test_ledger_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("wardsched_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_at(path: &PathBuf) -> Arc<Engine> {
    Arc::new(Engine::open(EngineConfig::new(path), Arc::new(NotifyHub::new())).unwrap())
}

fn open_engine(name: &str) -> Arc<Engine> {
    open_at(&test_ledger_path(name))
}

async fn engine_with(name: &str, spec: ResourceSpec) -> (Arc<Engine>, Ulid) {
    let engine = open_engine(name);
    let rid = Ulid::new();
    engine.register_resource(rid, spec).await.unwrap();
    (engine, rid)
}

fn routine(rid: Ulid, start: Ms, end: Ms, who: &str) -> BookingRequest {
    BookingRequest::new(rid, start, end, who, Priority::Routine)
}

fn emergency(rid: Ulid, start: Ms, end: Ms, who: &str) -> BookingRequest {
    BookingRequest::new(rid, start, end, who, Priority::Emergency)
}

// ── Resources ────────────────────────────────────────────

#[tokio::test]
async fn register_and_describe_resource() {
    let (engine, rid) = engine_with(
        "register.ledger",
        ResourceSpec::new(ResourceKind::Bed).named("Ward 4, bed 12").buffer_after(30 * M),
    )
    .await;

    let info = engine.resource_info(rid).await.unwrap();
    assert_eq!(info.kind, ResourceKind::Bed);
    assert_eq!(info.name.as_deref(), Some("Ward 4, bed 12"));
    assert_eq!(info.capacity, 1);
    assert_eq!(info.buffer_after, Some(30 * M));
    assert!(info.active);

    let err = engine
        .register_resource(rid, ResourceSpec::new(ResourceKind::Bed))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(rid));
    assert_eq!(engine.list_resources().await.unwrap().len(), 1);
}

#[tokio::test]
async fn shared_capacity_only_for_providers() {
    let engine = open_engine("shared_capacity.ledger");
    let err = engine
        .register_resource(Ulid::new(), ResourceSpec::new(ResourceKind::Theatre).capacity(2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));

    assert_ok!(
        engine
            .register_resource(Ulid::new(), ResourceSpec::new(ResourceKind::Provider).capacity(3))
            .await
    );
    assert_err!(
        engine
            .register_resource(Ulid::new(), ResourceSpec::new(ResourceKind::Provider).capacity(0))
            .await
    );
}

#[tokio::test]
async fn unknown_resource_is_rejected() {
    let engine = open_engine("unknown_resource.ledger");
    let rid = Ulid::new();
    let err = engine
        .request_booking(routine(rid, T0, T0 + H, "patient-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResource(id, _) if id == rid));
    assert!(engine.query_availability(rid, T0, T0 + H, 0).await.is_err());
}

#[tokio::test]
async fn deactivated_resource_takes_no_bookings() {
    let (engine, rid) = engine_with("deactivate.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let existing = engine
        .request_booking(routine(rid, T0, T0 + H, "patient-1"))
        .await
        .unwrap();

    engine.deactivate_resource(rid).await.unwrap();
    let err = engine
        .request_booking(routine(rid, T0 + 2 * H, T0 + 3 * H, "patient-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResource(_, _)));
    assert!(engine.query_availability(rid, T0, T0 + DAY_MS, 0).await.unwrap().is_empty());
    // Existing bookings survive deactivation.
    assert_eq!(
        engine.get_booking(existing.booking_id).await.unwrap().status,
        BookingStatus::Confirmed
    );

    engine.reactivate_resource(rid).await.unwrap();
    assert_ok!(
        engine
            .request_booking(routine(rid, T0 + 2 * H, T0 + 3 * H, "patient-2"))
            .await
    );
}

#[tokio::test]
async fn inactive_resource_is_reported_before_a_bad_interval() {
    let (engine, rid) = engine_with("inactive_first.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    engine.deactivate_resource(rid).await.unwrap();
    let err = engine.request_booking(routine(rid, T0 + H, T0, "a")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidResource(id, _) if id == rid));
}

#[tokio::test]
async fn capacity_cannot_shrink_under_live_bookings() {
    let (engine, rid) = engine_with(
        "shrink.ledger",
        ResourceSpec::new(ResourceKind::Provider).capacity(2),
    )
    .await;
    engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
    engine.request_booking(routine(rid, T0, T0 + H, "b")).await.unwrap();

    let err = engine
        .update_resource(rid, ResourceSpec::new(ResourceKind::Provider).capacity(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));

    engine
        .update_resource(rid, ResourceSpec::new(ResourceKind::Provider).capacity(3).named("Dr. Osei"))
        .await
        .unwrap();
    let info = engine.resource_info(rid).await.unwrap();
    assert_eq!(info.capacity, 3);
    assert_eq!(info.name.as_deref(), Some("Dr. Osei"));

    let err = engine
        .update_resource(rid, ResourceSpec::new(ResourceKind::Bed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));
}

#[tokio::test]
async fn hours_cannot_shrink_under_live_bookings() {
    let (engine, rid) = engine_with("hours_shrink.ledger", ResourceSpec::new(ResourceKind::Theatre)).await;
    engine
        .request_booking(routine(rid, T0 + 18 * H, T0 + 19 * H, "late-list"))
        .await
        .unwrap();

    // Monday 08:00-17:00 would strand the 18:00 case.
    let day_list = vec![OperatingWindow::new(0, 8 * H, 17 * H)];
    let err = engine.add_operating_hours(rid, day_list.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));
    let err = engine
        .update_resource(rid, ResourceSpec::new(ResourceKind::Theatre).hours(day_list))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));
    assert!(engine.resource_info(rid).await.unwrap().hours.is_empty());

    assert_ok!(
        engine
            .add_operating_hours(rid, vec![OperatingWindow::new(0, 8 * H, 20 * H)])
            .await
    );
}

// ── Operating hours ──────────────────────────────────────

#[tokio::test]
async fn bookings_must_fall_inside_operating_hours() {
    let (engine, rid) = engine_with("hours.ledger", ResourceSpec::new(ResourceKind::Theatre)).await;
    // Monday 08:00-17:00 only.
    engine
        .add_operating_hours(rid, vec![OperatingWindow::new(0, 8 * H, 17 * H)])
        .await
        .unwrap();

    assert!(engine.is_within_operating_hours(rid, Span::new(T0 + 9 * H, T0 + 10 * H)).await.unwrap());
    assert_ok!(engine.request_booking(routine(rid, T0 + 9 * H, T0 + 10 * H, "a")).await);

    let err = engine
        .request_booking(routine(rid, T0 + 16 * H, T0 + 18 * H, "b"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutsideOperatingHours(_)));
    // Tuesday has no window at all.
    let err = engine
        .request_booking(routine(rid, T0 + DAY_MS + 9 * H, T0 + DAY_MS + 10 * H, "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutsideOperatingHours(_)));

    let free = engine.query_availability(rid, T0, T0 + 2 * DAY_MS, 0).await.unwrap();
    assert_eq!(
        free,
        vec![Span::new(T0 + 8 * H, T0 + 9 * H), Span::new(T0 + 10 * H, T0 + 17 * H)]
    );

    engine.clear_operating_hours(rid).await.unwrap();
    assert_ok!(engine.request_booking(routine(rid, T0 + 16 * H, T0 + 18 * H, "b")).await);
}

#[tokio::test]
async fn invalid_windows_are_rejected() {
    let (engine, rid) = engine_with("bad_hours.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let err = engine
        .add_operating_hours(rid, vec![OperatingWindow::new(7, 0, H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));
    let err = engine
        .add_operating_hours(rid, vec![OperatingWindow::new(1, 10 * H, 9 * H)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResourceSpec(_)));
    assert!(engine.resource_info(rid).await.unwrap().hours.is_empty());
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn overlapping_routine_requests_conflict() {
    let (engine, rid) = engine_with("overlap.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let first = engine.request_booking(routine(rid, T0, T0 + 2 * H, "a")).await.unwrap();
    assert_eq!(first.status, BookingStatus::Confirmed);
    assert!(first.preempted.is_empty());

    let err = engine
        .request_booking(routine(rid, T0 + H, T0 + 3 * H, "b"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Conflict {
            conflicting: vec![first.booking_id],
            waitlisted: None
        }
    );

    // Back to back is fine.
    assert_ok!(engine.request_booking(routine(rid, T0 + 2 * H, T0 + 3 * H, "b")).await);
    assert_eq!(engine.active_bookings(rid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn buffer_separates_bookings_on_both_sides() {
    let (engine, rid) = engine_with(
        "buffer.ledger",
        ResourceSpec::new(ResourceKind::Bed).buffer_after(30 * M),
    )
    .await;
    engine
        .request_booking(routine(rid, T0 + 10 * H, T0 + 11 * H, "a"))
        .await
        .unwrap();

    // Starts inside the turnover after the existing booking.
    assert_err!(engine.request_booking(routine(rid, T0 + 11 * H, T0 + 12 * H, "b")).await);
    // Its own turnover would run into the existing booking.
    assert_err!(
        engine
            .request_booking(routine(rid, T0 + 8 * H + 45 * M, T0 + 9 * H + 45 * M, "c"))
            .await
    );

    assert_ok!(
        engine
            .request_booking(routine(rid, T0 + 11 * H + 30 * M, T0 + 12 * H, "b"))
            .await
    );
    assert_ok!(engine.request_booking(routine(rid, T0 + 9 * H, T0 + 9 * H + 30 * M, "c")).await);
}

#[tokio::test]
async fn provider_capacity_allows_parallel_bookings() {
    let (engine, rid) = engine_with(
        "provider_capacity.ledger",
        ResourceSpec::new(ResourceKind::Provider).capacity(2),
    )
    .await;
    engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
    engine.request_booking(routine(rid, T0 + 30 * M, T0 + 90 * M, "b")).await.unwrap();

    let err = engine
        .request_booking(routine(rid, T0 + 45 * M, T0 + 50 * M, "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { ref conflicting, .. } if conflicting.len() == 2));

    // Only the overlap of a and b is full.
    let free = engine.query_availability(rid, T0, T0 + 2 * H, 0).await.unwrap();
    assert_eq!(free, vec![Span::new(T0, T0 + 30 * M), Span::new(T0 + H, T0 + 2 * H)]);
}

#[tokio::test]
async fn interval_validation() {
    let (engine, rid) = engine_with("validation.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let err = engine.request_booking(routine(rid, T0 + H, T0, "a")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
    let err = engine.request_booking(routine(rid, T0, T0 + 1_000, "a")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
    let err = engine.request_booking(routine(rid, T0, T0 + H, "  ")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
    let err = engine
        .request_booking(routine(rid, T0, T0 + 91 * DAY_MS, "a"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
}

#[tokio::test]
async fn queries_reject_out_of_range_timestamps() {
    let (engine, rid) = engine_with(
        "extreme_query.ledger",
        ResourceSpec::new(ResourceKind::Bed).hours(OperatingWindow::every_day(8 * H, 17 * H)),
    )
    .await;

    let err = engine
        .query_availability(rid, i64::MIN + 1, i64::MAX, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));

    let wild = Span { start: -1, end: i64::MAX };
    assert!(matches!(
        engine.evaluate(rid, wild, Priority::Emergency).await,
        Err(EngineError::InvalidInterval(_))
    ));
    assert!(matches!(engine.overlaps(rid, wild).await, Err(EngineError::InvalidInterval(_))));
    assert!(matches!(
        engine.is_within_operating_hours(rid, wild).await,
        Err(EngineError::InvalidInterval(_))
    ));
    let err = engine.request_booking(routine(rid, i64::MIN, T0, "a")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
}

#[tokio::test]
async fn duplicate_booking_id_is_rejected() {
    let (engine, rid) = engine_with("dup_booking.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let id = Ulid::new();
    engine
        .request_booking(routine(rid, T0, T0 + H, "a").with_id(id))
        .await
        .unwrap();
    let err = engine
        .request_booking(routine(rid, T0 + 2 * H, T0 + 3 * H, "a").with_id(id))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(id));
}

// ── Preemption ───────────────────────────────────────────

#[tokio::test]
async fn emergency_preempts_and_displaced_is_waitlisted() {
    let (engine, rid) = engine_with("preempt.ledger", ResourceSpec::new(ResourceKind::Theatre)).await;
    let routine_booking = engine
        .request_booking(routine(rid, T0 + 9 * H, T0 + 11 * H, "patient-elective"))
        .await
        .unwrap();
    let mut notices = engine.notify.subscribe(rid);

    let receipt = engine
        .request_booking(emergency(rid, T0 + 10 * H, T0 + 12 * H, "patient-trauma"))
        .await
        .unwrap();
    assert_eq!(receipt.status, BookingStatus::Confirmed);
    assert_eq!(receipt.preempted, vec![routine_booking.booking_id]);

    let victim = engine.get_booking(routine_booking.booking_id).await.unwrap();
    assert_eq!(victim.status, BookingStatus::Preempted);
    assert_eq!(victim.superseded_by, Some(receipt.booking_id));
    assert_eq!(engine.overlaps(rid, Span::new(T0, T0 + DAY_MS)).await.unwrap(), vec![receipt.booking_id]);

    let waiting = engine.waitlist_entries();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].displaced, Some(routine_booking.booking_id));
    assert_eq!(waiting[0].requester, "patient-elective");
    assert_eq!(waiting[0].window, Span::new(T0 + 9 * H, T0 + 11 * H));

    assert!(matches!(
        notices.try_recv().unwrap(),
        Notice::BookingConfirmed { booking_id, .. } if booking_id == receipt.booking_id
    ));
    assert!(matches!(
        notices.try_recv().unwrap(),
        Notice::BookingPreempted { booking_id, superseded_by, .. }
            if booking_id == routine_booking.booking_id && superseded_by == receipt.booking_id
    ));
}

#[tokio::test]
async fn urgent_does_not_preempt() {
    let (engine, rid) = engine_with("urgent.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let held = engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
    let err = engine
        .request_booking(BookingRequest::new(rid, T0, T0 + H, "b", Priority::Urgent))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { ref conflicting, .. } if conflicting == &vec![held.booking_id]));
    assert_eq!(
        engine.get_booking(held.booking_id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn emergency_does_not_preempt_emergency() {
    let (engine, rid) = engine_with("emerg_vs_emerg.ledger", ResourceSpec::new(ResourceKind::Theatre)).await;
    engine.request_booking(emergency(rid, T0, T0 + H, "a")).await.unwrap();
    let err = engine.request_booking(emergency(rid, T0, T0 + H, "b")).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
    assert!(engine.waitlist_entries().is_empty());
}

#[tokio::test]
async fn evaluate_reports_without_booking() {
    let (engine, rid) = engine_with("evaluate.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let held = engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
    let span = Span::new(T0 + 30 * M, T0 + 90 * M);

    assert_eq!(
        engine.evaluate(rid, span, Priority::Emergency).await.unwrap(),
        Verdict::PreemptableConflict(vec![held.booking_id])
    );
    assert_eq!(
        engine.evaluate(rid, span, Priority::Routine).await.unwrap(),
        Verdict::HardConflict(vec![held.booking_id])
    );
    assert_eq!(
        engine.evaluate(rid, Span::new(T0 + H, T0 + 2 * H), Priority::Routine).await.unwrap(),
        Verdict::Clear
    );
    assert_eq!(engine.active_bookings(rid).await.unwrap().len(), 1);
}

// ── Holds ────────────────────────────────────────────────

#[tokio::test]
async fn hold_then_confirm() {
    let (engine, rid) = engine_with("hold_confirm.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let receipt = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() + 60_000))
        .await
        .unwrap();
    assert_eq!(receipt.status, BookingStatus::Pending);

    // A live hold blocks like a booking.
    assert_err!(engine.request_booking(routine(rid, T0, T0 + H, "b")).await);

    engine.confirm_booking(receipt.booking_id).await.unwrap();
    let b = engine.get_booking(receipt.booking_id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
    assert_eq!(b.hold_expires_at, None);

    let err = engine.confirm_booking(receipt.booking_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { status: BookingStatus::Confirmed, .. }));
}

#[tokio::test]
async fn hold_deadline_must_be_ahead() {
    let (engine, rid) = engine_with("hold_past.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let err = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() - 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
}

#[tokio::test]
async fn confirming_a_lapsed_hold_cancels_it() {
    let (engine, rid) = engine_with("hold_lapsed.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let receipt = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() + 50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let err = engine.confirm_booking(receipt.booking_id).await.unwrap_err();
    assert_eq!(err, EngineError::HoldExpired(receipt.booking_id));
    let b = engine.get_booking(receipt.booking_id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Cancelled);
    assert_eq!(b.cancel_reason.as_deref(), Some("hold expired"));
}

#[tokio::test]
async fn lapsed_hold_yields_to_new_request() {
    let (engine, rid) = engine_with("hold_yield.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let hold = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() + 50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(engine.query_availability(rid, T0, T0 + H, 0).await.unwrap(), vec![Span::new(T0, T0 + H)]);
    let receipt = engine.request_booking(routine(rid, T0, T0 + H, "b")).await.unwrap();
    assert_eq!(receipt.status, BookingStatus::Confirmed);
    assert_eq!(
        engine.get_booking(hold.booking_id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(engine.index_snapshot(rid).await.unwrap().len(), 1);
}

// ── Cancel / complete ────────────────────────────────────

#[tokio::test]
async fn cancel_is_not_repeatable() {
    let (engine, rid) = engine_with("cancel_twice.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let receipt = engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();

    assert_eq!(engine.cancel_booking(receipt.booking_id, "discharged").await.unwrap(), rid);
    let history_len = engine.booking_history(rid).await.unwrap().len();

    let err = engine.cancel_booking(receipt.booking_id, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { status: BookingStatus::Cancelled, .. }));
    assert_eq!(engine.booking_history(rid).await.unwrap().len(), history_len);

    let b = engine.get_booking(receipt.booking_id).await.unwrap();
    assert_eq!(b.cancel_reason.as_deref(), Some("discharged"));
    let stranger = Ulid::new();
    assert_eq!(
        engine.cancel_booking(stranger, "nope").await.unwrap_err(),
        EngineError::NotFound(stranger)
    );
}

#[tokio::test]
async fn complete_only_confirmed() {
    let (engine, rid) = engine_with("complete.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let hold = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() + 60_000))
        .await
        .unwrap();
    let err = engine.complete_booking(hold.booking_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { status: BookingStatus::Pending, .. }));

    engine.confirm_booking(hold.booking_id).await.unwrap();
    engine.complete_booking(hold.booking_id).await.unwrap();
    assert_eq!(
        engine.get_booking(hold.booking_id).await.unwrap().status,
        BookingStatus::Completed
    );
    assert!(engine.active_bookings(rid).await.unwrap().is_empty());
}

// ── Waitlist ─────────────────────────────────────────────

#[tokio::test]
async fn conflict_can_join_waitlist_and_is_placed_on_cancel() {
    let (engine, rid) = engine_with("waitlist_place.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let first = engine.request_booking(routine(rid, T0, T0 + 2 * H, "a")).await.unwrap();

    let err = engine
        .request_booking(routine(rid, T0 + H, T0 + 2 * H, "b").or_waitlist())
        .await
        .unwrap_err();
    let EngineError::Conflict {
        waitlisted: Some(entry_id),
        ..
    } = err
    else {
        panic!("expected waitlisted conflict, got {err:?}");
    };
    assert_eq!(engine.waitlist_entries()[0].id, entry_id);

    engine.cancel_booking(first.booking_id, "discharged").await.unwrap();
    assert!(engine.waitlist_entries().is_empty());
    let active = engine.active_bookings(rid).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].requester, "b");
    assert_eq!(active[0].span, Span::new(T0 + H, T0 + 2 * H));
    assert_eq!(active[0].status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn waitlist_by_kind_with_flexible_duration() {
    let engine = open_engine("waitlist_kind.ledger");
    let theatre = Ulid::new();
    engine
        .register_resource(theatre, ResourceSpec::new(ResourceKind::Theatre))
        .await
        .unwrap();
    let blocker = engine
        .request_booking(routine(theatre, T0 + 8 * H, T0 + 18 * H, "list-a"))
        .await
        .unwrap();

    let entry_id = Ulid::new();
    engine
        .enqueue_waitlist(WaitlistEntry {
            id: entry_id,
            requester: "list-b".into(),
            target: WaitTarget::Kind(ResourceKind::Theatre),
            window: Span::new(T0 + 8 * H, T0 + 18 * H),
            duration: 2 * H,
            priority: Priority::Urgent,
            enqueued_at: 0,
            ticket: 0,
            displaced: None,
        })
        .await
        .unwrap();
    assert_eq!(
        engine.enqueue_waitlist(WaitlistEntry {
            id: entry_id,
            requester: "list-b".into(),
            target: WaitTarget::Kind(ResourceKind::Theatre),
            window: Span::new(T0 + 8 * H, T0 + 18 * H),
            duration: 2 * H,
            priority: Priority::Urgent,
            enqueued_at: 0,
            ticket: 0,
            displaced: None,
        })
        .await
        .unwrap_err(),
        EngineError::AlreadyExists(entry_id)
    );

    engine.cancel_booking(blocker.booking_id, "postponed").await.unwrap();
    let active = engine.active_bookings(theatre).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].requester, "list-b");
    assert_eq!(active[0].span, Span::new(T0 + 8 * H, T0 + 10 * H));
    assert_eq!(active[0].priority, Priority::Urgent);
}

#[tokio::test]
async fn waitlist_rejects_bad_entries() {
    let engine = open_engine("waitlist_bad.ledger");
    let entry = |target, duration| WaitlistEntry {
        id: Ulid::new(),
        requester: "x".into(),
        target,
        window: Span::new(T0, T0 + H),
        duration,
        priority: Priority::Routine,
        enqueued_at: 0,
        ticket: 0,
        displaced: None,
    };
    let err = engine
        .enqueue_waitlist(entry(WaitTarget::Resource(Ulid::new()), H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResource(_, _)));
    let err = engine
        .enqueue_waitlist(entry(WaitTarget::Kind(ResourceKind::Bed), 2 * H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
}

#[tokio::test]
async fn withdraw_from_waitlist() {
    let (engine, rid) = engine_with("waitlist_withdraw.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
    let Err(EngineError::Conflict {
        waitlisted: Some(entry_id),
        ..
    }) = engine.request_booking(routine(rid, T0, T0 + H, "b").or_waitlist()).await
    else {
        panic!("expected a waitlisted conflict");
    };

    let entry = engine.withdraw_waitlist(entry_id).unwrap();
    assert_eq!(entry.requester, "b");
    assert_eq!(engine.withdraw_waitlist(entry_id).unwrap_err(), EngineError::NotFound(entry_id));
}

#[tokio::test]
async fn reoffer_never_preempts() {
    let (engine, rid) = engine_with("reoffer_no_preempt.ledger", ResourceSpec::new(ResourceKind::Theatre)).await;
    let elective = engine.request_booking(routine(rid, T0, T0 + 2 * H, "elective")).await.unwrap();
    engine.request_booking(emergency(rid, T0, T0 + H, "trauma")).await.unwrap();
    // The displaced elective waits; the freed tail of its slot is not enough.
    assert_eq!(engine.waitlist_entries().len(), 1);

    let placed = engine.on_capacity_freed(rid, Span::new(T0 + H, T0 + 2 * H)).await.unwrap();
    assert!(placed.is_empty());
    assert_eq!(engine.waitlist_entries()[0].displaced, Some(elective.booking_id));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test]
async fn lock_timeout_reports_busy() {
    let path = test_ledger_path("busy.ledger");
    let config = EngineConfig::new(path).lock_timeout(Duration::from_millis(50));
    let engine = Arc::new(Engine::open(config, Arc::new(NotifyHub::new())).unwrap());
    let rid = Ulid::new();
    engine.register_resource(rid, ResourceSpec::new(ResourceKind::Bed)).await.unwrap();

    let guard = engine.get_resource(&rid).unwrap().write_owned().await;
    let err = engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap_err();
    assert_eq!(err, EngineError::Busy(rid));
    assert!(err.is_retryable());
    drop(guard);

    assert_ok!(engine.request_booking(routine(rid, T0, T0 + H, "a")).await);
}

#[tokio::test]
async fn withdrawn_request_changes_nothing() {
    let (engine, rid) = engine_with("withdrawn.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let guard = engine.get_resource(&rid).unwrap().write_owned().await;
    let token = CancellationToken::new();
    token.cancel();

    let err = engine
        .request_booking_cancellable(routine(rid, T0, T0 + H, "a"), &token)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Withdrawn);
    drop(guard);
    assert!(engine.active_bookings(rid).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_requests_for_one_slot_admit_exactly_one() {
    let (engine, rid) = engine_with("race.ledger", ResourceSpec::new(ResourceKind::Bed)).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .request_booking(routine(rid, T0, T0 + H, &format!("patient-{i}")))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::Conflict { .. })),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn abandoned_request_still_applies_what_it_logged() {
    let path = test_ledger_path("abandoned.ledger");
    let engine = open_at(&path);
    let rid = Ulid::new();
    engine.register_resource(rid, ResourceSpec::new(ResourceKind::Bed)).await.unwrap();

    // One poll takes the lock and hands off the append; then the caller is gone.
    let _ = engine.request_booking(routine(rid, T0, T0 + H, "p1")).now_or_never();

    let err = engine.request_booking(routine(rid, T0, T0 + H, "p2")).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
    let live = engine.active_bookings(rid).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].requester, "p1");
    let seqs: Vec<u64> = engine.booking_history(rid).await.unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1]);

    let live_index = engine.index_snapshot(rid).await.unwrap();
    let reopened = open_at(&path);
    assert_eq!(reopened.index_snapshot(rid).await.unwrap(), live_index);
}

// ── Ledger ───────────────────────────────────────────────

#[tokio::test]
async fn history_follows_the_lifecycle() {
    let (engine, rid) = engine_with("history.ledger", ResourceSpec::new(ResourceKind::Bed)).await;
    let receipt = engine
        .request_booking(routine(rid, T0, T0 + H, "a").held_until(now_ms() + 60_000))
        .await
        .unwrap();
    engine.confirm_booking(receipt.booking_id).await.unwrap();
    engine.cancel_booking(receipt.booking_id, "discharged").await.unwrap();

    let history = engine.booking_history(rid).await.unwrap();
    let labels: Vec<&str> = history.iter().map(|r| r.event.label()).collect();
    assert_eq!(
        labels,
        vec!["resource_registered", "booking_created", "booking_confirmed", "booking_cancelled"]
    );
    let seqs: Vec<u64> = history.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn reopen_restores_state() {
    let path = test_ledger_path("reopen.ledger");
    let rid = Ulid::new();
    let (kept, preempted) = {
        let engine = open_at(&path);
        engine
            .register_resource(rid, ResourceSpec::new(ResourceKind::Bed).buffer_after(15 * M))
            .await
            .unwrap();
        let a = engine.request_booking(routine(rid, T0, T0 + H, "a")).await.unwrap();
        let b = engine.request_booking(routine(rid, T0 + 2 * H, T0 + 3 * H, "b")).await.unwrap();
        engine.cancel_booking(b.booking_id, "moved").await.unwrap();
        let e = engine.request_booking(emergency(rid, T0, T0 + H, "c")).await.unwrap();
        assert_eq!(e.preempted, vec![a.booking_id]);
        (engine.index_snapshot(rid).await.unwrap(), a.booking_id)
    };

    let engine = open_at(&path);
    assert_eq!(engine.index_snapshot(rid).await.unwrap(), kept);
    assert_eq!(
        engine.get_booking(preempted).await.unwrap().status,
        BookingStatus::Preempted
    );
    assert_eq!(engine.resource_info(rid).await.unwrap().buffer_after, Some(15 * M));

    // Sequence numbers continue where they left off.
    engine.request_booking(routine(rid, T0 + 4 * H, T0 + 5 * H, "d")).await.unwrap();
    let seqs: Vec<u64> = engine.booking_history(rid).await.unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
}
