use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use super::*;
use crate::calendar::BusinessCalendar;
use crate::feed::{ExternalBlock, FeedError, FeedPolicy, NoExternalFeed, PushedBusyFeed};
use crate::outbox::CancelCause;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf, feed: Arc<dyn BusyFeed>, settings: SchedulingSettings) -> Engine {
    Engine::new(path, Arc::new(Outbox::new()), feed, settings).unwrap()
}

fn engine(name: &str) -> Engine {
    open(test_wal_path(name), Arc::new(NoExternalFeed), SchedulingSettings::default())
}

/// A Friday, far enough ahead that lead time never applies.
fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2031, 1, 10).unwrap()
}

fn at(minute: u32) -> Ms {
    BusinessCalendar::default().instant(date(), minute).unwrap()
}

fn minutes(slots: &[Slot]) -> Vec<u32> {
    slots.iter().map(|s| s.minute).collect()
}

fn new_assignment(start: u32, end: u32, staff_id: u64, service_area_id: u64) -> NewAssignment {
    NewAssignment {
        id: Ulid::new(),
        date: date(),
        start,
        end,
        staff_id,
        service_area_id,
        service_keys: vec!["cut".into()],
        capacity: 1,
    }
}

/// Open the fixed schedule 09:00-17:00 on the test date's weekday.
async fn open_friday(engine: &Engine) {
    engine
        .set_schedule_day(BusinessCalendar::weekday(date()), true, vec![DayInterval::new(540, 1020)])
        .await
        .unwrap();
}

async fn request(engine: &Engine, context: Context, minute: u32, duration: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .request_reservation(id, context, at(minute), duration, "client".into())
        .await
        .unwrap();
    id
}

struct FailingFeed;

#[async_trait]
impl BusyFeed for FailingFeed {
    async fn busy_blocks(&self, _window: Span) -> Result<Vec<ExternalBlock>, FeedError> {
        Err(FeedError::Unavailable("connection refused".into()))
    }
}

struct SlowFeed;

#[async_trait]
impl BusyFeed for SlowFeed {
    async fn busy_blocks(&self, _window: Span) -> Result<Vec<ExternalBlock>, FeedError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Vec::new())
    }
}

fn with_policy(policy: FeedPolicy) -> SchedulingSettings {
    SchedulingSettings {
        feed_policy: policy,
        feed_timeout_ms: 20,
        ..Default::default()
    }
}

// ── Assignments ──────────────────────────────────────────

#[tokio::test]
async fn staff_collision_rejected_touching_accepted() {
    let engine = engine("staff_collision.wal");
    let first = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();

    let err = engine
        .create_assignment(new_assignment(630, 720, 1, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaffCollision { existing } if existing == first.id));
    assert!(err.is_retryable());

    engine.create_assignment(new_assignment(660, 720, 1, 2)).await.unwrap();
    assert_eq!(engine.list_assignments(date(), None).await.len(), 2);
}

#[tokio::test]
async fn area_collision_rejected() {
    let engine = engine("area_collision.wal");
    let first = engine.create_assignment(new_assignment(540, 660, 1, 7)).await.unwrap();
    let err = engine
        .create_assignment(new_assignment(600, 630, 2, 7))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AreaCollision { existing } if existing == first.id));
}

#[tokio::test]
async fn disabled_assignment_frees_staff_and_is_hidden() {
    let engine = engine("disabled_frees.wal");
    let first = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
    engine.disable_assignment(first.id).await.unwrap();
    engine.disable_assignment(first.id).await.unwrap();

    engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
    let listed = engine.list_assignments(date(), None).await;
    assert_eq!(listed.len(), 1);
    assert_ne!(listed[0].id, first.id);

    let disabled = engine.get_assignment(&first.id).await.unwrap();
    assert_eq!(disabled.status, AssignmentStatus::Disabled);
    assert!(matches!(
        engine.disable_assignment(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn assignment_validation() {
    let engine = engine("assignment_validation.wal");
    for bad in [
        new_assignment(600, 600, 1, 1),
        new_assignment(600, 1441, 1, 1),
        new_assignment(540, 600, 0, 1),
        NewAssignment {
            capacity: 0,
            ..new_assignment(540, 600, 1, 1)
        },
        NewAssignment {
            service_keys: vec![],
            ..new_assignment(540, 600, 1, 1)
        },
    ] {
        assert!(matches!(
            engine.create_assignment(bad).await,
            Err(EngineError::Validation(_))
        ));
    }
}

#[tokio::test]
async fn list_assignments_filters_by_service_and_orders_by_start() {
    let engine = engine("list_assignments.wal");
    let late = engine.create_assignment(new_assignment(780, 840, 1, 1)).await.unwrap();
    let early = engine
        .create_assignment(NewAssignment {
            service_keys: vec!["color".into(), "cut".into()],
            ..new_assignment(540, 600, 2, 2)
        })
        .await
        .unwrap();

    let all: Vec<Ulid> = engine.list_assignments(date(), None).await.iter().map(|a| a.id).collect();
    assert_eq!(all, vec![early.id, late.id]);

    let color = engine.list_assignments(date(), Some("color")).await;
    assert_eq!(color.len(), 1);
    assert_eq!(color[0].id, early.id);
    assert!(engine.list_assignments(date().succ_opt().unwrap(), None).await.is_empty());
}

#[tokio::test]
async fn concurrent_assignment_creation_single_winner() {
    let engine = Arc::new(engine("assignment_race.wal"));
    let mut handles = Vec::new();
    for area in 1..=8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_assignment(new_assignment(540, 660, 1, area)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::StaffCollision { .. })),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_assignments(date(), None).await.len(), 1);
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn confirm_cascades_to_overlapping_pending_only() {
    let engine = engine("cascade.wal");
    open_friday(&engine).await;
    let mut events = engine.outbox.subscribe();

    let winner = request(&engine, Context::Fixed, 540, 30).await;
    let overlapping = request(&engine, Context::Fixed, 540, 60).await;
    let touching = request(&engine, Context::Fixed, 570, 30).await;

    let outcome = engine.confirm(winner).await.unwrap();
    assert_eq!(outcome.reservation.state, ReservationState::Confirmed);
    assert_eq!(outcome.cancelled, vec![overlapping]);

    let lost = engine.get_reservation(&overlapping).await.unwrap();
    assert_eq!(lost.state, ReservationState::Cancelled);
    assert_eq!(lost.cancelled_by, Some(winner));
    let still = engine.get_reservation(&touching).await.unwrap();
    assert_eq!(still.state, ReservationState::Pending);

    // Loser learns who took the slot
    assert!(matches!(engine.confirm(overlapping).await, Err(EngineError::Conflict(w)) if w == winner));
    assert!(matches!(
        engine
            .request_reservation(Ulid::new(), Context::Fixed, at(540), 30, "late".into())
            .await,
        Err(EngineError::Conflict(w)) if w == winner
    ));
    engine.confirm(touching).await.unwrap();

    let mut kinds = Vec::new();
    let mut cascade_cause = None;
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
        if let DomainEvent::ReservationCancelled { reservation, cause } = event {
            assert_eq!(reservation.id, overlapping);
            cascade_cause = Some(cause);
        }
    }
    assert_eq!(cascade_cause, Some(CancelCause::Cascade { confirmed: winner }));
    assert_eq!(kinds.iter().filter(|k| **k == "reservation_confirmed").count(), 2);
}

#[tokio::test]
async fn confirm_rejects_non_pending() {
    let engine = engine("confirm_states.wal");
    open_friday(&engine).await;
    let id = request(&engine, Context::Fixed, 600, 30).await;
    engine.confirm(id).await.unwrap();
    assert!(matches!(
        engine.confirm(id).await,
        Err(EngineError::InvalidState { state: ReservationState::Confirmed, .. })
    ));

    let manual = request(&engine, Context::Fixed, 660, 30).await;
    engine.cancel(manual).await.unwrap();
    assert!(matches!(
        engine.confirm(manual).await,
        Err(EngineError::InvalidState { state: ReservationState::Cancelled, .. })
    ));
    assert!(matches!(engine.confirm(Ulid::new()).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_confirm_single_winner() {
    let engine = Arc::new(engine("confirm_race.wal"));
    open_friday(&engine).await;
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(request(&engine, Context::Fixed, 600, 60).await);
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.confirm(id).await }));
    }
    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(outcome) => winners.push(outcome.reservation.id),
            Err(EngineError::Conflict(w)) => losers.push(w),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 7);
    assert!(losers.iter().all(|w| *w == winners[0]));

    let confirmed = engine
        .agenda(date(), Some(Context::Fixed))
        .await
        .into_iter()
        .filter(|e| e.reservation.state == ReservationState::Confirmed)
        .count();
    assert_eq!(confirmed, 1);
}

#[tokio::test]
async fn contexts_do_not_block_each_other() {
    let engine = engine("context_scope.wal");
    open_friday(&engine).await;
    let assignment = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
    let scoped = Context::Assignment(assignment.id);

    let fixed = request(&engine, Context::Fixed, 600, 60).await;
    let in_assignment = request(&engine, scoped, 600, 60).await;
    let outcome = engine.confirm(fixed).await.unwrap();
    assert!(outcome.cancelled.is_empty());
    engine.confirm(in_assignment).await.unwrap();

    let assignment_slots = engine.get_available_slots(date(), 60, scoped).await.unwrap();
    assert_eq!(minutes(&assignment_slots), vec![540]);

    let fixed_busy = engine.busy_ranges(date(), Context::Fixed).await.unwrap();
    assert_eq!(fixed_busy.len(), 1);
    assert_eq!(fixed_busy[0].source, BusySource::Fixed);
    let scoped_busy = engine.busy_ranges(date(), scoped).await.unwrap();
    assert_eq!(scoped_busy.len(), 1);
    assert_eq!(scoped_busy[0].source, BusySource::Assignment);
    assert_eq!(scoped_busy[0].scope_id, Some(assignment.id));
}

#[tokio::test]
async fn request_must_fit_bookable_window() {
    let engine = engine("request_window.wal");
    open_friday(&engine).await;
    let assignment = engine.create_assignment(new_assignment(540, 600, 1, 1)).await.unwrap();
    let scoped = Context::Assignment(assignment.id);

    let outside_schedule = engine
        .request_reservation(Ulid::new(), Context::Fixed, at(1000), 60, "c".into())
        .await;
    assert!(matches!(outside_schedule, Err(EngineError::Validation(_))));

    let past_window = engine
        .request_reservation(Ulid::new(), scoped, at(570), 60, "c".into())
        .await;
    assert!(matches!(past_window, Err(EngineError::Validation(_))));

    let bad_duration = engine
        .request_reservation(Ulid::new(), Context::Fixed, at(600), 45, "c".into())
        .await;
    assert!(matches!(bad_duration, Err(EngineError::Validation(_))));

    let missing_ref = engine
        .request_reservation(Ulid::new(), Context::Fixed, at(600), 30, " ".into())
        .await;
    assert!(matches!(missing_ref, Err(EngineError::Validation(_))));

    engine.disable_assignment(assignment.id).await.unwrap();
    let disabled = engine
        .request_reservation(Ulid::new(), scoped, at(540), 30, "c".into())
        .await;
    assert!(matches!(disabled, Err(EngineError::Validation(_))));

    let unknown = engine
        .request_reservation(Ulid::new(), Context::Assignment(Ulid::new()), at(540), 30, "c".into())
        .await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn cancel_and_attendance_guards() {
    let engine = engine("attendance.wal");
    open_friday(&engine).await;
    let id = request(&engine, Context::Fixed, 600, 30).await;

    assert!(matches!(
        engine.mark_attendance_at(id, true, at(700)).await,
        Err(EngineError::InvalidState { state: ReservationState::Pending, .. })
    ));
    engine.confirm(id).await.unwrap();
    assert!(matches!(
        engine.mark_attendance_at(id, true, at(620)).await,
        Err(EngineError::Validation(_))
    ));
    let marked = engine.mark_attendance_at(id, false, at(630)).await.unwrap();
    assert_eq!(marked.state, ReservationState::NoAttended);
    assert!(matches!(
        engine.mark_attendance_at(id, true, at(700)).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(engine.cancel(id).await, Err(EngineError::InvalidState { .. })));

    let other = request(&engine, Context::Fixed, 660, 30).await;
    let cancelled = engine.cancel(other).await.unwrap();
    assert_eq!(cancelled.state, ReservationState::Cancelled);
    assert_eq!(cancelled.cancelled_by, None);
    assert!(matches!(engine.cancel(other).await, Err(EngineError::InvalidState { .. })));
}

#[tokio::test]
async fn cancelling_confirmed_frees_the_slot() {
    let engine = engine("cancel_frees.wal");
    open_friday(&engine).await;
    let id = request(&engine, Context::Fixed, 600, 30).await;
    engine.confirm(id).await.unwrap();
    assert!(!minutes(&engine.get_available_slots(date(), 30, Context::Fixed).await.unwrap()).contains(&600));

    engine.cancel(id).await.unwrap();
    assert!(minutes(&engine.get_available_slots(date(), 30, Context::Fixed).await.unwrap()).contains(&600));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn slots_follow_schedule_and_confirmed_busy() {
    let engine = engine("slots_busy.wal");
    assert!(engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap().is_empty());
    open_friday(&engine).await;

    let before = engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap();
    assert_eq!(before.len(), 15);
    assert_eq!(before[0].start, at(540));
    assert!(!engine.cache.is_empty());

    // Pending reservations do not block
    let id = request(&engine, Context::Fixed, 600, 60).await;
    assert_eq!(engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap().len(), 15);

    engine.confirm(id).await.unwrap();
    let after = minutes(&engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap());
    assert_eq!(after.len(), 12);
    assert!(after.contains(&540));
    assert!(!after.contains(&570));
    assert!(!after.contains(&600));
    assert!(!after.contains(&630));
    assert!(after.contains(&660));
}

#[tokio::test]
async fn slots_reject_unsupported_duration() {
    let engine = engine("slots_duration.wal");
    open_friday(&engine).await;
    assert!(matches!(
        engine.get_available_slots(date(), 45, Context::Fixed).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn slots_respect_lead_time_today() {
    let engine = engine("lead_time.wal");
    open_friday(&engine).await;
    let slots = engine
        .get_available_slots_at(date(), 30, Context::Fixed, at(550))
        .await
        .unwrap();
    // 09:10 + 60 minutes, rounded up to the grid
    assert_eq!(slots.first().map(|s| s.minute), Some(630));
    assert_eq!(slots.last().map(|s| s.minute), Some(990));

    let next_day = engine
        .get_available_slots_at(date(), 30, Context::Fixed, at(550) - 24 * 60 * MINUTE_MS)
        .await
        .unwrap();
    assert_eq!(next_day.first().map(|s| s.minute), Some(540));

    let past = engine
        .get_available_slots_at(date(), 30, Context::Fixed, at(550) + 24 * 60 * MINUTE_MS)
        .await
        .unwrap();
    assert!(past.is_empty());
}

#[tokio::test]
async fn assignment_slots_use_its_window_only() {
    let engine = engine("assignment_slots.wal");
    let assignment = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
    let scoped = Context::Assignment(assignment.id);

    // No fixed schedule configured: the assignment window is still bookable
    let slots = engine.get_available_slots(date(), 60, scoped).await.unwrap();
    assert_eq!(minutes(&slots), vec![540, 570, 600]);

    let other_day = date().succ_opt().unwrap();
    assert!(engine.get_available_slots(other_day, 60, scoped).await.unwrap().is_empty());

    engine.disable_assignment(assignment.id).await.unwrap();
    assert!(engine.get_available_slots(date(), 60, scoped).await.unwrap().is_empty());

    assert!(matches!(
        engine.get_available_slots(date(), 60, Context::Assignment(Ulid::new())).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn confirmed_time_on_one_assignment_leaves_a_parallel_one_open() {
    let engine = engine("parallel_assignments.wal");
    open_friday(&engine).await;
    let left = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
    let right = engine.create_assignment(new_assignment(540, 660, 2, 2)).await.unwrap();
    let left_ctx = Context::Assignment(left.id);
    let right_ctx = Context::Assignment(right.id);

    // Warm the busy cache for both contexts before anything is confirmed
    for ctx in [left_ctx, right_ctx] {
        let slots = engine.get_available_slots(date(), 60, ctx).await.unwrap();
        assert_eq!(minutes(&slots), vec![540, 570, 600]);
    }

    let id = request(&engine, left_ctx, 540, 60).await;
    engine.confirm(id).await.unwrap();

    let left_slots = engine.get_available_slots(date(), 60, left_ctx).await.unwrap();
    assert_eq!(minutes(&left_slots), vec![600]);
    let right_slots = engine.get_available_slots(date(), 60, right_ctx).await.unwrap();
    assert_eq!(minutes(&right_slots), vec![540, 570, 600]);
    assert!(engine.busy_ranges(date(), right_ctx).await.unwrap().is_empty());

    let fixed = engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap();
    assert_eq!(fixed.first().map(|s| s.minute), Some(540));
}

#[tokio::test]
async fn external_busy_blocks_fixed_context() {
    let feed = Arc::new(PushedBusyFeed::new());
    let engine = open(test_wal_path("external_busy.wal"), feed.clone(), SchedulingSettings::default());
    open_friday(&engine).await;
    feed.push(ExternalBlock {
        span: Span::new(at(720), at(780)),
        label: Some("lunch".into()),
    })
    .unwrap();

    let slots = minutes(&engine.get_available_slots(date(), 30, Context::Fixed).await.unwrap());
    assert!(slots.contains(&690));
    assert!(!slots.contains(&720));
    assert!(!slots.contains(&750));
    assert!(slots.contains(&780));

    let busy = engine.busy_ranges(date(), Context::Fixed).await.unwrap();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].source, BusySource::External);
    assert_eq!(busy[0].label.as_deref(), Some("lunch"));
}

#[tokio::test]
async fn feed_failure_closed_blocks_whole_day() {
    let engine = open(test_wal_path("feed_closed.wal"), Arc::new(FailingFeed), with_policy(FeedPolicy::FailClosed));
    open_friday(&engine).await;
    assert!(engine.get_available_slots(date(), 30, Context::Fixed).await.unwrap().is_empty());
    let busy = engine.busy_ranges(date(), Context::Fixed).await.unwrap();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].span, BusinessCalendar::default().day_span(date()).unwrap());

    // The feed never applies to assignment contexts
    let assignment = engine.create_assignment(new_assignment(540, 600, 1, 1)).await.unwrap();
    let scoped = engine
        .get_available_slots(date(), 30, Context::Assignment(assignment.id))
        .await
        .unwrap();
    assert_eq!(minutes(&scoped), vec![540, 570]);
}

#[tokio::test]
async fn feed_failure_open_ignores_feed() {
    let engine = open(test_wal_path("feed_open.wal"), Arc::new(FailingFeed), with_policy(FeedPolicy::FailOpen));
    open_friday(&engine).await;
    assert_eq!(engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap().len(), 15);
}

#[tokio::test]
async fn feed_failure_surface_errors() {
    let engine = open(test_wal_path("feed_surface.wal"), Arc::new(FailingFeed), with_policy(FeedPolicy::Surface));
    open_friday(&engine).await;
    let err = engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap_err();
    assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
    assert_eq!(err.code(), "upstream_unavailable");
}

#[tokio::test]
async fn slow_feed_times_out_under_policy() {
    let engine = open(test_wal_path("feed_timeout.wal"), Arc::new(SlowFeed), with_policy(FeedPolicy::Surface));
    open_friday(&engine).await;
    let err = engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap_err();
    assert!(matches!(err, EngineError::UpstreamUnavailable(ref msg) if msg.contains("timed out")));
}

#[tokio::test]
async fn agenda_places_overlapping_reservations() {
    let engine = engine("agenda.wal");
    open_friday(&engine).await;
    let a = request(&engine, Context::Fixed, 540, 60).await;
    let b = request(&engine, Context::Fixed, 570, 30).await;
    let c = request(&engine, Context::Fixed, 720, 30).await;
    let gone = request(&engine, Context::Fixed, 800, 30).await;
    engine.cancel(gone).await.unwrap();

    let agenda = engine.agenda(date(), None).await;
    let ids: Vec<Ulid> = agenda.iter().map(|e| e.reservation.id).collect();
    assert_eq!(ids, vec![a, b, c]);
    assert_eq!((agenda[0].placement.index, agenda[0].placement.count), (0, 2));
    assert_eq!((agenda[1].placement.index, agenda[1].placement.count), (1, 2));
    assert_eq!((agenda[2].placement.index, agenda[2].placement.count), (0, 1));
    assert_ne!(agenda[0].placement.cluster, agenda[2].placement.cluster);

    assert!(engine.agenda(date(), Some(Context::Assignment(Ulid::new()))).await.is_empty());
}

#[tokio::test]
async fn schedule_day_rejects_overlapping_intervals() {
    let engine = engine("schedule_overlap.wal");
    let err = engine
        .set_schedule_day(1, true, vec![DayInterval::new(540, 720), DayInterval::new(700, 800)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let day = engine
        .set_schedule_day(1, true, vec![DayInterval::new(780, 900), DayInterval::new(540, 720)])
        .await
        .unwrap();
    assert_eq!(day.intervals[0].start, 540);
    assert_eq!(engine.schedule_day(1).await.unwrap(), day);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_replay() {
    let path = test_wal_path("replay.wal");
    let (assignment, winner, loser) = {
        let engine = open(path.clone(), Arc::new(NoExternalFeed), SchedulingSettings::default());
        open_friday(&engine).await;
        let assignment = engine.create_assignment(new_assignment(540, 660, 1, 1)).await.unwrap();
        let winner = request(&engine, Context::Fixed, 600, 60).await;
        let loser = request(&engine, Context::Fixed, 630, 30).await;
        engine.confirm(winner).await.unwrap();
        // Rejected work leaves no trace in the log
        assert!(engine.create_assignment(new_assignment(600, 700, 1, 2)).await.is_err());
        (assignment, winner, loser)
    };

    let engine = open(path, Arc::new(NoExternalFeed), SchedulingSettings::default());
    assert_eq!(engine.get_assignment(&assignment.id).await.unwrap(), assignment);
    assert_eq!(engine.list_assignments(date(), None).await.len(), 1);
    assert_eq!(
        engine.get_reservation(&winner).await.unwrap().state,
        ReservationState::Confirmed
    );
    let lost = engine.get_reservation(&loser).await.unwrap();
    assert_eq!(lost.state, ReservationState::Cancelled);
    assert_eq!(lost.cancelled_by, Some(winner));
    assert_eq!(engine.get_available_slots(date(), 60, Context::Fixed).await.unwrap().len(), 12);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let (kept, later) = {
        let engine = open(path.clone(), Arc::new(NoExternalFeed), SchedulingSettings::default());
        open_friday(&engine).await;
        let mut ids = Vec::new();
        for minute in [540, 600, 660, 720] {
            let id = request(&engine, Context::Fixed, minute, 30).await;
            ids.push(id);
        }
        for id in &ids[1..] {
            engine.cancel(*id).await.unwrap();
        }
        engine.confirm(ids[0]).await.unwrap();
        assert!(engine.wal_appends_since_compact().await >= 6);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let later = request(&engine, Context::Fixed, 900, 30).await;
        (ids[0], later)
    };

    let engine = open(path, Arc::new(NoExternalFeed), SchedulingSettings::default());
    assert_eq!(engine.get_reservation(&kept).await.unwrap().state, ReservationState::Confirmed);
    assert_eq!(engine.get_reservation(&later).await.unwrap().state, ReservationState::Pending);
    assert_eq!(engine.read().await.reservation_count(), 5);
    assert!(engine.schedule_day(BusinessCalendar::weekday(date())).await.unwrap().enabled);
}
