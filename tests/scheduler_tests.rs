use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::broadcast;

use cryoqueue::config::SchedulerConfig;
use cryoqueue::error::SchedulerError;
use cryoqueue::scheduler::{
    Axis, Capabilities, EntryStatus, EventKind, FieldDirection, Machine, MachineStatus,
    ManualClock, QueueEntry, QueueEvent, RejectReason, RequirementSpec, Scheduler, SubmitRequest,
    TemperatureRange,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
}

fn fridge(id: u64, name: &str, min_k: f64, max_k: f64, cooldown: f64) -> Machine {
    Machine::new(
        id,
        name,
        Capabilities::new(TemperatureRange::new(min_k, max_k)),
        cooldown,
    )
}

fn build(machines: Vec<Machine>) -> (Arc<Scheduler>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler =
        Scheduler::with_clock(SchedulerConfig::default(), machines, clock.clone()).unwrap();
    (Arc::new(scheduler), clock)
}

async fn submit(scheduler: &Scheduler, title: &str, hours: f64) -> QueueEntry {
    scheduler
        .submit(SubmitRequest::new(
            "user",
            title,
            RequirementSpec::new(4.0, hours),
        ))
        .await
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn assert_contiguous(scheduler: &Scheduler, machine_id: u64) {
    let snapshot = scheduler.snapshot(machine_id).unwrap();
    let positions: Vec<u32> = snapshot.queue.iter().filter_map(|e| e.position).collect();
    let expected: Vec<u32> = (1..=snapshot.queue.len() as u32).collect();
    assert_eq!(positions, expected);
    let starts: Vec<DateTime<Utc>> = snapshot
        .queue
        .iter()
        .filter_map(|e| e.estimated_start)
        .collect();
    assert_eq!(starts.len(), snapshot.queue.len());
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_wait_times_accumulate_duration_and_cooldown() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 2.0).await;
    let c = submit(&scheduler, "C", 1.0).await;

    let snapshot = scheduler.snapshot(1).unwrap();
    let start = |id| snapshot.find(&id).unwrap().estimated_start.unwrap();
    assert_eq!(start(a.id), t0());
    assert_eq!(start(b.id), t0() + Duration::minutes(90));
    assert_eq!(start(c.id), t0() + Duration::hours(4));
}

#[tokio::test]
async fn test_submission_goes_to_only_compatible_machine() {
    let m1 = Machine::new(
        1,
        "M1",
        Capabilities::new(TemperatureRange::new(0.01, 5.0))
            .with_field(Axis::X, 3.0, FieldDirection::Parallel),
        0.5,
    );
    let m2 = fridge(2, "M2", 1.0, 10.0, 0.5);
    let (scheduler, _) = build(vec![m1, m2]);

    let requirement = RequirementSpec::new(0.05, 2.0)
        .with_max_kelvin(4.0)
        .with_field(Axis::X, 2.0, FieldDirection::Parallel);
    assert_eq!(scheduler.compatible_machines(&requirement).unwrap(), vec![1]);

    let entry = scheduler
        .submit(SubmitRequest::new("ana", "Hall bar", requirement))
        .await
        .unwrap();
    assert_eq!(entry.machine_id, 1);
    assert_eq!(entry.position, Some(1));
}

#[tokio::test]
async fn test_no_match_lists_every_machine() {
    let (scheduler, _) = build(vec![
        fridge(1, "Low", 0.01, 2.0, 0.0),
        fridge(2, "High", 10.0, 300.0, 0.0),
    ]);
    let err = scheduler
        .submit(SubmitRequest::new(
            "ana",
            "too warm and too cold",
            RequirementSpec::new(1.0, 1.0).with_max_kelvin(20.0),
        ))
        .await
        .unwrap_err();
    let SchedulerError::NoMatch(no_match) = err else {
        panic!("expected no match");
    };
    assert_eq!(no_match.rejections.len(), 2);
    assert_eq!(no_match.rejections[0].machine_id, 1);
    assert_eq!(no_match.rejections[1].machine_id, 2);
    assert!(scheduler.snapshot(1).unwrap().queue.is_empty());
}

#[tokio::test]
async fn test_unavailable_machines_are_not_offered() {
    let (scheduler, _) = build(vec![
        fridge(1, "Down", 1.0, 300.0, 0.0).with_status(MachineStatus::Maintenance, false),
        fridge(2, "Up", 1.0, 300.0, 0.0),
    ]);
    let entry = submit(&scheduler, "sweep", 1.0).await;
    assert_eq!(entry.machine_id, 2);

    scheduler
        .on_machine_status_changed(2, MachineStatus::Idle, false)
        .await
        .unwrap();
    let err = scheduler
        .submit(SubmitRequest::new("ana", "x", RequirementSpec::new(4.0, 1.0)))
        .await
        .unwrap_err();
    let SchedulerError::NoMatch(no_match) = err else {
        panic!("expected no match");
    };
    assert!(no_match
        .rejections
        .iter()
        .all(|r| r.reason == RejectReason::Unavailable));
}

#[tokio::test]
async fn test_shortest_wait_wins() {
    let (scheduler, _) = build(vec![
        fridge(1, "A", 1.0, 300.0, 0.0),
        fridge(2, "B", 1.0, 300.0, 0.0),
    ]);
    let first = submit(&scheduler, "long", 10.0).await;
    assert_eq!(first.machine_id, 1);
    let second = submit(&scheduler, "short", 1.0).await;
    assert_eq!(second.machine_id, 2);
    let third = submit(&scheduler, "next", 1.0).await;
    assert_eq!(third.machine_id, 2);
    assert_eq!(third.estimated_start, Some(t0() + Duration::hours(1)));
}

#[tokio::test]
async fn test_rush_submission_takes_rank_one() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    let mut rx = scheduler.subscribe();

    let rush = scheduler
        .submit(SubmitRequest::new(
            "dana",
            "deadline",
            RequirementSpec::new(4.0, 1.0).with_rush("paper revision due"),
        ))
        .await
        .unwrap();
    assert_eq!(rush.position, Some(1));

    let snapshot = scheduler.snapshot(1).unwrap();
    let order: Vec<_> = snapshot.queue.iter().map(|e| e.id).collect();
    assert_eq!(order, vec![rush.id, a.id, b.id]);
    assert_contiguous(&scheduler, 1);

    let events = drain(&mut rx);
    let moved: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::QueuePositionChanged)
        .map(|e| (e.entry_id, e.new_position))
        .collect();
    assert_eq!(moved, vec![(a.id, Some(2)), (b.id, Some(3))]);
    let ready: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ReadyForCheckIn)
        .collect();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].entry_id, rush.id);
    assert!(!ready[0].suppressible);
}

#[tokio::test]
async fn test_cancel_compacts_and_shortens_waits() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let mut ids = Vec::new();
    for title in ["e1", "e2", "e3", "e4"] {
        ids.push(submit(&scheduler, title, 1.0).await.id);
    }
    let before = scheduler.entry(ids[2]).await.unwrap();
    assert_eq!(before.position, Some(3));
    let mut rx = scheduler.subscribe();

    let cancelled = scheduler.cancel(ids[1], "admin").await.unwrap();
    assert_eq!(cancelled.status, EntryStatus::Cancelled);
    assert!(cancelled.position.is_none());

    let after = scheduler.entry(ids[2]).await.unwrap();
    assert_eq!(after.position, Some(2));
    assert_eq!(
        before.estimated_start.unwrap() - after.estimated_start.unwrap(),
        Duration::minutes(90)
    );
    assert_eq!(scheduler.entry(ids[3]).await.unwrap().position, Some(3));
    assert_contiguous(&scheduler, 1);

    let snapshot = scheduler.snapshot(1).unwrap();
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.history[0].id, ids[1]);

    let events = drain(&mut rx);
    assert_eq!(events[0].kind, EventKind::Cancelled);
    assert_eq!(events[0].reason, "cancelled by admin");
    let moved = events
        .iter()
        .filter(|e| e.kind == EventKind::QueuePositionChanged)
        .count();
    assert_eq!(moved, 2);

    let err = scheduler.cancel(ids[1], "admin").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}

#[tokio::test]
async fn test_maintenance_notice_ignores_available_flag() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let mut rx = scheduler.subscribe();
    let head = submit(&scheduler, "A", 1.0).await;
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ReadyForCheckIn);

    let machine = scheduler
        .on_machine_status_changed(1, MachineStatus::Maintenance, true)
        .await
        .unwrap();
    assert_eq!(machine.status(), MachineStatus::Maintenance);
    assert!(!machine.is_available());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].entry_id, head.id);
    assert_eq!(events[0].kind, EventKind::OnDeck);
    assert_eq!(events[0].reason, "machine_maintenance");

    // Re-reporting the same state does not notify again.
    scheduler
        .on_machine_status_changed(1, MachineStatus::Maintenance, false)
        .await
        .unwrap();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_set_position_stays_contiguous() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(submit(&scheduler, &format!("e{}", i), 1.0).await.id);
    }

    let (s1, s2) = (scheduler.clone(), scheduler.clone());
    let (x, y) = (ids[4], ids[5]);
    let first = tokio::spawn(async move { s1.set_position(x, 1).await });
    let second = tokio::spawn(async move { s2.set_position(y, 1).await });
    let results = [first.await.unwrap(), second.await.unwrap()];

    for result in &results {
        match result {
            Ok(entry) => assert!(entry.position.is_some()),
            Err(err) => assert_eq!(err.kind(), "conflict"),
        }
    }
    assert_contiguous(&scheduler, 1);
    let head = scheduler.snapshot(1).unwrap().queue[0].id;
    assert!(head == x || head == y);
}

#[tokio::test]
async fn test_moves_at_boundaries_are_noops() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    let mut rx = scheduler.subscribe();

    let unchanged = scheduler.move_up(a.id).await.unwrap();
    assert_eq!(unchanged.position, Some(1));
    let unchanged = scheduler.move_down(b.id).await.unwrap();
    assert_eq!(unchanged.position, Some(2));
    let unchanged = scheduler.set_position(b.id, 2).await.unwrap();
    assert_eq!(unchanged.position, Some(2));
    assert!(drain(&mut rx).is_empty());

    let moved = scheduler.move_up(b.id).await.unwrap();
    assert_eq!(moved.position, Some(1));
    assert_eq!(scheduler.entry(a.id).await.unwrap().position, Some(2));
    assert_contiguous(&scheduler, 1);
}

#[tokio::test]
async fn test_set_position_rules() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let _b = submit(&scheduler, "B", 1.0).await;
    let _c = submit(&scheduler, "C", 1.0).await;

    let err = scheduler.set_position(a.id, 0).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_position");

    let moved = scheduler.set_position(a.id, 50).await.unwrap();
    assert_eq!(moved.position, Some(3));
    assert_contiguous(&scheduler, 1);

    let err = scheduler
        .set_position(uuid::Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "entry_not_found");
}

#[tokio::test]
async fn test_reassign_checks_compatibility() {
    let m1 = fridge(1, "Wide", 0.01, 300.0, 0.0);
    let m2 = fridge(2, "Warm", 3.0, 300.0, 0.0);
    let (scheduler, _) = build(vec![m1, m2]);

    let cold = scheduler
        .submit(SubmitRequest::new(
            "ana",
            "cold",
            RequirementSpec::new(0.05, 1.0),
        ))
        .await
        .unwrap();
    assert_eq!(cold.machine_id, 1);

    let err = scheduler.reassign(cold.id, 2).await.unwrap_err();
    let SchedulerError::IncompatibleReassignment { reason, .. } = &err else {
        panic!("expected incompatible reassignment, got {err:?}");
    };
    assert_eq!(reason.criterion(), "temperature");
    assert_eq!(scheduler.entry(cold.id).await.unwrap().machine_id, 1);
    assert_eq!(scheduler.snapshot(1).unwrap().queue.len(), 1);

    let err = scheduler.reassign(cold.id, 9).await.unwrap_err();
    assert_eq!(err.kind(), "machine_not_found");

    let same = scheduler.reassign(cold.id, 1).await.unwrap();
    assert_eq!(same, scheduler.entry(cold.id).await.unwrap());
}

#[tokio::test]
async fn test_reassign_moves_between_queues() {
    let (scheduler, _) = build(vec![
        fridge(1, "A", 1.0, 300.0, 0.0),
        fridge(2, "B", 1.0, 300.0, 0.0),
    ]);
    let first = submit(&scheduler, "first", 5.0).await;
    let other = submit(&scheduler, "other", 1.0).await;
    let second = submit(&scheduler, "second", 1.0).await;
    assert_eq!(first.machine_id, 1);
    assert_eq!(other.machine_id, 2);
    assert_eq!(second.machine_id, 2);
    let mut rx = scheduler.subscribe();

    let moved = scheduler.reassign(other.id, 1).await.unwrap();
    assert_eq!(moved.machine_id, 1);
    assert_eq!(moved.position, Some(2));
    assert_eq!(moved.status, EntryStatus::Queued);
    assert_eq!(moved.estimated_start, Some(t0() + Duration::hours(5)));

    assert_eq!(scheduler.entry(second.id).await.unwrap().position, Some(1));
    assert!(scheduler
        .snapshot(2)
        .unwrap()
        .history
        .iter()
        .all(|e| e.id != other.id));
    assert_contiguous(&scheduler, 1);
    assert_contiguous(&scheduler, 2);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| e.entry_id == other.id && e.reason.contains("reassigned")));
    assert!(events
        .iter()
        .any(|e| e.entry_id == second.id && e.kind == EventKind::ReadyForCheckIn));
}

#[tokio::test]
async fn test_check_in_and_out_drive_machine_status() {
    let (scheduler, clock) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 2.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    let mut rx = scheduler.subscribe();

    let err = scheduler.check_in(b.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");

    let running = scheduler.check_in(a.id).await.unwrap();
    assert_eq!(running.status, EntryStatus::Running);
    assert_eq!(running.started_at, Some(t0()));
    assert!(running.position.is_none());

    let snapshot = scheduler.snapshot(1).unwrap();
    assert_eq!(snapshot.machine.status(), MachineStatus::Running);
    assert_eq!(
        snapshot.machine.estimated_available_at(),
        Some(t0() + Duration::minutes(150))
    );
    assert_eq!(snapshot.running.as_ref().map(|e| e.id), Some(a.id));
    let waiting = snapshot.find(&b.id).unwrap();
    assert_eq!(waiting.position, Some(1));
    assert_eq!(waiting.estimated_start, Some(t0() + Duration::minutes(150)));

    let events = drain(&mut rx);
    let notice = events.iter().find(|e| e.entry_id == b.id && e.kind == EventKind::OnDeck);
    assert_eq!(notice.map(|e| e.reason.as_str()), Some("machine_running"));

    clock.advance(Duration::hours(2));
    let done = scheduler.check_out(a.id).await.unwrap();
    assert_eq!(done.status, EntryStatus::Completed);
    assert_eq!(done.completed_at, Some(t0() + Duration::hours(2)));

    let snapshot = scheduler.snapshot(1).unwrap();
    assert_eq!(snapshot.machine.status(), MachineStatus::Cooldown);
    let ready_at = t0() + Duration::minutes(150);
    assert_eq!(snapshot.machine.estimated_available_at(), Some(ready_at));

    let events = drain(&mut rx);
    let cooldown = events
        .iter()
        .find(|e| e.entry_id == b.id)
        .expect("cooldown notice");
    assert_eq!(cooldown.reason, "machine_cooldown");
    assert_eq!(cooldown.available_at, Some(ready_at));

    scheduler
        .on_machine_status_changed(1, MachineStatus::Idle, true)
        .await
        .unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ReadyForCheckIn);
    assert_eq!(events[0].entry_id, b.id);

    let err = scheduler.check_out(a.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}

#[tokio::test]
async fn test_check_out_on_unavailable_machine_enters_maintenance() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 1.0).await;
    scheduler.check_in(a.id).await.unwrap();
    scheduler
        .on_machine_status_changed(1, MachineStatus::Running, false)
        .await
        .unwrap();
    scheduler.check_out(a.id).await.unwrap();
    let machine = scheduler.snapshot(1).unwrap().machine.clone();
    assert_eq!(machine.status(), MachineStatus::Maintenance);
    assert!(!machine.is_available());
}

#[tokio::test]
async fn test_check_in_refused_when_machine_unavailable() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    let a = submit(&scheduler, "A", 1.0).await;
    scheduler
        .on_machine_status_changed(1, MachineStatus::Maintenance, false)
        .await
        .unwrap();
    let err = scheduler.check_in(a.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert_eq!(scheduler.entry(a.id).await.unwrap().status, EntryStatus::Queued);
}

#[tokio::test]
async fn test_undo_check_in_restores_rank_one() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    scheduler.check_in(a.id).await.unwrap();
    assert_eq!(scheduler.entry(b.id).await.unwrap().position, Some(1));

    let restored = scheduler.undo_check_in(a.id).await.unwrap();
    assert_eq!(restored.status, EntryStatus::Queued);
    assert_eq!(restored.position, Some(1));
    assert!(restored.started_at.is_none());
    assert_eq!(scheduler.entry(b.id).await.unwrap().position, Some(2));
    let machine = scheduler.snapshot(1).unwrap().machine.clone();
    assert_eq!(machine.status(), MachineStatus::Idle);
    assert_contiguous(&scheduler, 1);

    scheduler.check_in(a.id).await.unwrap();
    scheduler
        .on_machine_status_changed(1, MachineStatus::Maintenance, false)
        .await
        .unwrap();
    let err = scheduler.undo_check_in(a.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert_eq!(
        scheduler.snapshot(1).unwrap().machine.status(),
        MachineStatus::Maintenance
    );
}

#[tokio::test]
async fn test_rush_appeal_lifecycle() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    let c = submit(&scheduler, "C", 1.0).await;

    let err = scheduler.request_rush(c.id, "  ").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
    let err = scheduler.approve_rush(c.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");

    let pending = scheduler.request_rush(c.id, "sample degrades").await.unwrap();
    assert!(pending.rush_pending);
    assert_eq!(pending.position, Some(3));

    let approved = scheduler.approve_rush(c.id).await.unwrap();
    assert!(!approved.rush_pending);
    assert!(approved.is_rush());
    assert_eq!(approved.position, Some(1));
    assert_eq!(scheduler.entry(a.id).await.unwrap().position, Some(2));

    scheduler.request_rush(b.id, "conference").await.unwrap();
    let rejected = scheduler.reject_rush(b.id).await.unwrap();
    assert!(!rejected.rush_pending);
    assert_eq!(rejected.position, Some(3));
    assert_contiguous(&scheduler, 1);
}

#[tokio::test]
async fn test_repair_refreshes_stale_estimates() {
    let (scheduler, clock) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    submit(&scheduler, "A", 1.0).await;
    submit(&scheduler, "B", 1.0).await;
    assert!(!scheduler.repair_queue(1).await.unwrap());

    clock.advance(Duration::minutes(30));
    assert!(scheduler.repair_queue(1).await.unwrap());
    let snapshot = scheduler.snapshot(1).unwrap();
    assert_eq!(
        snapshot.queue[0].estimated_start,
        Some(t0() + Duration::minutes(30))
    );

    let err = scheduler.repair_queue(42).await.unwrap_err();
    assert_eq!(err.kind(), "machine_not_found");
}

#[tokio::test]
async fn test_cooldown_without_timestamp_gets_one() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 1.5)]);
    let machine = scheduler
        .on_machine_status_changed(1, MachineStatus::Cooldown, true)
        .await
        .unwrap();
    assert_eq!(
        machine.estimated_available_at(),
        Some(t0() + Duration::minutes(90))
    );
    let entry = submit(&scheduler, "A", 1.0).await;
    assert_eq!(entry.estimated_start, Some(t0() + Duration::minutes(90)));
}

#[tokio::test]
async fn test_mixed_operations_keep_positions_contiguous() {
    let (scheduler, clock) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.25)]);
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(submit(&scheduler, &format!("e{}", i), 0.5 + i as f64).await.id);
        assert_contiguous(&scheduler, 1);
    }
    scheduler.cancel(ids[3], "user").await.unwrap();
    assert_contiguous(&scheduler, 1);
    scheduler.set_position(ids[7], 2).await.unwrap();
    assert_contiguous(&scheduler, 1);
    scheduler.move_down(ids[0]).await.unwrap();
    assert_contiguous(&scheduler, 1);
    clock.advance(Duration::minutes(10));
    scheduler.move_up(ids[5]).await.unwrap();
    assert_contiguous(&scheduler, 1);
    scheduler.cancel(ids[7], "user").await.unwrap();
    assert_contiguous(&scheduler, 1);
    let head = scheduler.snapshot(1).unwrap().queue[0].id;
    scheduler.check_in(head).await.unwrap();
    assert_contiguous(&scheduler, 1);
    assert_eq!(scheduler.snapshot(1).unwrap().queue.len(), 5);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.0)]);
    let cases = [
        SubmitRequest::new("ana", "", RequirementSpec::new(4.0, 1.0)),
        SubmitRequest::new("ana", "x", RequirementSpec::new(4.0, 0.0)),
        SubmitRequest::new("ana", "x", RequirementSpec::new(4.0, 1.0).with_max_kelvin(2.0)),
    ];
    for request in cases {
        let err = scheduler.submit(request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
    assert!(scheduler.snapshot(1).unwrap().queue.is_empty());
}

#[tokio::test]
async fn test_oversized_duration_is_rejected_without_panicking() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let err = scheduler
        .submit(SubmitRequest::new("ana", "forever", RequirementSpec::new(4.0, 1e13)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
    assert!(scheduler.preview(&RequirementSpec::new(4.0, 1e13)).is_err());
    assert!(scheduler.snapshot(1).unwrap().queue.is_empty());

    submit(&scheduler, "A", 1.0).await;
    assert_contiguous(&scheduler, 1);
}

#[tokio::test]
async fn test_negative_cooldown_fleet_is_refused() {
    let clock = Arc::new(ManualClock::new(t0()));
    let result = Scheduler::with_clock(
        SchedulerConfig::default(),
        vec![fridge(1, "Hidalgo", 1.0, 300.0, -5.0)],
        clock,
    );
    assert!(matches!(
        result.err(),
        Some(cryoqueue::error::ConfigError::InvalidMachine { id: 1, .. })
    ));
}

#[tokio::test]
async fn test_idle_refused_while_entry_running() {
    let (scheduler, _) = build(vec![fridge(1, "Hidalgo", 1.0, 300.0, 0.5)]);
    let a = submit(&scheduler, "A", 1.0).await;
    let b = submit(&scheduler, "B", 1.0).await;
    scheduler.check_in(a.id).await.unwrap();
    let mut rx = scheduler.subscribe();

    for status in [MachineStatus::Idle, MachineStatus::Cooldown] {
        let err = scheduler
            .on_machine_status_changed(1, status, true)
            .await
            .unwrap_err();
        match err {
            SchedulerError::InvalidTransition { entry_id, .. } => assert_eq!(entry_id, a.id),
            other => panic!("unexpected error: {other}"),
        }
    }
    assert!(drain(&mut rx)
        .iter()
        .all(|e| e.kind != EventKind::ReadyForCheckIn));

    let snapshot = scheduler.snapshot(1).unwrap();
    assert_eq!(snapshot.machine.status(), MachineStatus::Running);
    assert_eq!(snapshot.running.as_ref().map(|e| e.id), Some(a.id));

    // Maintenance is still accepted; the running entry can be checked out.
    scheduler
        .on_machine_status_changed(1, MachineStatus::Maintenance, false)
        .await
        .unwrap();
    scheduler.check_out(a.id).await.unwrap();
    assert_eq!(scheduler.entry(b.id).await.unwrap().position, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_reassigns_never_deadlock() {
    let config = SchedulerConfig::default().with_lock_timeout(std::time::Duration::from_millis(200));
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Arc::new(
        Scheduler::with_clock(
            config,
            vec![
                fridge(1, "Hidalgo", 1.0, 300.0, 0.5),
                fridge(2, "Griffin", 1.0, 300.0, 0.5),
            ],
            clock,
        )
        .unwrap(),
    );
    let x = submit(&scheduler, "X", 1.0).await;
    let y = submit(&scheduler, "Y", 1.0).await;
    assert_ne!(x.machine_id, y.machine_id);
    for i in 0..4 {
        submit(&scheduler, &format!("pad{}", i), 1.0).await;
    }

    let (x_id, y_id) = (x.id, y.id);
    for _ in 0..50 {
        let x_to = if scheduler.entry(x_id).await.unwrap().machine_id == 1 { 2 } else { 1 };
        let y_to = if x_to == 1 { 2 } else { 1 };
        let (s1, s2) = (scheduler.clone(), scheduler.clone());
        let first = tokio::spawn(async move { s1.reassign(x_id, x_to).await });
        let second = tokio::spawn(async move { s2.reassign(y_id, y_to).await });
        let joined = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            (first.await.unwrap(), second.await.unwrap())
        })
        .await
        .expect("reassignments deadlocked");

        for result in [joined.0, joined.1] {
            match result {
                Ok(entry) => assert!(entry.position.is_some()),
                Err(err) => assert_eq!(err.kind(), "conflict"),
            }
        }
        assert_contiguous(&scheduler, 1);
        assert_contiguous(&scheduler, 2);
    }

    let total: usize = scheduler.snapshots().iter().map(|s| s.queue.len()).sum();
    assert_eq!(total, 6);
}
