//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Active/standby failover coordination."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use failover_common::config::{PolicyKind, Role};
use failover_control::{ControlCommand, MockControlService, WorkerHandle, WorkerStatus};
use failover_redundancy::{
    CycleOutcome, DesiredState, FailoverStateMachine, LivenessTracker, ObservedState,
};

const UUID: &str = "0f5e3a";

fn state_machine(role: Role, control: &MockControlService) -> FailoverStateMachine {
    FailoverStateMachine::new(
        failover_redundancy::policy_for(role, PolicyKind::Simple),
        Arc::new(control.clone()),
        Some(WorkerHandle::new(UUID)),
        "platform.driver",
    )
}

fn control() -> MockControlService {
    MockControlService::new().with_agent(UUID, Some("platform.driver"))
}

#[test]
fn countdown_is_non_increasing_between_resets() {
    let tracker = LivenessTracker::new("simple_primary", "central", 5);
    // Heartbeat pattern: a burst, a gap long enough to go dead, then sporadic beats.
    let arrivals = [0, 1, 2, 9, 10, 14, 21];
    let mut previous = tracker.countdowns().peer;
    for tick in 0..30 {
        if arrivals.contains(&tick) {
            tracker.on_peer_heartbeat();
            assert_eq!(tracker.countdowns().peer, 5);
        } else {
            assert!(tracker.countdowns().peer <= previous);
        }
        previous = tracker.countdowns().peer;
        tracker.tick();
        assert!(tracker.countdowns().peer <= previous);
        previous = tracker.countdowns().peer;
    }
}

#[tokio::test]
async fn secondary_never_runs_while_peer_alive() {
    let control = control();
    control.set_status(UUID, WorkerStatus::running(5));
    let mut sm = state_machine(Role::Secondary, &control);

    let history = [
        ObservedState::new(false, false),
        ObservedState::new(true, false),
        ObservedState::new(false, true),
        ObservedState::new(true, true),
        ObservedState::new(true, false),
    ];
    for observed in history {
        let outcome = sm.evaluate(observed).await;
        if observed.peer_alive {
            assert!(matches!(
                outcome,
                CycleOutcome::Stopped | CycleOutcome::Unchanged(DesiredState::Stopped)
            ));
            assert!(!control.status_of(UUID).unwrap().is_running());
        }
    }
}

#[tokio::test]
async fn secondary_activation_issues_one_start_per_tick() {
    let control = control();
    let mut sm = state_machine(Role::Secondary, &control);
    let tracker = LivenessTracker::new("simple_primary", "central", 2);
    tracker.on_peer_heartbeat();

    // Starts keep failing for a while; each pulse still issues at most one.
    control.fail_next(ControlCommand::Start, 3);
    let mut starts_seen = 0;
    for _ in 0..8 {
        let observed = tracker.tick();
        sm.evaluate(observed).await;
        let starts = control.count(ControlCommand::Start);
        assert!(starts - starts_seen <= 1);
        starts_seen = starts;
    }
    assert_eq!(starts_seen, 4);
    assert!(control.status_of(UUID).unwrap().is_running());
}

#[tokio::test]
async fn secondary_with_dead_peer_starts_stopped_worker_once() {
    let control = control();
    control.set_status(UUID, WorkerStatus::from((Some(0), None)));
    let mut sm = state_machine(Role::Secondary, &control);

    sm.evaluate(ObservedState::new(false, false)).await;
    assert_eq!(control.count(ControlCommand::Start), 1);
    assert_eq!(control.count(ControlCommand::Stop), 0);
}

#[tokio::test]
async fn secondary_with_live_peer_stops_running_worker_once() {
    let control = control();
    control.set_status(UUID, WorkerStatus::running(123));
    let mut sm = state_machine(Role::Secondary, &control);

    sm.evaluate(ObservedState::new(true, false)).await;
    assert_eq!(control.count(ControlCommand::Stop), 1);
    assert_eq!(control.count(ControlCommand::Start), 0);
}

#[tokio::test]
async fn primary_status_error_is_retried_next_tick() {
    let control = control();
    control.fail_next(ControlCommand::Status, 1);
    let mut sm = state_machine(Role::Primary, &control);

    let first = sm.evaluate(ObservedState::new(true, true)).await;
    assert!(matches!(first, CycleOutcome::Failed(_)));
    let second = sm.evaluate(ObservedState::new(true, true)).await;
    assert_eq!(second, CycleOutcome::Started);
    assert_eq!(control.count(ControlCommand::Status), 2);
}

#[tokio::test]
async fn primary_never_stops_its_worker() {
    let control = control();
    control.set_status(UUID, WorkerStatus::running(9));
    let mut sm = state_machine(Role::Primary, &control);

    for observed in [
        ObservedState::new(true, true),
        ObservedState::new(false, true),
        ObservedState::new(true, false),
        ObservedState::new(false, false),
    ] {
        assert_eq!(
            sm.evaluate(observed).await,
            CycleOutcome::Unchanged(DesiredState::Running)
        );
    }
    assert_eq!(control.count(ControlCommand::Stop), 0);
}

#[tokio::test]
async fn secondary_keeps_stopping_while_status_is_unavailable() {
    let control = control();
    control.set_status(UUID, WorkerStatus::running(123));
    control.fail_next(ControlCommand::Status, 5);
    let mut sm = state_machine(Role::Secondary, &control);

    for _ in 0..5 {
        let outcome = sm.evaluate(ObservedState::new(true, false)).await;
        assert!(matches!(outcome, CycleOutcome::Stopped));
    }
    assert!(control.count(ControlCommand::Stop) >= 1);
    assert!(!control.status_of(UUID).unwrap().is_running());
    assert_eq!(control.count(ControlCommand::Start), 0);
}

#[tokio::test]
async fn secondary_retries_stop_after_status_and_stop_fail() {
    let control = control();
    control.set_status(UUID, WorkerStatus::running(123));
    control.fail_next(ControlCommand::Status, 1);
    control.fail_next(ControlCommand::Stop, 1);
    let mut sm = state_machine(Role::Secondary, &control);
    let peer_alive = ObservedState::new(true, false);

    let first = sm.evaluate(peer_alive).await;
    assert!(matches!(first, CycleOutcome::Failed(_)));
    assert_eq!(control.count(ControlCommand::Stop), 1);
    assert!(control.status_of(UUID).unwrap().is_running());

    assert_eq!(sm.evaluate(peer_alive).await, CycleOutcome::Stopped);
    assert_eq!(control.count(ControlCommand::Stop), 2);
    assert!(!control.status_of(UUID).unwrap().is_running());

    assert_eq!(
        sm.evaluate(peer_alive).await,
        CycleOutcome::Unchanged(DesiredState::Stopped)
    );
    assert_eq!(control.count(ControlCommand::Stop), 2);
    assert_eq!(control.count(ControlCommand::Start), 0);
}
