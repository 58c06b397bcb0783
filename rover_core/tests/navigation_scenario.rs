use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use rover_core::config::PlannerConfig;
use rover_core::events::{EmergencyAlert, Event, EventBus, EventKind, EventPayload, EventPriority, Severity};
use rover_core::messages::{now_secs, CommandKind, ObstacleObservation, Point, Pose2D};
use rover_core::navigation::{PathPlanner, PlannerState, StaticMap};
use rover_core::sensors::SensorSnapshot;
use rover_core::state_machine::{RobotState, RobotStateMachine, StateChangeReason};

#[test]
fn test_drive_to_goal_three_meters_ahead() {
    let mut planner = PathPlanner::new(PlannerConfig::default());
    assert_eq!(planner.state(), PlannerState::Idle);

    planner.update_pose(Pose2D::new(0.0, 0.0, 0.0));
    assert!(planner.set_goal(Point::new(3.0, 0.0)));
    assert_eq!(planner.state(), PlannerState::FollowingPath);
    assert!(!planner.path().is_empty());

    let now = now_secs();
    let cmd = planner.next_command(None, now).unwrap();
    assert_eq!(cmd.kind, CommandKind::PurePursuit);
    assert!(cmd.linear_speed > 0.0);
    assert!(cmd.angular_speed.abs() < 0.25, "angular {}", cmd.angular_speed);

    planner.update_pose(Pose2D::new(2.95, 0.0, 0.0));
    let cmd = planner.next_command(None, now).unwrap();
    assert_eq!(cmd.kind, CommandKind::Stop);
    assert_abs_diff_eq!(cmd.linear_speed, 0.0);
    assert_abs_diff_eq!(cmd.angular_speed, 0.0);
    assert_eq!(planner.state(), PlannerState::ReachedGoal);
}

#[test]
fn test_close_range_reading_overrides_path_following() {
    let mut planner = PathPlanner::new(PlannerConfig::default());
    assert!(planner.set_goal(Point::new(3.0, 0.0)));

    let sensors = SensorSnapshot::default()
        .with_distance("front", 0.15)
        .with_distance("rear", 2.0);
    let cmd = planner.next_command(Some(&sensors), now_secs()).unwrap();
    assert_eq!(cmd.kind, CommandKind::EmergencyStop);
    assert!(cmd.kind.is_halt());
}

#[test]
fn test_obstacle_ahead_switches_to_local_avoidance() {
    let mut planner = PathPlanner::new(PlannerConfig {
        max_iterations: 20_000,
        ..PlannerConfig::default()
    });
    assert!(planner.set_goal(Point::new(3.0, 0.0)));

    let now = now_secs();
    planner.update_obstacles(&[ObstacleObservation::new(1.0, 0.0, 0.9)], now);
    assert_eq!(planner.obstacles().len(), 1);

    let cmd = planner.next_command(None, now).unwrap();
    assert!(
        matches!(cmd.kind, CommandKind::AvoidObstacle | CommandKind::Blocked),
        "unexpected {:?}",
        cmd.kind
    );
    assert_eq!(planner.state(), PlannerState::AvoidingObstacle);

    // The re-planned path steers around the inflated obstacle
    for point in planner.path() {
        assert!(point.distance_to(&Point::new(1.0, 0.0)) > 0.25);
    }
}

#[test]
fn test_static_map_blocks_direct_route() {
    let config = PlannerConfig {
        max_iterations: 20_000,
        ..PlannerConfig::default()
    };
    let mut planner = PathPlanner::new(config);

    // 4 m square map at 0.1 m, a wall in column 30 (x = 1.05 m) with a gap
    // in the top six rows
    let mut data = vec![0u8; 40 * 40];
    for row in 0..34 {
        data[row * 40 + 30] = 100;
    }
    let map = StaticMap::new(40, 40, 0.1, (-1.95, -1.95), data).unwrap();
    planner.set_static_map(Some(map));

    assert!(planner.set_goal(Point::new(1.5, 0.0)));
    assert_eq!(planner.state(), PlannerState::FollowingPath);
    assert!(
        planner.path().iter().any(|p| p.y > 1.3),
        "path should pass through the gap"
    );
}

#[tokio::test]
async fn test_bus_delivers_once_and_stops_after_unsubscribe() {
    let bus = EventBus::new(100);
    bus.start();

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let subscription = bus.subscribe(EventKind::Emergency, move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });

    let alert = || {
        Event::new(
            "test",
            EventPayload::Emergency(EmergencyAlert::new("manual_stop", Severity::High, "drill")),
        )
    };

    bus.publish(alert(), EventPriority::Critical);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    assert!(bus.unsubscribe(subscription));
    bus.publish(alert(), EventPriority::Critical);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    let stats = bus.stats();
    assert_eq!(stats.events_published, 2);
    assert_eq!(stats.events_by_kind[&EventKind::Emergency], 2);
    bus.stop().await;
    assert!(!bus.is_running());
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let bus = EventBus::new(100);
    let machine = RobotStateMachine::new(bus.clone());

    assert!(machine.transition_to(RobotState::Idle, StateChangeReason::SystemInit, None).await);
    assert!(
        machine
            .transition_to(RobotState::ShuttingDown, StateChangeReason::SystemShutdown, None)
            .await
    );
    assert!(
        machine
            .transition_to(RobotState::Shutdown, StateChangeReason::SystemShutdown, None)
            .await
    );

    for target in [RobotState::Idle, RobotState::Error, RobotState::EmergencyStop] {
        assert!(!machine.transition_to(target, StateChangeReason::UserCommand, None).await);
    }
    assert_eq!(machine.current_state(), RobotState::Shutdown);
    assert!(machine.available_transitions().is_empty());

    let failed = machine.history(None).into_iter().filter(|t| !t.success).count();
    assert_eq!(failed, 3);
    // Successful transitions were announced on the bus
    assert_eq!(bus.stats().events_by_kind[&EventKind::SystemState], 3);
}
