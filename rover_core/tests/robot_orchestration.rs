use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rover_core::events::{EmergencyAlert, Event, EventKind, EventPayload, EventPriority, NavigationReport, Severity};
use rover_core::localization::Wheel;
use rover_core::prelude::*;

#[derive(Default)]
struct RecordingMotors {
    commands: Mutex<Vec<NavigationCommand>>,
    stops: AtomicUsize,
    emergency_stops: AtomicUsize,
}

impl MotorDriver for RecordingMotors {
    fn execute(&self, command: &NavigationCommand) -> AnyResult<()> {
        self.commands.lock().push(*command);
        Ok(())
    }

    fn stop_all(&self) -> AnyResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn emergency_stop(&self) -> AnyResult<()> {
        self.emergency_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rover(estimators: bool) -> (RoverSystem, Arc<RecordingMotors>) {
    let mut config = RoverConfig::default();
    config.robot.estimators_enabled = estimators;
    config.robot.control_interval_ms = 20;
    let motors = Arc::new(RecordingMotors::default());
    (RoverSystem::new(config, motors.clone()).unwrap(), motors)
}

async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_encoder_pulses_reach_the_planner() {
    let (rover, _motors) = rover(true);
    assert!(rover.start().await);

    // 1000 pulses per wheel, fed in batches: 0.314 m straight ahead
    let encoder = rover.encoder().clone();
    let mut at = Instant::now();
    for _ in 0..10 {
        for _ in 0..100 {
            at += Duration::from_millis(2);
            encoder.record_pulse_at(Wheel::Left, at);
            encoder.record_pulse_at(Wheel::Right, at);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(
        eventually(Duration::from_secs(2), || rover.fused_pose().pose.x > 0.15).await,
        "fused pose stuck at {:?}",
        rover.fused_pose().pose
    );
    let fused = rover.fused_pose();
    assert!(fused.pose.x < 0.6);
    assert!(fused.pose.y.abs() < 0.05);
    assert!(fused.health.odometry);

    assert!(eventually(Duration::from_secs(1), || rover.status().planner.pose.x > 0.15).await);

    let recent = rover.bus().recent_events(200);
    assert!(recent.iter().any(|r| r.source == "Odometry"));
    assert!(recent.iter().any(|r| r.source == "SensorFusion"));

    rover.shutdown().await.unwrap();
    assert_eq!(rover.state_machine().current_state(), RobotState::Shutdown);
}

#[tokio::test]
async fn test_control_loop_drives_until_stopped() {
    let (rover, motors) = rover(false);
    assert!(rover.start().await);
    rover.set_navigation_goal(Point::new(2.0, 0.0)).await.unwrap();

    let readings = SensorSnapshot::default()
        .with_distance("front", 1.5)
        .with_battery(12.1);
    rover
        .run_control_loop(
            || (Some(readings.clone()), Vec::new()),
            tokio::time::sleep(Duration::from_millis(150)),
        )
        .await;

    let commands = motors.commands.lock().clone();
    assert!(commands.len() >= 2, "only {} commands", commands.len());
    assert!(commands.iter().all(|c| c.kind == CommandKind::PurePursuit));
    assert_eq!(rover.state_machine().current_state(), RobotState::Navigating);
    assert_eq!(rover.battery_voltage(), Some(12.1));
}

#[tokio::test]
async fn test_external_emergency_interrupts_navigation() {
    let (rover, motors) = rover(false);
    assert!(rover.start().await);
    rover.set_navigation_goal(Point::new(2.0, 0.0)).await.unwrap();
    assert!(rover.control_tick(None, &[]).await.is_some());

    let alert = EmergencyAlert::new("bumper", Severity::High, "front bumper pressed");
    rover
        .bus()
        .publish(Event::new("bumper", EventPayload::Emergency(alert)), EventPriority::Critical);
    assert!(
        eventually(Duration::from_secs(1), || {
            rover.state_machine().current_state() == RobotState::EmergencyStop
        })
        .await
    );
    assert!(rover.is_emergency_active());
    assert_eq!(motors.emergency_stops.load(Ordering::SeqCst), 1);

    // Nothing reaches the motors while latched
    let sent = motors.commands.lock().len();
    assert!(rover.control_tick(None, &[]).await.is_none());
    assert_eq!(motors.commands.lock().len(), sent);

    assert!(rover.resume_from_emergency().await);
    rover.set_navigation_goal(Point::new(-1.0, 0.5)).await.unwrap();
    assert_eq!(rover.state_machine().current_state(), RobotState::Navigating);

    let transitions: Vec<(RobotState, StateChangeReason)> = rover
        .state_machine()
        .history(None)
        .iter()
        .filter(|t| t.success)
        .map(|t| (t.to, t.reason))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RobotState::Idle, StateChangeReason::SystemInit),
            (RobotState::Navigating, StateChangeReason::NewTaskAssigned),
            (RobotState::EmergencyStop, StateChangeReason::EmergencyButton),
            (RobotState::Idle, StateChangeReason::ManualRecovery),
            (RobotState::Navigating, StateChangeReason::NewTaskAssigned),
        ]
    );
}

#[tokio::test]
async fn test_goal_completion_is_announced() {
    let (rover, _motors) = rover(false);
    assert!(rover.start().await);

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    rover.bus().subscribe(EventKind::Navigation, move |event| {
        if let EventPayload::Navigation(update) = &event.payload {
            sink.lock().push(update.report);
        }
        async { Ok(()) }
    });

    rover.set_navigation_goal(Point::new(1.0, 0.0)).await.unwrap();
    rover.update_pose(Pose2D::new(0.95, 0.0, 0.0));
    let cmd = rover.control_tick(None, &[]).await.unwrap();
    assert_eq!(cmd.kind, CommandKind::Stop);
    assert_eq!(rover.state_machine().current_state(), RobotState::Idle);

    assert!(
        eventually(Duration::from_secs(1), || {
            reports.lock().contains(&NavigationReport::GoalReached)
        })
        .await
    );
    assert_eq!(reports.lock()[0], NavigationReport::PathPlanned);
}

#[tokio::test]
async fn test_shutdown_stops_estimators_and_bus() {
    let (rover, motors) = rover(true);
    assert!(rover.start().await);
    tokio::time::sleep(Duration::from_millis(60)).await;

    rover.shutdown().await.unwrap();
    assert_eq!(rover.state_machine().current_state(), RobotState::Shutdown);
    assert!(!rover.bus().is_running());
    assert!(motors.stops.load(Ordering::SeqCst) >= 1);

    let status = rover.status();
    assert_eq!(status.state, RobotState::Shutdown);
    assert!(!status.bus.is_running);
}
