//! Top-level orchestration
//!
//! [`RoverSystem`] owns the event bus, the lifecycle state machine, the
//! estimator loops and the path planner, and forwards motion commands to a
//! [`MotorDriver`]. Hardware collaborators stay behind that trait and the
//! [`EncoderReader`] handle, so the whole system runs without hardware in
//! tests.
//!
//! The control loop is driven from outside: either call
//! [`RoverSystem::control_tick`] with fresh readings, or hand a sampling
//! closure to [`RoverSystem::run_control_loop`].

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::{ready, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RoverConfig;
use crate::error::{RoverError, RoverResult};
use crate::events::bus::{BusStats, SubscriptionId};
use crate::events::{
    EmergencyAlert, Event, EventBus, EventKind, EventPayload, EventPriority, NavigationReport,
    NavigationUpdate, Severity,
};
use crate::localization::{EncoderReader, FusedPose, Odometry, SensorFusion, Wheel, WheelDirection};
use crate::messages::{now_secs, CommandKind, ImuReading, NavigationCommand, ObstacleObservation, Point, Pose2D};
use crate::navigation::{PathPlanner, PlannerState, PlannerStatus, StaticMap};
use crate::runtime::PeriodicTask;
use crate::sensors::{SensorHealth, SensorHealthMonitor, SensorSnapshot};
use crate::state_machine::{RobotState, RobotStateMachine, StateChangeReason};

const SOURCE: &str = "RoverSystem";

/// Wheel motor collaborator
///
/// Implementations translate normalized commands into motor outputs. Calls
/// come from async contexts and must return promptly.
pub trait MotorDriver: Send + Sync + 'static {
    fn execute(&self, command: &NavigationCommand) -> anyhow::Result<()>;

    fn stop_all(&self) -> anyhow::Result<()>;

    /// Immediate halt, bypassing any ramping
    fn emergency_stop(&self) -> anyhow::Result<()>;
}

/// Whole-system snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct RobotStatus {
    pub state: RobotState,
    pub previous_state: Option<RobotState>,
    pub state_duration: f64,
    pub emergency_active: bool,
    pub battery_voltage: Option<f64>,
    pub fused_pose: FusedPose,
    pub planner: PlannerStatus,
    pub last_command: Option<NavigationCommand>,
    pub degraded_sensors: Vec<String>,
    pub bus: BusStats,
}

struct Estimators {
    odometry: Odometry,
    fusion: SensorFusion,
}

struct RunningEstimators {
    odometry: PeriodicTask<Odometry>,
    fusion: PeriodicTask<SensorFusion>,
}

pub struct RoverSystem {
    config: RoverConfig,
    bus: EventBus,
    state_machine: Arc<RobotStateMachine>,
    planner: Arc<Mutex<PathPlanner>>,
    motors: Arc<dyn MotorDriver>,
    encoder: Arc<EncoderReader>,

    emergency: Arc<AtomicBool>,
    battery_voltage: Arc<Mutex<Option<f64>>>,
    imu_tx: Arc<watch::Sender<Option<ImuReading>>>,
    fused_rx: watch::Receiver<FusedPose>,
    sensor_health: Mutex<SensorHealthMonitor>,
    last_command: Mutex<Option<NavigationCommand>>,

    pending: Mutex<Option<Estimators>>,
    running: Mutex<Option<RunningEstimators>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl RoverSystem {
    /// Build every component and register the lifecycle hooks
    ///
    /// Nothing runs until [`start`](Self::start).
    pub fn new(config: RoverConfig, motors: Arc<dyn MotorDriver>) -> RoverResult<Self> {
        config.validate()?;

        let bus = EventBus::new(config.bus.max_history);
        let state_machine = Arc::new(RobotStateMachine::new(bus.clone()));
        let encoder = Arc::new(EncoderReader::new(config.encoder.clone()));

        let odometry = Odometry::new(config.odometry.clone(), encoder.clone(), bus.clone());
        let (imu_tx, imu_rx) = watch::channel(None);
        let fusion = SensorFusion::new(config.fusion.clone(), odometry.subscribe(), imu_rx, bus.clone());
        let fused_rx = fusion.subscribe();

        let planner = Arc::new(Mutex::new(PathPlanner::new(config.planner.clone())));
        let sensor_health = SensorHealthMonitor::new(config.sensors.max_consecutive_failures);

        let system = Self {
            config,
            bus,
            state_machine,
            planner,
            motors,
            encoder,
            emergency: Arc::new(AtomicBool::new(false)),
            battery_voltage: Arc::new(Mutex::new(None)),
            imu_tx: Arc::new(imu_tx),
            fused_rx,
            sensor_health: Mutex::new(sensor_health),
            last_command: Mutex::new(None),
            pending: Mutex::new(Some(Estimators { odometry, fusion })),
            running: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        };
        system.register_state_hooks();
        system.subscribe_events();

        info!("rover system initialized");
        Ok(system)
    }

    pub fn config(&self) -> &RoverConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state_machine(&self) -> &RobotStateMachine {
        &self.state_machine
    }

    /// Pulse sink for the GPIO edge callbacks
    pub fn encoder(&self) -> &Arc<EncoderReader> {
        &self.encoder
    }

    pub fn planner(&self) -> &Mutex<PathPlanner> {
        &self.planner
    }

    pub fn is_emergency_active(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub fn battery_voltage(&self) -> Option<f64> {
        *self.battery_voltage.lock()
    }

    pub fn fused_pose(&self) -> FusedPose {
        *self.fused_rx.borrow()
    }

    pub fn sensor_health(&self) -> BTreeMap<String, SensorHealth> {
        self.sensor_health.lock().report()
    }

    /// Start the bus and estimator loops, then enter Idle
    ///
    /// Requires a tokio runtime. Returns false if the machine was not in
    /// Initializing.
    pub async fn start(&self) -> bool {
        self.bus.start();
        if self.config.robot.estimators_enabled {
            self.spawn_estimators();
        }
        let started = self
            .state_machine
            .transition_to(RobotState::Idle, StateChangeReason::SystemInit, None)
            .await;
        if started {
            info!("rover system started");
        }
        started
    }

    fn spawn_estimators(&self) {
        let Some(estimators) = self.pending.lock().take() else {
            debug!("estimators already running");
            return;
        };
        let odometry = PeriodicTask::spawn(estimators.odometry, self.config.odometry.update_interval());
        let fusion = PeriodicTask::spawn(estimators.fusion, self.config.fusion.update_interval());
        *self.running.lock() = Some(RunningEstimators { odometry, fusion });
    }

    /// Override the planner's pose, for setups without the estimator loops
    pub fn update_pose(&self, pose: Pose2D) {
        self.planner.lock().update_pose(pose);
    }

    pub fn set_static_map(&self, map: Option<StaticMap>) {
        self.planner.lock().set_static_map(map);
    }

    /// Plan to `goal` and enter Navigating
    ///
    /// The goal is rejected when the current state cannot move to
    /// Navigating, when a Navigating validator vetoes it, or when no path
    /// exists. Non-finite coordinates are refused before any of that.
    pub async fn set_navigation_goal(&self, goal: Point) -> RoverResult<()> {
        if !goal.is_finite() {
            warn!(x = goal.x, y = goal.y, "non-finite navigation goal rejected");
            return Err(RoverError::InvalidGoal { x: goal.x, y: goal.y });
        }
        let current = self.state_machine.current_state();
        if !self.state_machine.can_transition_to(RobotState::Navigating) {
            warn!(state = %current, x = goal.x, y = goal.y, "navigation goal rejected");
            return Err(RoverError::NavigationNotAllowed(current));
        }

        let (planned, status) = {
            let mut planner = self.planner.lock();
            let planned = planner.set_goal(goal);
            (planned, planner.status())
        };
        if !planned {
            self.publish_navigation(NavigationReport::PlanningFailed, &status);
            self.planner.lock().clear_goal();
            return Err(RoverError::NoPath { x: goal.x, y: goal.y });
        }

        let payload = json!({
            "goal_x": goal.x,
            "goal_y": goal.y,
            "path_points": status.path_points,
        });
        let accepted = self
            .state_machine
            .transition_to(RobotState::Navigating, StateChangeReason::NewTaskAssigned, Some(payload))
            .await;
        if !accepted {
            self.planner.lock().clear_goal();
            return Err(RoverError::NavigationNotAllowed(self.state_machine.current_state()));
        }

        self.publish_navigation(NavigationReport::PathPlanned, &status);
        Ok(())
    }

    /// Request an emergency stop through the bus
    pub fn emergency_stop(&self, description: &str) {
        warn!(description, "manual emergency stop requested");
        let alert = EmergencyAlert::new("manual_stop", Severity::Critical, description);
        self.bus
            .publish(Event::new(SOURCE, EventPayload::Emergency(alert)), EventPriority::Critical);
    }

    /// Leave EmergencyStop for Idle; the previous goal is dropped
    pub async fn resume_from_emergency(&self) -> bool {
        if self.state_machine.current_state() != RobotState::EmergencyStop {
            warn!(state = %self.state_machine.current_state(), "not in emergency stop");
            return false;
        }
        let resumed = self
            .state_machine
            .transition_to(RobotState::Idle, StateChangeReason::ManualRecovery, None)
            .await;
        if resumed {
            self.planner.lock().clear_goal();
            info!("resumed from emergency stop");
        }
        resumed
    }

    /// One control step
    ///
    /// Records the readings, then acts on the current state. Returns the
    /// planner's command when navigating.
    pub async fn control_tick(
        &self,
        sensors: Option<&SensorSnapshot>,
        observations: &[ObstacleObservation],
    ) -> Option<NavigationCommand> {
        let now = now_secs();
        if let Some(snapshot) = sensors {
            self.sensor_health.lock().observe(snapshot);
            if let Some(imu) = snapshot.imu {
                self.imu_tx.send_replace(Some(imu));
            }
            if snapshot.battery_voltage > 0.0 {
                *self.battery_voltage.lock() = Some(snapshot.battery_voltage);
                charge_if_low(
                    &self.state_machine,
                    snapshot.battery_voltage,
                    self.config.robot.low_battery_voltage,
                )
                .await;
            }
        }

        let command = match self.state_machine.current_state() {
            RobotState::Navigating => self.navigation_tick(sensors, observations, now).await,
            RobotState::Charging => {
                self.charging_tick().await;
                None
            }
            RobotState::Error => {
                self.recovery_tick().await;
                None
            }
            _ => None,
        };

        *self.last_command.lock() = command;
        command
    }

    /// Call `control_tick` every control period until `stop` completes
    ///
    /// `sample` supplies the readings for each tick.
    pub async fn run_control_loop<S, F>(&self, mut sample: S, stop: F)
    where
        S: FnMut() -> (Option<SensorSnapshot>, Vec<ObstacleObservation>),
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.robot.control_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(stop);

        info!(period_ms = self.config.robot.control_interval_ms, "control loop started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let (sensors, observations) = sample();
                    self.control_tick(sensors.as_ref(), &observations).await;
                }
            }
        }
        info!("control loop stopped");
    }

    async fn navigation_tick(
        &self,
        sensors: Option<&SensorSnapshot>,
        observations: &[ObstacleObservation],
        now: f64,
    ) -> Option<NavigationCommand> {
        let (command, planner_state, status) = {
            let mut planner = self.planner.lock();
            planner.update_obstacles(observations, now);
            let command = planner.next_command(sensors, now);
            (command, planner.state(), planner.status())
        };

        match command {
            Some(cmd) if cmd.kind == CommandKind::EmergencyStop => {
                let min_distance = sensors.map_or(f64::INFINITY, SensorSnapshot::min_distance);
                let alert = EmergencyAlert::new(
                    "imminent_collision",
                    Severity::Critical,
                    format!("obstacle at {min_distance:.2} m"),
                );
                self.bus
                    .publish_sync(Event::new(SOURCE, EventPayload::Emergency(alert)))
                    .await;
                return command;
            }
            Some(cmd) => self.drive(&cmd),
            None => {}
        }

        match planner_state {
            PlannerState::ReachedGoal => {
                self.finish_navigation(NavigationReport::GoalReached, StateChangeReason::TaskCompleted, &status)
                    .await;
            }
            PlannerState::Failed => {
                if let Err(e) = self.motors.stop_all() {
                    error!("failed to stop motors: {e:#}");
                }
                self.finish_navigation(NavigationReport::PlanningFailed, StateChangeReason::TaskFailed, &status)
                    .await;
            }
            _ => {}
        }
        command
    }

    async fn finish_navigation(
        &self,
        report: NavigationReport,
        reason: StateChangeReason,
        status: &PlannerStatus,
    ) {
        self.publish_navigation(report, status);
        self.state_machine
            .transition_to(RobotState::Idle, reason, None)
            .await;
        self.planner.lock().clear_goal();
    }

    async fn charging_tick(&self) {
        let Some(voltage) = self.battery_voltage() else {
            return;
        };
        if voltage > self.config.robot.charged_voltage {
            info!(voltage, "battery charged");
            self.state_machine
                .transition_to(
                    RobotState::Idle,
                    StateChangeReason::TaskCompleted,
                    Some(json!({ "battery_voltage": voltage })),
                )
                .await;
        }
    }

    async fn recovery_tick(&self) {
        if self.state_machine.state_duration() < self.config.robot.error_recovery_delay {
            return;
        }
        info!("attempting automatic recovery");
        let recovering = self
            .state_machine
            .transition_to(RobotState::Recovering, StateChangeReason::AutoRecovery, None)
            .await;
        if recovering {
            self.state_machine
                .transition_to(RobotState::Idle, StateChangeReason::AutoRecovery, None)
                .await;
        }
    }

    /// Forward a command to the motors unless the emergency latch is set
    fn drive(&self, command: &NavigationCommand) {
        if self.is_emergency_active() {
            debug!(kind = %command.kind, "emergency active, command dropped");
            return;
        }

        // Commands are normalized; wheel speeds need m/s and rad/s
        let v = command.linear_speed * self.config.planner.max_linear_speed;
        let w = command.angular_speed * self.config.planner.max_angular_speed;
        let half_base = self.config.encoder.wheel_base / 2.0;
        let left = v - w * half_base;
        let right = v + w * half_base;
        self.encoder.set_direction(Wheel::Left, direction_of(left));
        self.encoder.set_direction(Wheel::Right, direction_of(right));

        if let Err(e) = self.motors.execute(command) {
            error!(kind = %command.kind, "motor command failed: {e:#}");
        }
    }

    fn publish_navigation(&self, report: NavigationReport, status: &PlannerStatus) {
        let mut update = NavigationUpdate::new(report);
        update.current_position = Some(status.pose);
        update.target_position = status.goal;
        update.path_progress = status.path_progress / 100.0;
        update.obstacles_detected = status.obstacles;
        self.bus
            .publish(Event::new(SOURCE, EventPayload::Navigation(update)), EventPriority::Normal);
    }

    /// Stop everything and enter Shutdown
    ///
    /// Active states are first brought back to Idle so the ShuttingDown
    /// edge exists.
    pub async fn shutdown(&self) -> RoverResult<()> {
        info!(state = %self.state_machine.current_state(), "rover shutdown requested");

        if !self.state_machine.can_transition_to(RobotState::ShuttingDown)
            && self.state_machine.can_transition_to(RobotState::Idle)
        {
            self.state_machine
                .transition_to(RobotState::Idle, StateChangeReason::SystemShutdown, None)
                .await;
        }
        self.state_machine
            .transition_to(RobotState::ShuttingDown, StateChangeReason::SystemShutdown, None)
            .await;

        if let Err(e) = self.motors.stop_all() {
            error!("failed to stop motors: {e:#}");
        }

        let mut result = Ok(());
        let running = self.running.lock().take();
        if let Some(running) = running {
            if let Err(e) = running.odometry.stop().await {
                error!("odometry task: {e}");
                result = Err(e);
            }
            if let Err(e) = running.fusion.stop().await {
                error!("fusion task: {e}");
                result = result.and(Err(e));
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            self.bus.unsubscribe(subscription);
        }
        self.bus.stop().await;

        self.state_machine
            .transition_to(RobotState::Shutdown, StateChangeReason::SystemShutdown, None)
            .await;
        info!("rover shutdown complete");
        result
    }

    pub fn status(&self) -> RobotStatus {
        let machine = self.state_machine.status();
        RobotStatus {
            state: machine.current_state,
            previous_state: machine.previous_state,
            state_duration: machine.state_duration,
            emergency_active: self.is_emergency_active(),
            battery_voltage: self.battery_voltage(),
            fused_pose: self.fused_pose(),
            planner: self.planner.lock().status(),
            last_command: *self.last_command.lock(),
            degraded_sensors: self.sensor_health.lock().degraded_sensors(),
            bus: self.bus.stats(),
        }
    }

    fn register_state_hooks(&self) {
        let machine = &self.state_machine;

        let emergency = self.emergency.clone();
        let motors = self.motors.clone();
        machine.on_state_enter(RobotState::EmergencyStop, move |_| {
            emergency.store(true, Ordering::SeqCst);
            warn!("emergency stop engaged");
            ready(motors.emergency_stop())
        });

        let emergency = self.emergency.clone();
        machine.on_state_exit(RobotState::EmergencyStop, move |_| {
            emergency.store(false, Ordering::SeqCst);
            info!("emergency stop released");
            ready(Ok(()))
        });

        let motors = self.motors.clone();
        let planner = self.planner.clone();
        machine.on_state_enter(RobotState::Charging, move |_| {
            planner.lock().clear_goal();
            ready(motors.stop_all())
        });

        let motors = self.motors.clone();
        machine.on_state_enter(RobotState::ShuttingDown, move |_| ready(motors.stop_all()));

        let emergency = self.emergency.clone();
        let battery = self.battery_voltage.clone();
        let low_voltage = self.config.robot.low_battery_voltage;
        machine.add_state_validator(RobotState::Navigating, move |_, _| {
            let allowed = if emergency.load(Ordering::SeqCst) {
                warn!("navigation vetoed: emergency stop active");
                false
            } else {
                match *battery.lock() {
                    Some(voltage) if voltage < low_voltage => {
                        warn!(voltage, "navigation vetoed: battery low");
                        false
                    }
                    _ => true,
                }
            };
            ready(Ok(allowed))
        });
    }

    fn subscribe_events(&self) {
        let mut subscriptions = self.subscriptions.lock();

        let machine = Arc::downgrade(&self.state_machine);
        subscriptions.push(self.bus.subscribe(EventKind::Emergency, move |event: Arc<Event>| {
            let machine = machine.clone();
            async move {
                let EventPayload::Emergency(alert) = &event.payload else {
                    return Ok(());
                };
                let Some(machine) = machine.upgrade() else {
                    return Ok(());
                };
                warn!(
                    emergency_type = %alert.emergency_type,
                    severity = ?alert.severity,
                    source = %event.source,
                    "emergency received"
                );
                if machine.current_state() != RobotState::EmergencyStop {
                    let payload = serde_json::to_value(alert)?;
                    machine
                        .transition_to(RobotState::EmergencyStop, StateChangeReason::EmergencyButton, Some(payload))
                        .await;
                }
                Ok::<(), anyhow::Error>(())
            }
        }));

        let machine = Arc::downgrade(&self.state_machine);
        let battery = self.battery_voltage.clone();
        let imu_tx = self.imu_tx.clone();
        let low_voltage = self.config.robot.low_battery_voltage;
        subscriptions.push(self.bus.subscribe(EventKind::SensorData, move |event: Arc<Event>| {
            let machine: Weak<RobotStateMachine> = machine.clone();
            let battery = battery.clone();
            let imu_tx = imu_tx.clone();
            async move {
                let EventPayload::SensorData(data) = &event.payload else {
                    return Ok(());
                };
                if let Some(imu) = data.imu {
                    imu_tx.send_replace(Some(imu));
                }
                if data.battery_voltage > 0.0 {
                    *battery.lock() = Some(data.battery_voltage);
                    if let Some(machine) = machine.upgrade() {
                        charge_if_low(&machine, data.battery_voltage, low_voltage).await;
                    }
                }
                Ok::<(), anyhow::Error>(())
            }
        }));

        let planner = self.planner.clone();
        subscriptions.push(self.bus.subscribe(EventKind::Navigation, move |event: Arc<Event>| {
            if let EventPayload::Navigation(update) = &event.payload {
                if update.report == NavigationReport::PoseFused {
                    if let Some(pose) = update.current_position {
                        planner.lock().update_pose(pose);
                    }
                }
            }
            ready(Ok(()))
        }));
    }
}

impl std::fmt::Debug for RoverSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoverSystem")
            .field("state", &self.state_machine.current_state())
            .field("emergency", &self.is_emergency_active())
            .field("bus", &self.bus)
            .finish()
    }
}

/// Head for the charger when the voltage drops below `low_voltage`
async fn charge_if_low(machine: &RobotStateMachine, voltage: f64, low_voltage: f64) {
    if voltage >= low_voltage
        || machine.current_state() == RobotState::Charging
        || !machine.can_transition_to(RobotState::Charging)
    {
        return;
    }
    warn!(voltage, threshold = low_voltage, "battery low");
    machine
        .transition_to(
            RobotState::Charging,
            StateChangeReason::LowBattery,
            Some(json!({ "battery_voltage": voltage })),
        )
        .await;
}

fn direction_of(speed: f64) -> WheelDirection {
    if speed < 0.0 {
        WheelDirection::Reverse
    } else {
        WheelDirection::Forward
    }
}
