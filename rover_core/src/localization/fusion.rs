//! EKF fusion of odometry and IMU
//!
//! Runs on its own period, independent of the odometry loop, reading the
//! latest odometry snapshot and IMU reading from `watch` channels. Sources
//! that are stale or untrustworthy are skipped for the tick; prediction
//! always runs so the estimate keeps moving on its velocity state.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ekf::Ekf;
use super::odometry::OdometryData;
use crate::config::FusionConfig;
use crate::events::{Event, EventBus, EventPayload, EventPriority, NavigationReport, NavigationUpdate};
use crate::messages::{now_secs, ImuReading, Pose2D};
use crate::runtime::PeriodicNode;

/// Share of the estimate attributed to each source; sums to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorWeights {
    pub odometry: f64,
    pub imu: f64,
}

impl SensorWeights {
    fn split(odometry: f64) -> Self {
        Self {
            odometry,
            imu: 1.0 - odometry,
        }
    }
}

/// Per-source health for the last fusion tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionHealth {
    pub odometry: bool,
    pub imu: bool,
    /// A measurement update was rejected as numerically invalid
    pub filter_fault: bool,
}

/// Fused estimate handed out by value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusedPose {
    pub pose: Pose2D,
    /// [x, y, θ, vx, vy, ω]
    pub state: [f64; 6],
    pub covariance: [[f64; 6]; 6],
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub linear_acceleration: f64,
    pub angular_acceleration: f64,
    pub position_confidence: f64,
    pub orientation_confidence: f64,
    pub weights: SensorWeights,
    pub health: FusionHealth,
}

impl FusedPose {
    pub fn confidence(&self) -> f64 {
        self.position_confidence.min(self.orientation_confidence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FusionStatus {
    pub pose: Pose2D,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub linear_acceleration: f64,
    pub angular_acceleration: f64,
    pub position_confidence: f64,
    pub orientation_confidence: f64,
    pub weights: SensorWeights,
    pub health: FusionHealth,
    pub updates: u64,
    pub filter_faults: u64,
}

pub struct SensorFusion {
    config: FusionConfig,
    ekf: Ekf,
    bus: EventBus,
    odometry_rx: watch::Receiver<OdometryData>,
    imu_rx: watch::Receiver<Option<ImuReading>>,
    fused_tx: watch::Sender<FusedPose>,

    last_update: f64,
    last_velocities: (f64, f64),
    accelerations: (f64, f64),
    weights: SensorWeights,
    health: FusionHealth,
    updates: u64,
    filter_faults: u64,
}

impl SensorFusion {
    pub fn new(
        config: FusionConfig,
        odometry_rx: watch::Receiver<OdometryData>,
        imu_rx: watch::Receiver<Option<ImuReading>>,
        bus: EventBus,
    ) -> Self {
        let ekf = Ekf::new(&config);
        let weights = SensorWeights::split(config.default_odometry_weight);
        let initial = FusedPose {
            pose: Pose2D::new(0.0, 0.0, 0.0),
            state: ekf.state(),
            covariance: ekf.covariance(),
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            linear_acceleration: 0.0,
            angular_acceleration: 0.0,
            position_confidence: 0.0,
            orientation_confidence: 0.0,
            weights,
            health: FusionHealth::default(),
        };
        let (fused_tx, _) = watch::channel(initial);

        info!(period_ms = config.update_interval_ms, "sensor fusion initialized");
        Self {
            config,
            ekf,
            bus,
            odometry_rx,
            imu_rx,
            fused_tx,
            last_update: now_secs(),
            last_velocities: (0.0, 0.0),
            accelerations: (0.0, 0.0),
            weights,
            health: FusionHealth::default(),
            updates: 0,
            filter_faults: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FusedPose> {
        self.fused_tx.subscribe()
    }

    /// Read the latest inputs and run one fusion step at wall-clock time
    pub fn update(&mut self) -> FusedPose {
        let now = now_secs();
        let dt = now - self.last_update;
        self.last_update = now;

        let odometry = *self.odometry_rx.borrow_and_update();
        let imu = *self.imu_rx.borrow_and_update();
        self.step(Some(&odometry), imu.as_ref(), now, dt)
    }

    /// One predict/update cycle with explicit inputs
    pub fn step(
        &mut self,
        odometry: Option<&OdometryData>,
        imu: Option<&ImuReading>,
        now: f64,
        dt: f64,
    ) -> FusedPose {
        self.ekf.predict(dt);

        let odometry = odometry.filter(|odom| self.odometry_healthy(odom, now));
        let imu = imu.filter(|reading| reading.age(now) <= self.config.imu_timeout);
        self.health = FusionHealth {
            odometry: odometry.is_some(),
            imu: imu.is_some(),
            filter_fault: false,
        };

        if let Some(odom) = odometry {
            let measured = [odom.pose.x, odom.pose.y, odom.pose.theta];
            if let Err(e) = self.ekf.update_odometry_with_twist(
                measured,
                odom.linear_velocity,
                odom.angular_velocity,
            ) {
                self.record_fault("odometry", &e);
            }
        }

        if let Some(reading) = imu {
            let measured = [reading.gyro_z, reading.accel_x, reading.accel_y];
            if let Err(e) = self.ekf.update_imu(measured) {
                self.record_fault("imu", &e);
            }
        }

        self.weights = self.compute_weights(odometry);

        let (linear, angular) = self.ekf.velocities();
        if dt > 0.0 {
            self.accelerations = (
                (linear - self.last_velocities.0) / dt,
                (angular - self.last_velocities.1) / dt,
            );
        }
        self.last_velocities = (linear, angular);
        self.updates += 1;

        let fused = self.fused_pose_at(now);
        self.fused_tx.send_replace(fused);
        fused
    }

    pub fn fused_pose(&self) -> FusedPose {
        *self.fused_tx.borrow()
    }

    pub fn weights(&self) -> SensorWeights {
        self.weights
    }

    pub fn health(&self) -> FusionHealth {
        self.health
    }

    /// Restart the filter at `pose` (origin when `None`) with zero velocity
    pub fn reset_fusion(&mut self, pose: Option<Pose2D>) {
        let pose = pose.unwrap_or_else(|| Pose2D::new(0.0, 0.0, 0.0));
        self.ekf.reset([pose.x, pose.y, pose.theta, 0.0, 0.0, 0.0]);
        self.last_velocities = (0.0, 0.0);
        self.accelerations = (0.0, 0.0);
        self.weights = SensorWeights::split(self.config.default_odometry_weight);
        self.health = FusionHealth::default();
        self.last_update = now_secs();

        let fused = self.fused_pose_at(self.last_update);
        self.fused_tx.send_replace(fused);
        info!(x = pose.x, y = pose.y, theta = pose.theta, "sensor fusion reset");
    }

    pub fn status(&self) -> FusionStatus {
        let fused = self.fused_pose();
        FusionStatus {
            pose: fused.pose,
            linear_velocity: fused.linear_velocity,
            angular_velocity: fused.angular_velocity,
            linear_acceleration: fused.linear_acceleration,
            angular_acceleration: fused.angular_acceleration,
            position_confidence: fused.position_confidence,
            orientation_confidence: fused.orientation_confidence,
            weights: fused.weights,
            health: fused.health,
            updates: self.updates,
            filter_faults: self.filter_faults,
        }
    }

    fn odometry_healthy(&self, odom: &OdometryData, now: f64) -> bool {
        odom.confidence > self.config.odometry_min_confidence
            && now - odom.pose.timestamp <= self.config.odometry_max_age
    }

    fn compute_weights(&self, odometry: Option<&OdometryData>) -> SensorWeights {
        let fallback = SensorWeights::split(self.config.default_odometry_weight);
        if !self.config.adaptive_weights {
            return fallback;
        }

        let odometry_score = odometry.map_or(0.0, |odom| odom.confidence);
        let imu_score = if self.health.imu { 1.0 } else { 0.0 };
        let total = odometry_score + imu_score;
        if total > 0.0 {
            SensorWeights {
                odometry: odometry_score / total,
                imu: imu_score / total,
            }
        } else {
            fallback
        }
    }

    fn record_fault(&mut self, source: &'static str, error: &crate::error::RoverError) {
        self.health.filter_fault = true;
        self.filter_faults += 1;
        warn!(source, error = %error, "measurement rejected, keeping previous estimate");
    }

    fn fused_pose_at(&self, now: f64) -> FusedPose {
        let (x, y, theta) = self.ekf.pose();
        let (linear, angular) = self.ekf.velocities();
        let (position_confidence, orientation_confidence) = self.ekf.confidences(
            self.config.max_position_variance,
            self.config.max_orientation_variance,
        );
        FusedPose {
            pose: Pose2D::with_timestamp(x, y, theta, now),
            state: self.ekf.state(),
            covariance: self.ekf.covariance(),
            linear_velocity: linear,
            angular_velocity: angular,
            linear_acceleration: self.accelerations.0,
            angular_acceleration: self.accelerations.1,
            position_confidence,
            orientation_confidence,
            weights: self.weights,
            health: self.health,
        }
    }

    fn publish(&self, fused: &FusedPose) {
        let mut update = NavigationUpdate::new(NavigationReport::PoseFused);
        update.current_position = Some(fused.pose);
        update.linear_velocity = fused.linear_velocity;
        update.angular_velocity = fused.angular_velocity;
        update.position_confidence = fused.position_confidence;
        update.orientation_confidence = fused.orientation_confidence;
        update.sensor_weights = Some(fused.weights);
        update.sensor_health = Some(fused.health);
        self.bus.publish(
            Event::new("SensorFusion", EventPayload::Navigation(update)),
            EventPriority::Critical,
        );
    }
}

impl PeriodicNode for SensorFusion {
    fn name(&self) -> &'static str {
        "sensor_fusion"
    }

    fn tick(&mut self) {
        let fused = self.update();
        self.publish(&fused);
    }

    fn shutdown(&mut self) {
        debug!(updates = self.updates, faults = self.filter_faults, "sensor fusion loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use approx::assert_relative_eq;

    struct Harness {
        fusion: SensorFusion,
        _odometry_tx: watch::Sender<OdometryData>,
        _imu_tx: watch::Sender<Option<ImuReading>>,
        bus: EventBus,
    }

    fn harness(config: FusionConfig) -> Harness {
        let (odometry_tx, odometry_rx) = watch::channel(OdometryData::default());
        let (imu_tx, imu_rx) = watch::channel(None);
        let bus = EventBus::new(10);
        Harness {
            fusion: SensorFusion::new(config, odometry_rx, imu_rx, bus.clone()),
            _odometry_tx: odometry_tx,
            _imu_tx: imu_tx,
            bus,
        }
    }

    fn odometry_at(x: f64, y: f64, theta: f64, confidence: f64, now: f64) -> OdometryData {
        OdometryData {
            pose: Pose2D::with_timestamp(x, y, theta, now),
            confidence,
            position_confidence: confidence,
            orientation_confidence: confidence,
            ..OdometryData::default()
        }
    }

    fn imu_at(gyro_z: f64, now: f64) -> ImuReading {
        ImuReading {
            gyro_z,
            timestamp: now,
            ..ImuReading::default()
        }
    }

    #[test]
    fn test_healthy_odometry_pulls_estimate() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;

        let mut fused = h.fusion.step(None, None, now, 0.02);
        for _ in 0..50 {
            let odom = odometry_at(1.0, 0.5, 0.0, 0.9, now);
            fused = h.fusion.step(Some(&odom), None, now, 0.02);
        }

        assert!(fused.health.odometry);
        assert!(!fused.health.imu);
        assert_relative_eq!(fused.pose.x, 1.0, epsilon = 0.05);
        assert_relative_eq!(fused.pose.y, 0.5, epsilon = 0.05);
        assert_relative_eq!(fused.weights.odometry, 1.0);
        assert_relative_eq!(fused.weights.imu, 0.0);
    }

    #[test]
    fn test_stale_or_unconfident_odometry_is_skipped() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;

        let stale = odometry_at(5.0, 5.0, 0.0, 0.9, now - 2.0);
        let fused = h.fusion.step(Some(&stale), None, now, 0.02);
        assert!(!fused.health.odometry);
        assert_relative_eq!(fused.pose.x, 0.0);

        let doubtful = odometry_at(5.0, 5.0, 0.0, 0.4, now);
        let fused = h.fusion.step(Some(&doubtful), None, now, 0.02);
        assert!(!fused.health.odometry);
        assert_relative_eq!(fused.pose.x, 0.0);

        // Neither source usable: fall back to the default split
        assert_relative_eq!(fused.weights.odometry, 0.7);
        assert_relative_eq!(fused.weights.imu, 0.3);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;
        let odom = odometry_at(0.0, 0.0, 0.0, 0.6, now);
        let imu = imu_at(0.0, now - 0.5);

        let fused = h.fusion.step(Some(&odom), Some(&imu), now, 0.02);

        assert!(fused.health.odometry && fused.health.imu);
        assert_relative_eq!(fused.weights.odometry, 0.6 / 1.6, epsilon = 1e-12);
        assert_relative_eq!(fused.weights.odometry + fused.weights.imu, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_imu_timeout_excludes_reading() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;

        let fused = h.fusion.step(None, Some(&imu_at(1.0, now - 1.5)), now, 0.02);
        assert!(!fused.health.imu);
        assert_relative_eq!(fused.angular_velocity, 0.0);

        let fused = h.fusion.step(None, Some(&imu_at(1.0, now)), now, 0.02);
        assert!(fused.health.imu);
        assert!(fused.angular_velocity > 0.0);
    }

    #[test]
    fn test_prediction_runs_without_sources() {
        let mut h = harness(FusionConfig::default());
        h.fusion.ekf.set_state([0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

        let fused = h.fusion.step(None, None, 1000.0, 0.5);

        assert_relative_eq!(fused.pose.x, 0.5);
        assert!(!fused.health.odometry && !fused.health.imu);
    }

    #[test]
    fn test_acceleration_by_finite_difference() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;

        let mut odom = odometry_at(0.0, 0.0, 0.0, 0.9, now);
        odom.linear_velocity = 0.0;
        h.fusion.step(Some(&odom), None, now, 0.1);

        odom.linear_velocity = 0.5;
        let fused = h.fusion.step(Some(&odom), None, now, 0.1);

        assert_relative_eq!(fused.linear_velocity, 0.5, epsilon = 1e-9);
        assert_relative_eq!(fused.linear_acceleration, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_filter_fault_is_reported_not_raised() {
        let config = FusionConfig {
            initial_covariance: 0.0,
            process_noise: [0.0; 6],
            odometry_noise: [0.0; 3],
            ..FusionConfig::default()
        };
        let mut h = harness(config);
        let now = 1000.0;

        let odom = odometry_at(3.0, 3.0, 0.0, 0.9, now);
        let fused = h.fusion.step(Some(&odom), None, now, 0.02);

        assert!(fused.health.filter_fault);
        assert_relative_eq!(fused.pose.x, 0.0);
        assert_eq!(h.fusion.status().filter_faults, 1);
    }

    #[test]
    fn test_reset_fusion() {
        let mut h = harness(FusionConfig::default());
        let now = 1000.0;
        for _ in 0..10 {
            let odom = odometry_at(2.0, 2.0, 1.0, 0.9, now);
            h.fusion.step(Some(&odom), None, now, 0.02);
        }

        h.fusion.reset_fusion(Some(Pose2D::with_timestamp(-1.0, 0.5, 0.25, now)));

        let fused = h.fusion.fused_pose();
        assert_relative_eq!(fused.pose.x, -1.0);
        assert_relative_eq!(fused.pose.y, 0.5);
        assert_relative_eq!(fused.pose.theta, 0.25);
        assert_eq!(fused.linear_velocity, 0.0);
        assert_relative_eq!(fused.covariance[0][0], 0.1);
    }

    #[test]
    fn test_tick_publishes_fused_event() {
        let mut h = harness(FusionConfig::default());
        let mut rx = h.fusion.subscribe();

        h.fusion.tick();

        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
        let stats = h.bus.stats();
        assert_eq!(stats.events_by_kind[&EventKind::Navigation], 1);
        assert_eq!(h.bus.recent_events(1)[0].source, "SensorFusion");
    }
}
