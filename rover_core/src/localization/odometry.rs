//! Differential-drive dead reckoning
//!
//! Integrates signed wheel travel from the [`EncoderReader`] into a planar
//! pose using the exact arc model, and tracks a simple drift model that
//! grows with distance and rotation until the pose is reset.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rover_core::config::{EncoderConfig, OdometryConfig};
//! use rover_core::events::EventBus;
//! use rover_core::localization::{EncoderReader, Odometry};
//!
//! let encoder = Arc::new(EncoderReader::new(EncoderConfig::default()));
//! let mut odom = Odometry::new(OdometryConfig::default(), encoder, EventBus::default());
//!
//! // 10 cm straight ahead over 20 ms
//! odom.integrate(0.1, 0.1, 0.02);
//! assert!((odom.pose().x - 0.1).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::encoder::{EncoderReader, EncoderStatus, PulseDelta};
use crate::config::OdometryConfig;
use crate::events::{Event, EventBus, EventPayload, EventPriority, NavigationReport, NavigationUpdate};
use crate::messages::{normalize_angle, now_secs, Pose2D};
use crate::runtime::PeriodicNode;

/// Odometry output handed to consumers by value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OdometryData {
    pub pose: Pose2D,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub left_wheel_velocity: f64,
    pub right_wheel_velocity: f64,
    pub total_distance: f64,
    pub position_confidence: f64,
    pub orientation_confidence: f64,
    /// min(position_confidence, orientation_confidence)
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OdometryStatus {
    pub pose: Pose2D,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub left_wheel_velocity: f64,
    pub right_wheel_velocity: f64,
    pub total_distance: f64,
    pub confidence: f64,
    pub encoder: EncoderStatus,
}

/// Encoder-driven pose estimator
pub struct Odometry {
    config: OdometryConfig,
    wheel_base: f64,
    encoder: Arc<EncoderReader>,
    bus: EventBus,

    pose: Pose2D,
    last_pose: Pose2D,
    linear_velocity: f64,
    angular_velocity: f64,
    left_wheel_velocity: f64,
    right_wheel_velocity: f64,
    total_distance: f64,
    position_variance: f64,
    angle_variance: f64,

    snapshot_tx: watch::Sender<OdometryData>,
}

impl Odometry {
    pub fn new(config: OdometryConfig, encoder: Arc<EncoderReader>, bus: EventBus) -> Self {
        let wheel_base = encoder.config().wheel_base;
        let pose = Pose2D::new(0.0, 0.0, 0.0);
        let (snapshot_tx, _) = watch::channel(OdometryData::default());
        let mut odometry = Self {
            position_variance: config.initial_variance,
            angle_variance: config.initial_variance,
            config,
            wheel_base,
            encoder,
            bus,
            pose,
            last_pose: pose,
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            left_wheel_velocity: 0.0,
            right_wheel_velocity: 0.0,
            total_distance: 0.0,
            snapshot_tx,
        };
        odometry.refresh_snapshot();
        info!(wheel_base, "odometry initialized");
        odometry
    }

    /// Receiver that always holds the latest [`OdometryData`]
    pub fn subscribe(&self) -> watch::Receiver<OdometryData> {
        self.snapshot_tx.subscribe()
    }

    /// Read encoder deltas and integrate them
    pub fn update(&mut self) -> OdometryData {
        let delta = self.encoder.incremental();
        self.apply_delta(delta)
    }

    pub fn apply_delta(&mut self, delta: PulseDelta) -> OdometryData {
        if delta.dt > 0.0 {
            let left = self.encoder.pulses_to_distance(delta.left);
            let right = self.encoder.pulses_to_distance(delta.right);
            let wheels = self.encoder.encoder_data();
            self.left_wheel_velocity = wheels.left_velocity;
            self.right_wheel_velocity = wheels.right_velocity;
            self.integrate(left, right, delta.dt);
        }
        self.data()
    }

    /// Apply differential-drive kinematics for one step of wheel travel (m)
    pub fn integrate(&mut self, left_distance: f64, right_distance: f64, dt: f64) {
        let center = (left_distance + right_distance) / 2.0;
        let delta_theta = (right_distance - left_distance) / self.wheel_base;

        self.total_distance += center.abs();
        if dt > 0.0 {
            self.linear_velocity = center / dt;
            self.angular_velocity = delta_theta / dt;
        } else {
            self.linear_velocity = 0.0;
            self.angular_velocity = 0.0;
        }

        self.last_pose = self.pose;
        let theta = self.pose.theta;

        if delta_theta.abs() < self.config.straight_line_epsilon {
            self.pose.x += center * theta.cos();
            self.pose.y += center * theta.sin();
        } else {
            let radius = center / delta_theta;
            self.pose.x += radius * ((theta + delta_theta).sin() - theta.sin());
            self.pose.y += radius * (theta.cos() - (theta + delta_theta).cos());
        }

        self.pose.theta = normalize_angle(theta + delta_theta);
        self.pose.timestamp = now_secs();

        let distance = center.abs();
        let rotation = delta_theta.abs();
        self.position_variance +=
            distance * self.config.distance_drift + rotation * self.config.cross_drift;
        self.angle_variance +=
            rotation * self.config.rotation_drift + distance * self.config.cross_drift;

        self.refresh_snapshot();
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    /// (position, orientation) confidence in [0, 1]
    pub fn confidences(&self) -> (f64, f64) {
        let max = self.config.max_variance;
        (
            (1.0 - self.position_variance / max).clamp(0.0, 1.0),
            (1.0 - self.angle_variance / max).clamp(0.0, 1.0),
        )
    }

    pub fn confidence(&self) -> f64 {
        let (position, orientation) = self.confidences();
        position.min(orientation)
    }

    pub fn data(&self) -> OdometryData {
        let (position_confidence, orientation_confidence) = self.confidences();
        OdometryData {
            pose: self.pose,
            linear_velocity: self.linear_velocity,
            angular_velocity: self.angular_velocity,
            left_wheel_velocity: self.left_wheel_velocity,
            right_wheel_velocity: self.right_wheel_velocity,
            total_distance: self.total_distance,
            position_confidence,
            orientation_confidence,
            confidence: position_confidence.min(orientation_confidence),
        }
    }

    /// Reset pose, drift, travelled distance and the encoder counters
    pub fn reset_pose(&mut self, pose: Option<Pose2D>) {
        self.pose = pose.unwrap_or_else(|| Pose2D::new(0.0, 0.0, 0.0));
        self.pose.theta = normalize_angle(self.pose.theta);
        self.last_pose = self.pose;
        self.position_variance = self.config.initial_variance;
        self.angle_variance = self.config.initial_variance;
        self.total_distance = 0.0;
        self.encoder.reset_counters();
        self.refresh_snapshot();
        info!(x = self.pose.x, y = self.pose.y, theta = self.pose.theta, "odometry pose reset");
    }

    /// Overwrite the pose from an external reference; drift is reset
    pub fn set_pose(&mut self, x: f64, y: f64, theta: f64) {
        self.pose = Pose2D::new(x, y, theta);
        self.position_variance = self.config.initial_variance;
        self.angle_variance = self.config.initial_variance;
        self.refresh_snapshot();
        info!(x, y, theta = self.pose.theta, "odometry pose set");
    }

    /// (dx, dy, dθ) covered by the last integration step, dθ wrapped
    pub fn motion_since_last_update(&self) -> (f64, f64, f64) {
        (
            self.pose.x - self.last_pose.x,
            self.pose.y - self.last_pose.y,
            normalize_angle(self.pose.theta - self.last_pose.theta),
        )
    }

    pub fn status(&self) -> OdometryStatus {
        let data = self.data();
        OdometryStatus {
            pose: data.pose,
            linear_velocity: data.linear_velocity,
            angular_velocity: data.angular_velocity,
            left_wheel_velocity: data.left_wheel_velocity,
            right_wheel_velocity: data.right_wheel_velocity,
            total_distance: data.total_distance,
            confidence: data.confidence,
            encoder: self.encoder.status(),
        }
    }

    fn refresh_snapshot(&mut self) {
        let data = self.data();
        self.snapshot_tx.send_replace(data);
    }

    fn publish_pose(&self, data: &OdometryData) {
        let mut update = NavigationUpdate::new(NavigationReport::PoseUpdated);
        update.current_position = Some(data.pose);
        update.linear_velocity = data.linear_velocity;
        update.angular_velocity = data.angular_velocity;
        update.position_confidence = data.position_confidence;
        update.orientation_confidence = data.orientation_confidence;
        self.bus.publish(
            Event::new("Odometry", EventPayload::Navigation(update)),
            EventPriority::High,
        );
    }
}

impl PeriodicNode for Odometry {
    fn name(&self) -> &'static str {
        "odometry"
    }

    fn tick(&mut self) {
        let data = self.update();
        self.publish_pose(&data);
    }

    fn shutdown(&mut self) {
        debug!(total_distance = self.total_distance, "odometry loop stopped");
    }
}
