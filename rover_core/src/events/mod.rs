//! Event types and the publish/subscribe bus
//!
//! Every notification in the core is an [`Event`]: a timestamp, a source
//! identifier and one tagged payload variant. Events are immutable once
//! published and are shared with handlers behind an `Arc`.
//!
//! # Example
//!
//! ```rust,no_run
//! use rover_core::events::{Event, EventBus, EventKind, EventPayload, EventPriority, EmergencyAlert, Severity};
//!
//! # async fn demo() {
//! let bus = EventBus::new(1000);
//! bus.start();
//!
//! let _sub = bus.subscribe(EventKind::Emergency, |event| async move {
//!     tracing::warn!(source = %event.source, "emergency received");
//!     Ok(())
//! });
//!
//! let alert = EmergencyAlert::new("manual_stop", Severity::High, "operator request");
//! bus.publish(Event::new("ui", EventPayload::Emergency(alert)), EventPriority::Critical);
//! bus.stop().await;
//! # }
//! ```

pub mod bus;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::localization::fusion::{FusionHealth, SensorWeights};
use crate::messages::{now_secs, ImuReading, ObstacleObservation, Point, Pose2D};
use crate::state_machine::{RobotState, StateChangeReason};

pub use bus::{BusStats, EventBus, EventHandler, EventRecord, HandlerFuture, SubscriptionId};

/// Discriminant of an event payload, used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MotorStatus,
    SensorData,
    Navigation,
    Vision,
    SystemState,
    Emergency,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::MotorStatus,
        EventKind::SensorData,
        EventKind::Navigation,
        EventKind::Vision,
        EventKind::SystemState,
        EventKind::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MotorStatus => "motor_status",
            Self::SensorData => "sensor_data",
            Self::Navigation => "navigation",
            Self::Vision => "vision",
            Self::SystemState => "system_state",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority for queued events
///
/// Lower values are delivered first; equal priorities keep publish order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

/// Wheel motor state reported by the motor driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub left_motor_speed: f64,
    pub right_motor_speed: f64,
    pub left_motor_position: i64,
    pub right_motor_position: i64,
    pub is_moving: bool,
    pub emergency_stop: bool,
}

/// Periodic sensor sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    /// Ultrasonic ranges keyed by sensor name (m)
    pub ultrasonic_distances: BTreeMap<String, f64>,
    pub imu: Option<ImuReading>,
    pub battery_voltage: f64,
    pub temperature: f64,
}

/// What a navigation event announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationReport {
    /// Dead-reckoning pose from odometry
    PoseUpdated,
    /// Filtered pose from sensor fusion
    PoseFused,
    PathPlanned,
    PlanningFailed,
    GoalReached,
}

/// Pose and progress announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationUpdate {
    pub report: NavigationReport,
    pub current_position: Option<Pose2D>,
    pub target_position: Option<Point>,
    /// Fraction of the current path already passed, in [0, 1]
    pub path_progress: f64,
    pub obstacles_detected: usize,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub position_confidence: f64,
    pub orientation_confidence: f64,
    pub sensor_weights: Option<SensorWeights>,
    pub sensor_health: Option<FusionHealth>,
}

impl NavigationUpdate {
    pub fn new(report: NavigationReport) -> Self {
        Self {
            report,
            current_position: None,
            target_position: None,
            path_progress: 0.0,
            obstacles_detected: 0,
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            position_confidence: 1.0,
            orientation_confidence: 1.0,
            sensor_weights: None,
            sensor_health: None,
        }
    }

    /// Scalar confidence: the weaker of the two axes
    pub fn confidence(&self) -> f64 {
        self.position_confidence.min(self.orientation_confidence)
    }
}

/// Output of the vision collaborator for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionUpdate {
    pub objects_detected: Vec<String>,
    pub obstacles: Vec<ObstacleObservation>,
    pub confidence_scores: Vec<f64>,
    /// Frame processing time (s)
    pub processing_time: f64,
}

/// Lifecycle transition announcement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemStateChange {
    pub old_state: RobotState,
    pub new_state: RobotState,
    pub reason: StateChangeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Emergency signal; always forces the robot into EmergencyStop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub emergency_type: String,
    pub severity: Severity,
    pub description: String,
    pub auto_recovery: bool,
}

impl EmergencyAlert {
    pub fn new(
        emergency_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            emergency_type: emergency_type.into(),
            severity,
            description: description.into(),
            auto_recovery: false,
        }
    }
}

/// Variant-specific event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MotorStatus(MotorStatus),
    SensorData(SensorData),
    Navigation(NavigationUpdate),
    Vision(VisionUpdate),
    SystemState(SystemStateChange),
    Emergency(EmergencyAlert),
}

/// Immutable notification carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            timestamp: now_secs(),
            source: source.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::MotorStatus(_) => EventKind::MotorStatus,
            EventPayload::SensorData(_) => EventKind::SensorData,
            EventPayload::Navigation(_) => EventKind::Navigation,
            EventPayload::Vision(_) => EventKind::Vision,
            EventPayload::SystemState(_) => EventKind::SystemState,
            EventPayload::Emergency(_) => EventKind::Emergency,
        }
    }

    /// Identifier of the form `{kind}_{timestamp_ms}`
    pub fn event_id(&self) -> String {
        format!("{}_{}", self.kind(), (self.timestamp * 1000.0) as u64)
    }
}
