//! Typed configuration for every rover component
//!
//! All sections deserialize with defaults, so a TOML file only needs the
//! keys it overrides:
//!
//! ```toml
//! [planner]
//! grid_size = 0.05
//! max_linear_speed = 0.3
//!
//! [robot]
//! low_battery_voltage = 10.5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RoverError, RoverResult};

/// Wheel encoder wiring and geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub left_pin_a: u8,
    pub left_pin_b: u8,
    pub right_pin_a: u8,
    pub right_pin_b: u8,
    pub pulses_per_revolution: u32,
    /// Wheel radius (m)
    pub wheel_radius: f64,
    /// Distance between the wheel contact points (m)
    pub wheel_base: f64,
    pub debounce_ms: u64,
    /// Number of recent pulse times kept for velocity estimation
    pub velocity_window: usize,
    /// Pulse times older than this are ignored for velocity (s)
    pub velocity_max_age: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            left_pin_a: 18,
            left_pin_b: 19,
            right_pin_a: 20,
            right_pin_b: 21,
            pulses_per_revolution: 1000,
            wheel_radius: 0.05,
            wheel_base: 0.2,
            debounce_ms: 1,
            velocity_window: 10,
            velocity_max_age: 1.0,
        }
    }
}

impl EncoderConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn wheel_circumference(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.wheel_radius
    }
}

/// Dead-reckoning integration and drift model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    pub update_interval_ms: u64,
    pub initial_variance: f64,
    pub max_variance: f64,
    /// |Δθ| below this uses the straight-line update (rad)
    pub straight_line_epsilon: f64,
    /// Variance added per meter travelled on its own axis
    pub distance_drift: f64,
    /// Variance added per radian turned on its own axis
    pub rotation_drift: f64,
    /// Variance leaked into the other axis per unit of motion
    pub cross_drift: f64,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 20,
            initial_variance: 0.001,
            max_variance: 1.0,
            straight_line_epsilon: 1e-6,
            distance_drift: 0.001,
            rotation_drift: 0.001,
            cross_drift: 0.0001,
        }
    }
}

impl OdometryConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// EKF noise model and sensor health thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub update_interval_ms: u64,
    /// IMU readings older than this are ignored (s)
    pub imu_timeout: f64,
    /// Odometry poses older than this are ignored (s)
    pub odometry_max_age: f64,
    pub odometry_min_confidence: f64,
    /// Diagonal of the initial covariance
    pub initial_covariance: f64,
    /// Diagonal of Q for [x, y, θ, vx, vy, ω]
    pub process_noise: [f64; 6],
    /// Diagonal of R for odometry [x, y, θ]
    pub odometry_noise: [f64; 3],
    /// Diagonal of R for IMU [ω, ax, ay]
    pub imu_noise: [f64; 3],
    pub adaptive_weights: bool,
    /// Odometry share of the fallback weight split
    pub default_odometry_weight: f64,
    /// P00 + P11 at which position confidence reaches zero
    pub max_position_variance: f64,
    /// P22 at which orientation confidence reaches zero
    pub max_orientation_variance: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 20,
            imu_timeout: 1.0,
            odometry_max_age: 1.0,
            odometry_min_confidence: 0.5,
            initial_covariance: 0.1,
            process_noise: [0.01, 0.01, 0.01, 0.1, 0.1, 0.1],
            odometry_noise: [0.1, 0.1, 0.1],
            imu_noise: [0.05, 0.05, 0.01],
            adaptive_weights: true,
            default_odometry_weight: 0.7,
            max_position_variance: 1.0,
            max_orientation_variance: 0.1,
        }
    }
}

impl FusionConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// Dynamic window sampling and scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DwaConfig {
    pub v_resolution: f64,
    pub w_resolution: f64,
    /// Rollout step (s)
    pub dt: f64,
    pub steps: usize,
    pub goal_weight: f64,
    pub obstacle_weight: f64,
    pub velocity_weight: f64,
}

impl Default for DwaConfig {
    fn default() -> Self {
        Self {
            v_resolution: 0.1,
            w_resolution: 0.1,
            dt: 0.1,
            steps: 10,
            goal_weight: 1.0,
            obstacle_weight: 2.0,
            velocity_weight: 0.1,
        }
    }
}

/// Global planning, obstacle tracking and path following
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Cell size (m)
    pub grid_size: f64,
    /// Half-width of the square planning region (m)
    pub planning_range: f64,
    /// Radius assigned to every observed obstacle (m)
    pub obstacle_inflation: f64,
    /// Range reading that forces an emergency stop (m)
    pub emergency_stop_distance: f64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    pub goal_tolerance: f64,
    pub heuristic_weight: f64,
    /// A* expansion budget
    pub max_iterations: usize,
    pub lookahead_distance: f64,
    /// Obstacles older than this are ignored (s)
    pub obstacle_max_age: f64,
    pub dwa: DwaConfig,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            grid_size: 0.1,
            planning_range: 10.0,
            obstacle_inflation: 0.3,
            emergency_stop_distance: 0.2,
            max_linear_speed: 0.5,
            max_angular_speed: 1.0,
            goal_tolerance: 0.1,
            heuristic_weight: 1.0,
            max_iterations: 1000,
            lookahead_distance: 0.5,
            obstacle_max_age: 5.0,
            dwa: DwaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { max_history: 1000 }
    }
}

/// Orchestration thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub control_interval_ms: u64,
    /// Below this the robot heads for the charger (V)
    pub low_battery_voltage: f64,
    /// Above this charging is considered complete (V)
    pub charged_voltage: f64,
    /// Time spent in Error before automatic recovery (s)
    pub error_recovery_delay: f64,
    /// Run the odometry and fusion loops on start. Disable when the pose
    /// is supplied externally.
    pub estimators_enabled: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            control_interval_ms: 100,
            low_battery_voltage: 10.0,
            charged_voltage: 12.0,
            error_recovery_delay: 5.0,
            estimators_enabled: true,
        }
    }
}

impl RobotConfig {
    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Consecutive read failures before a sensor is reported degraded
    pub max_consecutive_failures: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
        }
    }
}

/// Complete rover configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    pub encoder: EncoderConfig,
    pub odometry: OdometryConfig,
    pub fusion: FusionConfig,
    pub planner: PlannerConfig,
    pub bus: BusConfig,
    pub robot: RobotConfig,
    pub sensors: SensorConfig,
}

impl RoverConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> RoverResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> RoverResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> RoverResult<()> {
        fn positive(name: &str, value: f64) -> RoverResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(RoverError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )))
            }
        }

        fn nonzero_interval(name: &str, millis: u64) -> RoverResult<()> {
            if millis == 0 {
                Err(RoverError::InvalidConfig(format!("{name} must be non-zero")))
            } else {
                Ok(())
            }
        }

        if self.encoder.pulses_per_revolution == 0 {
            return Err(RoverError::InvalidConfig(
                "encoder.pulses_per_revolution must be non-zero".into(),
            ));
        }
        positive("encoder.wheel_radius", self.encoder.wheel_radius)?;
        positive("encoder.wheel_base", self.encoder.wheel_base)?;
        positive("odometry.max_variance", self.odometry.max_variance)?;
        positive("planner.grid_size", self.planner.grid_size)?;
        positive("planner.planning_range", self.planner.planning_range)?;
        positive("planner.max_linear_speed", self.planner.max_linear_speed)?;
        positive("planner.max_angular_speed", self.planner.max_angular_speed)?;
        positive("planner.goal_tolerance", self.planner.goal_tolerance)?;
        positive("planner.dwa.v_resolution", self.planner.dwa.v_resolution)?;
        positive("planner.dwa.w_resolution", self.planner.dwa.w_resolution)?;
        positive("planner.dwa.dt", self.planner.dwa.dt)?;
        positive(
            "fusion.max_position_variance",
            self.fusion.max_position_variance,
        )?;
        positive(
            "fusion.max_orientation_variance",
            self.fusion.max_orientation_variance,
        )?;

        nonzero_interval("odometry.update_interval_ms", self.odometry.update_interval_ms)?;
        nonzero_interval("fusion.update_interval_ms", self.fusion.update_interval_ms)?;
        nonzero_interval("robot.control_interval_ms", self.robot.control_interval_ms)?;

        // Above 1 the heuristic overestimates and paths stop being optimal
        let weight = self.planner.heuristic_weight;
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(RoverError::InvalidConfig(format!(
                "planner.heuristic_weight must be within (0, 1], got {weight}"
            )));
        }
        if !(0.0..=1.0).contains(&self.fusion.default_odometry_weight) {
            return Err(RoverError::InvalidConfig(
                "fusion.default_odometry_weight must be within [0, 1]".into(),
            ));
        }
        if self.robot.charged_voltage <= self.robot.low_battery_voltage {
            return Err(RoverError::InvalidConfig(
                "robot.charged_voltage must exceed robot.low_battery_voltage".into(),
            ));
        }
        Ok(())
    }
}
