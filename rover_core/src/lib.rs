//! # Rover Core
//!
//! Control core for a differential-drive ground robot.
//!
//! ## Structure
//!
//! ```text
//! rover_core/
//! ── events/          # Event types and the async publish/subscribe bus
//! ── state_machine/   # Lifecycle states, transition table, guarded machine
//! ── localization/    # Encoder capture, odometry, EKF and sensor fusion
//! ── navigation/      # Occupancy grid, A*, dynamic window, path planner
//! ── messages/        # Poses, IMU readings, observations, motion commands
//! ── robot.rs         # RoverSystem: wires everything to the motor driver
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rover_core::prelude::*;
//!
//! struct NullMotors;
//!
//! impl MotorDriver for NullMotors {
//!     fn execute(&self, _command: &NavigationCommand) -> AnyResult<()> { Ok(()) }
//!     fn stop_all(&self) -> AnyResult<()> { Ok(()) }
//!     fn emergency_stop(&self) -> AnyResult<()> { Ok(()) }
//! }
//!
//! # async fn demo() -> rover_core::RoverResult<()> {
//! rover_core::telemetry::init_tracing("rover_core=info");
//!
//! let rover = RoverSystem::new(RoverConfig::default(), Arc::new(NullMotors))?;
//! rover.start().await;
//! rover.set_navigation_goal(Point::new(3.0, 0.0)).await?;
//!
//! let readings = SensorSnapshot::default().with_distance("front", 1.5);
//! let command = rover.control_tick(Some(&readings), &[]).await;
//! println!("{command:?}");
//!
//! rover.shutdown().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod localization;
pub mod messages;
pub mod navigation;
pub mod robot;
pub mod runtime;
pub mod sensors;
pub mod state_machine;
pub mod telemetry;

pub use config::RoverConfig;
pub use error::{RoverError, RoverResult};
pub use robot::{MotorDriver, RobotStatus, RoverSystem};

pub mod prelude {
    pub use crate::config::RoverConfig;
    pub use crate::error::{RoverError, RoverResult};
    pub use crate::events::{Event, EventBus, EventKind, EventPayload, EventPriority};
    pub use crate::messages::{
        CommandKind, ImuReading, NavigationCommand, ObstacleObservation, Point, Pose2D,
    };
    pub use crate::navigation::{PathPlanner, PlannerState};
    pub use crate::robot::{MotorDriver, RobotStatus, RoverSystem};
    pub use crate::sensors::SensorSnapshot;
    pub use crate::state_machine::{RobotState, RobotStateMachine, StateChangeReason};

    pub use std::sync::Arc;

    pub use anyhow::Result as AnyResult;
}
