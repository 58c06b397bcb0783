//! Global and local motion planning
//!
//! # Features
//!
//! - [`Grid`]: binary occupancy over the planning region, optionally seeded
//!   from a pre-built [`StaticMap`]
//! - [`AStarPlanner`]: 8-connected shortest path on the grid
//! - [`DynamicWindow`]: collision-free velocity sampling around tracked
//!   obstacles
//! - [`PathPlanner`]: goal handling, re-planning and per-tick commands
//!
//! # Example
//!
//! ```rust
//! use rover_core::config::PlannerConfig;
//! use rover_core::messages::{Point, Pose2D};
//! use rover_core::navigation::{PathPlanner, PlannerState};
//!
//! let mut planner = PathPlanner::new(PlannerConfig::default());
//! planner.update_pose(Pose2D::new(0.0, 0.0, 0.0));
//! assert!(planner.set_goal(Point::new(2.0, 0.0)));
//! assert_eq!(planner.state(), PlannerState::FollowingPath);
//!
//! let now = rover_core::messages::now_secs();
//! let command = planner.next_command(None, now).unwrap();
//! assert!(command.linear_speed > 0.0);
//! ```

pub mod astar;
pub mod dwa;
pub mod grid;
pub mod planner;

pub use astar::{path_length, AStarPlanner};
pub use dwa::{DynamicWindow, TrackedObstacle, VelocityCommand};
pub use grid::{Grid, StaticMap, STATIC_OCCUPIED_THRESHOLD};
pub use planner::{PathPlanner, PlannerState, PlannerStatus};
