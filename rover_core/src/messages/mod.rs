//! Plain data messages exchanged between the core and its collaborators

pub mod geometry;
pub mod imu;
pub mod nav_command;
pub mod obstacle;

pub use geometry::{normalize_angle, now_secs, Point, Pose2D};
pub use imu::ImuReading;
pub use nav_command::{CommandKind, NavigationCommand};
pub use obstacle::ObstacleObservation;
