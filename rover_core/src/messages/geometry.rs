use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Seconds since the UNIX epoch as a float
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Wrap an angle into (-π, π]
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        PI
    } else {
        wrapped
    }
}

/// 2D point in world coordinates (meters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Bearing from this point towards `other`
    pub fn angle_to(&self, other: &Point) -> f64 {
        (other.y - self.y).atan2(other.x - self.x)
    }
}

/// Planar robot pose
///
/// `theta` is kept in (-π, π] by every constructor and mutator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
}

impl Pose2D {
    /// Create a pose stamped with the current time
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self::with_timestamp(x, y, theta, now_secs())
    }

    pub fn with_timestamp(x: f64, y: f64, theta: f64, timestamp: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
            timestamp,
        }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn distance_to(&self, other: &Pose2D) -> f64 {
        self.position().distance_to(&other.position())
    }

    pub fn angle_to(&self, other: &Pose2D) -> f64 {
        self.position().angle_to(&other.position())
    }
}
