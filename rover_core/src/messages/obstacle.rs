use serde::{Deserialize, Serialize};

/// Obstacle detection reported by the vision collaborator
///
/// Polar offset relative to the robot's current heading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObstacleObservation {
    /// Range to the obstacle (m)
    pub distance: f64,
    /// Bearing relative to the robot heading (rad, positive to the left)
    pub angle: f64,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
}

impl ObstacleObservation {
    pub fn new(distance: f64, angle: f64, confidence: f64) -> Self {
        Self {
            distance,
            angle,
            confidence,
        }
    }

    /// Observations with a non-positive or non-finite range carry no position
    pub fn is_usable(&self) -> bool {
        self.distance.is_finite() && self.distance > 0.0
    }
}
