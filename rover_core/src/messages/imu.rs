use serde::{Deserialize, Serialize};

use super::now_secs;

/// Raw inertial measurement from the sensor collaborator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// Linear acceleration (m/s²)
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    /// Angular velocity (rad/s)
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub magnetic_x: f64,
    pub magnetic_y: f64,
    pub magnetic_z: f64,
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
}

impl ImuReading {
    /// Planar reading (yaw rate and horizontal acceleration) stamped now
    pub fn planar(gyro_z: f64, accel_x: f64, accel_y: f64) -> Self {
        Self {
            accel_x,
            accel_y,
            gyro_z,
            timestamp: now_secs(),
            ..Default::default()
        }
    }

    pub fn age(&self, now: f64) -> f64 {
        now - self.timestamp
    }
}
