//! Per-tick sensor snapshot and consecutive-failure health tracking

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::events::SensorData;
use crate::messages::ImuReading;

/// Range, inertial and power readings sampled for one control tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Ultrasonic ranges by sensor name (m)
    pub ultrasonic_distances: BTreeMap<String, f64>,
    pub imu: Option<ImuReading>,
    pub battery_voltage: f64,
    pub temperature: f64,
}

impl SensorSnapshot {
    pub fn with_distance(mut self, name: impl Into<String>, distance: f64) -> Self {
        self.ultrasonic_distances.insert(name.into(), distance);
        self
    }

    pub fn with_battery(mut self, voltage: f64) -> Self {
        self.battery_voltage = voltage;
        self
    }

    /// Smallest valid range reading, or `f64::INFINITY` if there is none
    pub fn min_distance(&self) -> f64 {
        self.ultrasonic_distances
            .values()
            .copied()
            .filter(|d| is_valid_range(*d))
            .fold(f64::INFINITY, f64::min)
    }
}

impl From<SensorData> for SensorSnapshot {
    fn from(data: SensorData) -> Self {
        Self {
            ultrasonic_distances: data.ultrasonic_distances,
            imu: data.imu,
            battery_voltage: data.battery_voltage,
            temperature: data.temperature,
        }
    }
}

impl From<&SensorSnapshot> for SensorData {
    fn from(snapshot: &SensorSnapshot) -> Self {
        Self {
            ultrasonic_distances: snapshot.ultrasonic_distances.clone(),
            imu: snapshot.imu,
            battery_voltage: snapshot.battery_voltage,
            temperature: snapshot.temperature,
        }
    }
}

fn is_valid_range(distance: f64) -> bool {
    distance.is_finite() && distance > 0.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub degraded: bool,
}

/// Tracks read failures per named sensor
///
/// A sensor is degraded once it fails `max_consecutive_failures` times in
/// a row; one good reading clears the streak.
#[derive(Debug, Clone)]
pub struct SensorHealthMonitor {
    max_consecutive_failures: u32,
    sensors: BTreeMap<String, SensorHealth>,
}

impl SensorHealthMonitor {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            sensors: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, name: &str) {
        let health = self.sensors.entry(name.to_string()).or_default();
        if health.degraded {
            info!(sensor = name, "sensor recovered");
        }
        health.consecutive_failures = 0;
        health.degraded = false;
    }

    /// Returns true when this failure tips the sensor into degraded
    pub fn record_failure(&mut self, name: &str) -> bool {
        let limit = self.max_consecutive_failures;
        let health = self.sensors.entry(name.to_string()).or_default();
        health.consecutive_failures += 1;
        health.total_failures += 1;

        let newly_degraded = !health.degraded && health.consecutive_failures >= limit;
        if newly_degraded {
            health.degraded = true;
            warn!(sensor = name, failures = health.consecutive_failures, "sensor degraded");
        }
        newly_degraded
    }

    /// Score every range reading in `snapshot`; invalid ranges are failures
    pub fn observe(&mut self, snapshot: &SensorSnapshot) {
        for (name, &distance) in &snapshot.ultrasonic_distances {
            if is_valid_range(distance) {
                self.record_success(name);
            } else {
                self.record_failure(name);
            }
        }
    }

    pub fn is_degraded(&self, name: &str) -> bool {
        self.sensors.get(name).is_some_and(|h| h.degraded)
    }

    pub fn degraded_sensors(&self) -> Vec<String> {
        self.sensors
            .iter()
            .filter(|(_, h)| h.degraded)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn report(&self) -> BTreeMap<String, SensorHealth> {
        self.sensors.clone()
    }
}

impl Default for SensorHealthMonitor {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_distance_ignores_invalid() {
        let snapshot = SensorSnapshot::default()
            .with_distance("front", 0.8)
            .with_distance("left", 0.0)
            .with_distance("right", f64::NAN)
            .with_distance("rear", 0.35);
        assert_eq!(snapshot.min_distance(), 0.35);
    }

    #[test]
    fn test_min_distance_without_readings() {
        assert_eq!(SensorSnapshot::default().min_distance(), f64::INFINITY);
        let only_bad = SensorSnapshot::default().with_distance("front", -1.0);
        assert_eq!(only_bad.min_distance(), f64::INFINITY);
    }

    #[test]
    fn test_degraded_after_consecutive_failures() {
        let mut monitor = SensorHealthMonitor::new(5);
        for _ in 0..4 {
            assert!(!monitor.record_failure("front"));
        }
        assert!(!monitor.is_degraded("front"));

        assert!(monitor.record_failure("front"));
        assert!(monitor.is_degraded("front"));
        // Already degraded: no second notification
        assert!(!monitor.record_failure("front"));
        assert_eq!(monitor.degraded_sensors(), vec!["front".to_string()]);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut monitor = SensorHealthMonitor::default();
        for _ in 0..4 {
            monitor.record_failure("left");
        }
        monitor.record_success("left");
        for _ in 0..4 {
            monitor.record_failure("left");
        }
        assert!(!monitor.is_degraded("left"));
        assert_eq!(monitor.report()["left"].total_failures, 8);
    }

    #[test]
    fn test_observe_snapshot() {
        let mut monitor = SensorHealthMonitor::new(2);
        let snapshot = SensorSnapshot::default()
            .with_distance("front", 1.0)
            .with_distance("rear", f64::INFINITY);

        monitor.observe(&snapshot);
        monitor.observe(&snapshot);

        assert!(!monitor.is_degraded("front"));
        assert!(monitor.is_degraded("rear"));
        assert!(!monitor.is_degraded("unknown"));
    }

    #[test]
    fn test_sensor_data_conversion() {
        let snapshot = SensorSnapshot::default()
            .with_distance("front", 0.5)
            .with_battery(11.8);
        let data = SensorData::from(&snapshot);
        assert_eq!(SensorSnapshot::from(data), snapshot);
    }
}
