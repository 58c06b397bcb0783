//! Extended Kalman filter over planar pose and velocity
//!
//! State vector: `[x, y, θ, vx, vy, ω]`.
//!
//! # Features
//!
//! - Constant-velocity prediction with the full `F P Fᵀ + Q·dt` propagation
//! - Odometry pose update with wrapped heading innovation
//! - IMU update mapping `(gyro_z, accel_x, accel_y)` onto `(ω, vx, vy)`
//! - Singular innovation covariance rejects the measurement instead of
//!   corrupting the estimate
//!
//! # Example
//!
//! ```rust
//! use rover_core::config::FusionConfig;
//! use rover_core::localization::Ekf;
//!
//! let mut ekf = Ekf::new(&FusionConfig::default());
//! ekf.set_state([0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
//! ekf.predict(0.1);
//! ekf.update_odometry([0.1, 0.0, 0.0]).unwrap();
//! ```

use crate::config::FusionConfig;
use crate::error::{RoverError, RoverResult};
use crate::messages::normalize_angle;

type Mat6 = [[f64; 6]; 6];
type Mat3 = [[f64; 3]; 3];

const X: usize = 0;
const Y: usize = 1;
const THETA: usize = 2;
const VX: usize = 3;
const VY: usize = 4;
const OMEGA: usize = 5;

#[derive(Debug, Clone)]
pub struct Ekf {
    state: [f64; 6],
    covariance: Mat6,
    process_noise: Mat6,
    odometry_noise: Mat3,
    imu_noise: Mat3,
    initial_covariance: f64,
}

impl Ekf {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            state: [0.0; 6],
            covariance: scaled_identity6(config.initial_covariance),
            process_noise: diag6(config.process_noise),
            odometry_noise: diag3(config.odometry_noise),
            imu_noise: diag3(config.imu_noise),
            initial_covariance: config.initial_covariance,
        }
    }

    pub fn state(&self) -> [f64; 6] {
        self.state
    }

    pub fn set_state(&mut self, state: [f64; 6]) {
        self.state = state;
        self.state[THETA] = normalize_angle(self.state[THETA]);
    }

    pub fn covariance(&self) -> Mat6 {
        self.covariance
    }

    /// (x, y, θ)
    pub fn pose(&self) -> (f64, f64, f64) {
        (self.state[X], self.state[Y], self.state[THETA])
    }

    /// (vx, vy, ω)
    pub fn velocity(&self) -> (f64, f64, f64) {
        (self.state[VX], self.state[VY], self.state[OMEGA])
    }

    /// Planar speed and yaw rate
    pub fn velocities(&self) -> (f64, f64) {
        (self.state[VX].hypot(self.state[VY]), self.state[OMEGA])
    }

    /// Time update
    ///
    /// x += vx·dt, y += vy·dt, θ += ω·dt; velocities are held.
    pub fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }

        self.state[X] += self.state[VX] * dt;
        self.state[Y] += self.state[VY] * dt;
        self.state[THETA] = normalize_angle(self.state[THETA] + self.state[OMEGA] * dt);

        let mut f = scaled_identity6(1.0);
        f[X][VX] = dt;
        f[Y][VY] = dt;
        f[THETA][OMEGA] = dt;

        let fp = mul6(&f, &self.covariance);
        let mut propagated = mul6(&fp, &transpose6(&f));
        for i in 0..6 {
            for j in 0..6 {
                propagated[i][j] += self.process_noise[i][j] * dt;
            }
        }
        self.covariance = propagated;
    }

    /// Measurement update with an odometry pose `[x, y, θ]`
    pub fn update_odometry(&mut self, measurement: [f64; 3]) -> RoverResult<()> {
        let predicted = [self.state[X], self.state[Y], self.state[THETA]];
        let noise = self.odometry_noise;
        self.correct(measurement, predicted, [X, Y, THETA], &noise, Some(2))
    }

    /// Odometry pose update followed by velocity injection from the
    /// odometry twist. The velocities are set outright, not filtered.
    pub fn update_odometry_with_twist(
        &mut self,
        measurement: [f64; 3],
        linear_velocity: f64,
        angular_velocity: f64,
    ) -> RoverResult<()> {
        self.update_odometry(measurement)?;
        let theta = self.state[THETA];
        self.state[VX] = linear_velocity * theta.cos();
        self.state[VY] = linear_velocity * theta.sin();
        self.state[OMEGA] = angular_velocity;
        Ok(())
    }

    /// Measurement update with `[gyro_z, accel_x, accel_y]`
    pub fn update_imu(&mut self, measurement: [f64; 3]) -> RoverResult<()> {
        let predicted = [self.state[OMEGA], self.state[VX], self.state[VY]];
        let noise = self.imu_noise;
        self.correct(measurement, predicted, [OMEGA, VX, VY], &noise, None)
    }

    /// (position, orientation) confidence in [0, 1]
    pub fn confidences(&self, max_position_variance: f64, max_orientation_variance: f64) -> (f64, f64) {
        let position_variance = self.covariance[X][X] + self.covariance[Y][Y];
        let orientation_variance = self.covariance[THETA][THETA];
        (
            (1.0 - position_variance / max_position_variance).clamp(0.0, 1.0),
            (1.0 - orientation_variance / max_orientation_variance).clamp(0.0, 1.0),
        )
    }

    /// Reinitialize at `state` with the initial covariance
    pub fn reset(&mut self, state: [f64; 6]) {
        self.set_state(state);
        self.covariance = scaled_identity6(self.initial_covariance);
    }

    /// Shared correction for measurements that observe three state entries
    /// directly. `wrap` marks the innovation component that is an angle.
    fn correct(
        &mut self,
        measurement: [f64; 3],
        predicted: [f64; 3],
        observed: [usize; 3],
        noise: &Mat3,
        wrap: Option<usize>,
    ) -> RoverResult<()> {
        let mut innovation = [0.0; 3];
        for i in 0..3 {
            innovation[i] = measurement[i] - predicted[i];
        }
        if let Some(i) = wrap {
            innovation[i] = normalize_angle(innovation[i]);
        }

        let mut h = [[0.0; 6]; 3];
        for (row, &col) in observed.iter().enumerate() {
            h[row][col] = 1.0;
        }

        // P Hᵀ (6x3)
        let mut pht = [[0.0; 3]; 6];
        for i in 0..6 {
            for j in 0..3 {
                for k in 0..6 {
                    pht[i][j] += self.covariance[i][k] * h[j][k];
                }
            }
        }

        // S = H P Hᵀ + R
        let mut s = *noise;
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..6 {
                    s[i][j] += h[i][k] * pht[k][j];
                }
            }
        }

        let s_inv = invert_3x3(&s).ok_or(RoverError::SingularMatrix("innovation covariance"))?;

        // K = P Hᵀ S⁻¹ (6x3)
        let mut gain = [[0.0; 3]; 6];
        for i in 0..6 {
            for j in 0..3 {
                for k in 0..3 {
                    gain[i][j] += pht[i][k] * s_inv[k][j];
                }
            }
        }

        for i in 0..6 {
            for j in 0..3 {
                self.state[i] += gain[i][j] * innovation[j];
            }
        }
        self.state[THETA] = normalize_angle(self.state[THETA]);

        // P = (I - K H) P
        let mut i_kh = scaled_identity6(1.0);
        for i in 0..6 {
            for j in 0..6 {
                for k in 0..3 {
                    i_kh[i][j] -= gain[i][k] * h[k][j];
                }
            }
        }
        self.covariance = mul6(&i_kh, &self.covariance);
        Ok(())
    }
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new(&FusionConfig::default())
    }
}

fn scaled_identity6(scale: f64) -> Mat6 {
    let mut m = [[0.0; 6]; 6];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = scale;
    }
    m
}

fn diag6(values: [f64; 6]) -> Mat6 {
    let mut m = [[0.0; 6]; 6];
    for (i, value) in values.into_iter().enumerate() {
        m[i][i] = value;
    }
    m
}

fn diag3(values: [f64; 3]) -> Mat3 {
    let mut m = [[0.0; 3]; 3];
    for (i, value) in values.into_iter().enumerate() {
        m[i][i] = value;
    }
    m
}

fn mul6(a: &Mat6, b: &Mat6) -> Mat6 {
    let mut out = [[0.0; 6]; 6];
    for i in 0..6 {
        for j in 0..6 {
            for k in 0..6 {
                out[i][j] += a[i][k] * b[k][j];
            }
        }
    }
    out
}

fn transpose6(m: &Mat6) -> Mat6 {
    let mut out = [[0.0; 6]; 6];
    for i in 0..6 {
        for j in 0..6 {
            out[j][i] = m[i][j];
        }
    }
    out
}

/// Cofactor inverse; `None` when the determinant vanishes
fn invert_3x3(m: &Mat3) -> Option<Mat3> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);

    if !det.is_finite() || det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;

    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv,
        ],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn position_variance(ekf: &Ekf) -> f64 {
        let p = ekf.covariance();
        p[0][0] + p[1][1]
    }

    #[test]
    fn test_initial_state() {
        let ekf = Ekf::default();
        assert_eq!(ekf.state(), [0.0; 6]);
        assert_relative_eq!(ekf.covariance()[3][3], 0.1);
        assert_eq!(ekf.covariance()[0][1], 0.0);
    }

    #[test]
    fn test_predict_constant_velocity() {
        let mut ekf = Ekf::default();
        ekf.set_state([0.0, 0.0, 0.0, 1.0, 0.5, 0.0]);

        ekf.predict(2.0);

        let (x, y, _) = ekf.pose();
        assert_relative_eq!(x, 2.0);
        assert_relative_eq!(y, 1.0);
    }

    #[test]
    fn test_predict_couples_position_and_velocity() {
        let mut ekf = Ekf::default();
        ekf.predict(0.5);

        let p = ekf.covariance();
        // P01' = dt * P33
        assert_relative_eq!(p[0][3], 0.5 * 0.1, epsilon = 1e-12);
        assert_relative_eq!(p[3][0], p[0][3], epsilon = 1e-12);
        // P00' = P00 + dt² P33 + Q00 dt
        assert_relative_eq!(p[0][0], 0.1 + 0.25 * 0.1 + 0.01 * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_ignores_non_positive_dt() {
        let mut ekf = Ekf::default();
        ekf.set_state([0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let before = ekf.covariance();

        ekf.predict(0.0);
        ekf.predict(-1.0);

        assert_eq!(ekf.pose().0, 0.0);
        assert_eq!(ekf.covariance(), before);
    }

    #[test]
    fn test_rotation_wraps_heading() {
        let mut ekf = Ekf::default();
        ekf.set_state([0.0, 0.0, 3.0, 0.0, 0.0, 1.0]);

        ekf.predict(0.5);

        assert_relative_eq!(ekf.pose().2, 3.5 - 2.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn test_odometry_update_moves_toward_measurement() {
        let mut ekf = Ekf::default();
        ekf.update_odometry([1.0, -1.0, 0.2]).unwrap();

        let (x, y, theta) = ekf.pose();
        // gain 0.1 / (0.1 + 0.1) on every observed axis
        assert_relative_eq!(x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(y, -0.5, epsilon = 1e-12);
        assert_relative_eq!(theta, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_heading_innovation_takes_short_way() {
        let mut ekf = Ekf::default();
        ekf.set_state([0.0, 0.0, PI - 0.05, 0.0, 0.0, 0.0]);

        ekf.update_odometry([0.0, 0.0, -PI + 0.05]).unwrap();

        // Moves across ±π instead of sweeping back through zero
        assert!(ekf.pose().2.abs() > PI - 0.05);
    }

    #[test]
    fn test_measurement_reduces_uncertainty() {
        let mut ekf = Ekf::default();
        for _ in 0..10 {
            ekf.predict(0.1);
        }
        let before = position_variance(&ekf);

        ekf.update_odometry([0.0, 0.0, 0.0]).unwrap();

        assert!(position_variance(&ekf) < before);
    }

    #[test]
    fn test_twist_sets_heading_aligned_velocity() {
        let mut ekf = Ekf::default();
        ekf.set_state([0.0, 0.0, PI / 2.0, 0.0, 0.0, 0.0]);

        ekf.update_odometry_with_twist([0.0, 0.0, PI / 2.0], 0.4, 0.1)
            .unwrap();

        let (vx, vy, omega) = ekf.velocity();
        assert_relative_eq!(vx, 0.0, epsilon = 1e-12);
        assert_relative_eq!(vy, 0.4, epsilon = 1e-12);
        assert_relative_eq!(omega, 0.1);
        assert_relative_eq!(ekf.velocities().0, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_imu_update_observes_yaw_rate() {
        let mut ekf = Ekf::default();
        ekf.update_imu([0.5, 0.0, 0.0]).unwrap();

        let omega = ekf.velocity().2;
        // gain 0.1 / (0.1 + 0.05)
        assert_relative_eq!(omega, 0.5 * 0.1 / 0.15, epsilon = 1e-12);
        assert_eq!(ekf.pose(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_singular_innovation_keeps_estimate() {
        let config = FusionConfig {
            initial_covariance: 0.0,
            odometry_noise: [0.0, 0.0, 0.0],
            ..FusionConfig::default()
        };
        let mut ekf = Ekf::new(&config);
        ekf.set_state([1.0, 2.0, 0.3, 0.0, 0.0, 0.0]);

        let result = ekf.update_odometry([5.0, 5.0, 0.0]);

        assert!(matches!(result, Err(RoverError::SingularMatrix(_))));
        assert_eq!(ekf.pose(), (1.0, 2.0, 0.3));
    }

    #[test]
    fn test_confidences() {
        let mut ekf = Ekf::default();
        let (position, orientation) = ekf.confidences(1.0, 0.1);
        assert_relative_eq!(position, 0.8, epsilon = 1e-12);
        assert_relative_eq!(orientation, 0.0, epsilon = 1e-12);

        for _ in 0..50 {
            ekf.predict(1.0);
        }
        assert_eq!(ekf.confidences(1.0, 0.1), (0.0, 0.0));
    }

    #[test]
    fn test_reset_restores_initial_covariance() {
        let mut ekf = Ekf::default();
        ekf.predict(3.0);
        ekf.reset([1.0, 1.0, 4.0, 0.0, 0.0, 0.0]);

        assert_relative_eq!(ekf.covariance()[0][0], 0.1);
        assert_relative_eq!(ekf.pose().2, 4.0 - 2.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn test_invert_3x3() {
        let m = [[2.0, 0.0, 0.0], [0.0, 4.0, 1.0], [0.0, 1.0, 1.0]];
        let inv = invert_3x3(&m).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += m[i][k] * inv[k][j];
                }
                assert_relative_eq!(sum, if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
            }
        }
        assert!(invert_3x3(&[[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]).is_none());
    }
}
