//! Pose estimation
//!
//! # Features
//!
//! - [`EncoderReader`]: pulse capture shared with the GPIO callback context
//! - [`Odometry`]: differential-drive dead reckoning with a drift model
//! - [`Ekf`]: 6-state extended Kalman filter
//! - [`SensorFusion`]: periodic EKF loop over odometry and IMU
//!
//! Data flows encoder → odometry → fusion. Each stage hands its output to
//! the next as a copied snapshot through a `tokio::sync::watch` channel.

pub mod ekf;
pub mod encoder;
pub mod fusion;
pub mod odometry;

pub use ekf::Ekf;
pub use encoder::{EncoderData, EncoderReader, EncoderStatus, PulseDelta, Wheel, WheelDirection};
pub use fusion::{FusedPose, FusionHealth, FusionStatus, SensorFusion, SensorWeights};
pub use odometry::{Odometry, OdometryData, OdometryStatus};
