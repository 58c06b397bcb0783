//! Error types for the rover control core

use thiserror::Error;

use crate::state_machine::RobotState;

/// Errors surfaced by rover components
#[derive(Debug, Error)]
pub enum RoverError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Singular matrix in {0} update")]
    SingularMatrix(&'static str),

    #[error("Goal rejected: robot cannot navigate from state {0}")]
    NavigationNotAllowed(RobotState),

    #[error("Goal rejected: coordinates ({x}, {y}) are not finite")]
    InvalidGoal { x: f64, y: f64 },

    #[error("Goal rejected: no path to ({x:.2}, {y:.2})")]
    NoPath { x: f64, y: f64 },

    #[error("Task '{0}' failed to join: {1}")]
    TaskJoin(&'static str, String),
}

pub type RoverResult<T> = Result<T, RoverError>;
