use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of a navigation command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Path following with the proportional pure-pursuit controller
    PurePursuit,
    /// Dynamic-window steering toward the look-ahead point around tracked obstacles
    AvoidObstacle,
    /// Deliberate stop (goal reached, end of path)
    Stop,
    /// Imminent collision reported by a range sensor
    EmergencyStop,
    /// Every sampled local trajectory collides
    Blocked,
}

impl CommandKind {
    /// Whether this command is a zero-velocity halt
    pub fn is_halt(self) -> bool {
        matches!(self, Self::Stop | Self::EmergencyStop | Self::Blocked)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PurePursuit => "pure_pursuit",
            Self::AvoidObstacle => "avoid_obstacle",
            Self::Stop => "stop",
            Self::EmergencyStop => "emergency_stop",
            Self::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

/// Motion command handed to the motor driver every control tick
///
/// Both speeds are normalized by the configured maxima and clamped to [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavigationCommand {
    pub linear_speed: f64,
    pub angular_speed: f64,
    pub kind: CommandKind,
}

impl NavigationCommand {
    /// Normalize physical velocities (m/s, rad/s) into a command
    pub fn from_velocity(
        linear: f64,
        angular: f64,
        max_linear: f64,
        max_angular: f64,
        kind: CommandKind,
    ) -> Self {
        Self {
            linear_speed: (linear / max_linear).clamp(-1.0, 1.0),
            angular_speed: (angular / max_angular).clamp(-1.0, 1.0),
            kind,
        }
    }

    /// Zero-velocity command of the given kind
    pub fn halt(kind: CommandKind) -> Self {
        Self {
            linear_speed: 0.0,
            angular_speed: 0.0,
            kind,
        }
    }

    pub fn stop() -> Self {
        Self::halt(CommandKind::Stop)
    }

    pub fn emergency_stop() -> Self {
        Self::halt(CommandKind::EmergencyStop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_velocity_normalizes() {
        let cmd = NavigationCommand::from_velocity(0.25, -0.5, 0.5, 1.0, CommandKind::PurePursuit);
        assert_relative_eq!(cmd.linear_speed, 0.5);
        assert_relative_eq!(cmd.angular_speed, -0.5);
        assert_eq!(cmd.kind, CommandKind::PurePursuit);
    }

    #[test]
    fn test_from_velocity_clamps() {
        let cmd = NavigationCommand::from_velocity(2.0, -3.0, 0.5, 1.0, CommandKind::PurePursuit);
        assert_relative_eq!(cmd.linear_speed, 1.0);
        assert_relative_eq!(cmd.angular_speed, -1.0);
    }

    #[test]
    fn test_halt_kinds() {
        assert!(NavigationCommand::stop().kind.is_halt());
        assert!(NavigationCommand::emergency_stop().kind.is_halt());
        assert!(NavigationCommand::halt(CommandKind::Blocked).kind.is_halt());
        assert!(!CommandKind::PurePursuit.is_halt());
        assert_eq!(NavigationCommand::stop().linear_speed, 0.0);
    }
}
