//! Robot lifecycle states and the gated transition machine
//!
//! # Features
//!
//! - Thirteen lifecycle states with a fixed adjacency table
//! - Async validators that can veto entering a state
//! - Async enter/exit callbacks
//! - Audited history: rejected transitions are recorded with `success = false`
//! - `SystemState` event published after every successful transition
//!
//! # Example
//!
//! ```rust,no_run
//! use rover_core::events::EventBus;
//! use rover_core::state_machine::{RobotState, RobotStateMachine, StateChangeReason};
//!
//! # async fn demo() {
//! let machine = RobotStateMachine::new(EventBus::default());
//! assert!(machine.transition_to(RobotState::Idle, StateChangeReason::SystemInit, None).await);
//! assert!(!machine.can_transition_to(RobotState::Shutdown));
//! # }
//! ```

mod machine;

pub use machine::{RobotStateMachine, StateCallback, StateMachineStatus, StateValidator};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Initializing,
    Idle,
    Navigating,
    Mapping,
    Charging,
    ManualControl,
    Calibrating,
    Updating,
    EmergencyStop,
    Error,
    Recovering,
    ShuttingDown,
    /// Terminal
    Shutdown,
}

impl RobotState {
    pub const ALL: [RobotState; 13] = [
        RobotState::Initializing,
        RobotState::Idle,
        RobotState::Navigating,
        RobotState::Mapping,
        RobotState::Charging,
        RobotState::ManualControl,
        RobotState::Calibrating,
        RobotState::Updating,
        RobotState::EmergencyStop,
        RobotState::Error,
        RobotState::Recovering,
        RobotState::ShuttingDown,
        RobotState::Shutdown,
    ];

    /// States reachable from `self` in one transition
    pub fn allowed_transitions(self) -> &'static [RobotState] {
        use RobotState::*;
        match self {
            Initializing => &[Idle, Error, ShuttingDown],
            Idle => &[
                Navigating,
                Mapping,
                Charging,
                ManualControl,
                Calibrating,
                Updating,
                EmergencyStop,
                Error,
                ShuttingDown,
            ],
            Navigating => &[Idle, EmergencyStop, Error, Charging, ManualControl],
            Mapping => &[Idle, EmergencyStop, Error, Navigating],
            Charging => &[Idle, EmergencyStop, Error],
            ManualControl => &[Idle, EmergencyStop, Error],
            Calibrating => &[Idle, Error, EmergencyStop],
            Updating => &[Idle, Error, ShuttingDown],
            EmergencyStop => &[Idle, Recovering, Error, ShuttingDown],
            Error => &[Recovering, EmergencyStop, ShuttingDown],
            Recovering => &[Idle, Error, EmergencyStop],
            ShuttingDown => &[Shutdown],
            Shutdown => &[],
        }
    }

    pub fn can_transition(self, to: RobotState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Navigating => "navigating",
            Self::Mapping => "mapping",
            Self::Charging => "charging",
            Self::ManualControl => "manual_control",
            Self::Calibrating => "calibrating",
            Self::Updating => "updating",
            Self::EmergencyStop => "emergency_stop",
            Self::Error => "error",
            Self::Recovering => "recovering",
            Self::ShuttingDown => "shutting_down",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeReason {
    SystemInit,
    SystemShutdown,
    UserCommand,
    TaskCompleted,
    TaskFailed,
    NewTaskAssigned,
    ObstacleDetected,
    SensorFailure,
    LowBattery,
    EmergencyButton,
    AutoRecovery,
    ManualRecovery,
    CalibrationRequired,
    SystemUpdate,
}

impl fmt::Display for StateChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One audited transition attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RobotState,
    pub to: RobotState,
    pub reason: StateChangeReason,
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub payload: Option<serde_json::Value>,
    pub success: bool,
}
