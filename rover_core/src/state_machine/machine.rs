use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::{RobotState, StateChangeReason, StateTransition};
use crate::events::{Event, EventBus, EventPayload, EventPriority, SystemStateChange};
use crate::messages::now_secs;

const DEFAULT_MAX_HISTORY: usize = 100;

/// Veto check run before entering a state; `Ok(false)` or `Err` rejects
pub type StateValidator = Arc<
    dyn Fn(RobotState, Option<serde_json::Value>) -> BoxFuture<'static, anyhow::Result<bool>>
        + Send
        + Sync,
>;

/// Hook run when a state is entered or left
pub type StateCallback =
    Arc<dyn Fn(RobotState) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Snapshot of the machine for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineStatus {
    pub current_state: RobotState,
    pub previous_state: Option<RobotState>,
    pub state_duration: f64,
    pub available_transitions: Vec<RobotState>,
    pub history_count: usize,
    pub last_transition: Option<StateTransition>,
}

struct MachineState {
    current: RobotState,
    previous: Option<RobotState>,
    entered_at: Instant,
    history: VecDeque<StateTransition>,
}

/// Central lifecycle state machine
///
/// Transitions are serialized: concurrent `transition_to` calls run one at a
/// time. Callbacks and validators must not call `transition_to` themselves.
pub struct RobotStateMachine {
    state: RwLock<MachineState>,
    transition_lock: tokio::sync::Mutex<()>,
    enter_callbacks: RwLock<HashMap<RobotState, Vec<StateCallback>>>,
    exit_callbacks: RwLock<HashMap<RobotState, Vec<StateCallback>>>,
    validators: RwLock<HashMap<RobotState, Vec<StateValidator>>>,
    bus: EventBus,
    max_history: usize,
}

impl RobotStateMachine {
    /// Create a machine in `Initializing`
    pub fn new(bus: EventBus) -> Self {
        Self::with_history(bus, DEFAULT_MAX_HISTORY)
    }

    pub fn with_history(bus: EventBus, max_history: usize) -> Self {
        info!("robot state machine initialized");
        Self {
            state: RwLock::new(MachineState {
                current: RobotState::Initializing,
                previous: None,
                entered_at: Instant::now(),
                history: VecDeque::new(),
            }),
            transition_lock: tokio::sync::Mutex::new(()),
            enter_callbacks: RwLock::new(HashMap::new()),
            exit_callbacks: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            bus,
            max_history,
        }
    }

    /// Register a callback run after `state` is entered
    pub fn on_state_enter<F, Fut>(&self, state: RobotState, callback: F)
    where
        F: Fn(RobotState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: StateCallback = Arc::new(move |s| callback(s).boxed());
        self.enter_callbacks
            .write()
            .entry(state)
            .or_default()
            .push(callback);
    }

    /// Register a callback run before `state` is left
    pub fn on_state_exit<F, Fut>(&self, state: RobotState, callback: F)
    where
        F: Fn(RobotState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: StateCallback = Arc::new(move |s| callback(s).boxed());
        self.exit_callbacks
            .write()
            .entry(state)
            .or_default()
            .push(callback);
    }

    /// Register a precondition for entering `state`
    pub fn add_state_validator<F, Fut>(&self, state: RobotState, validator: F)
    where
        F: Fn(RobotState, Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let validator: StateValidator = Arc::new(move |s, data| validator(s, data).boxed());
        self.validators
            .write()
            .entry(state)
            .or_default()
            .push(validator);
    }

    /// Attempt a transition
    ///
    /// Returns false, and records a failed transition, when the edge is not
    /// in the adjacency table or a validator for `target` rejects it.
    pub async fn transition_to(
        &self,
        target: RobotState,
        reason: StateChangeReason,
        payload: Option<serde_json::Value>,
    ) -> bool {
        let _guard = self.transition_lock.lock().await;
        let from = self.current_state();

        if !from.can_transition(target) {
            warn!(from = %from, to = %target, reason = %reason, "transition not allowed");
            self.push_history(StateTransition {
                from,
                to: target,
                reason,
                timestamp: now_secs(),
                payload,
                success: false,
            });
            return false;
        }

        if !self.validate(target, &payload).await {
            warn!(from = %from, to = %target, reason = %reason, "transition rejected by validator");
            self.push_history(StateTransition {
                from,
                to: target,
                reason,
                timestamp: now_secs(),
                payload,
                success: false,
            });
            return false;
        }

        self.run_callbacks(&self.exit_callbacks, from, "exit").await;

        {
            let mut state = self.state.write();
            state.previous = Some(from);
            state.current = target;
            state.entered_at = Instant::now();
        }
        self.push_history(StateTransition {
            from,
            to: target,
            reason,
            timestamp: now_secs(),
            payload,
            success: true,
        });

        self.run_callbacks(&self.enter_callbacks, target, "enter")
            .await;

        let change = SystemStateChange {
            old_state: from,
            new_state: target,
            reason,
        };
        self.bus.publish(
            Event::new("RobotStateMachine", EventPayload::SystemState(change)),
            EventPriority::High,
        );

        info!(from = %from, to = %target, reason = %reason, "state transition");
        true
    }

    async fn validate(&self, target: RobotState, payload: &Option<serde_json::Value>) -> bool {
        let validators: Vec<StateValidator> = self
            .validators
            .read()
            .get(&target)
            .cloned()
            .unwrap_or_default();

        for validator in validators {
            match validator(target, payload.clone()).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    error!(state = %target, "state validator failed: {e:#}");
                    return false;
                }
            }
        }
        true
    }

    async fn run_callbacks(
        &self,
        table: &RwLock<HashMap<RobotState, Vec<StateCallback>>>,
        state: RobotState,
        phase: &'static str,
    ) {
        let callbacks: Vec<StateCallback> = table.read().get(&state).cloned().unwrap_or_default();
        for callback in callbacks {
            if let Err(e) = callback(state).await {
                error!(state = %state, phase, "state callback failed: {e:#}");
            }
        }
    }

    fn push_history(&self, transition: StateTransition) {
        let mut state = self.state.write();
        if state.history.len() >= self.max_history {
            state.history.pop_front();
        }
        state.history.push_back(transition);
    }

    pub fn current_state(&self) -> RobotState {
        self.state.read().current
    }

    pub fn previous_state(&self) -> Option<RobotState> {
        self.state.read().previous
    }

    /// Seconds spent in the current state
    pub fn state_duration(&self) -> f64 {
        self.state.read().entered_at.elapsed().as_secs_f64()
    }

    /// Last `limit` transitions (all when `None`), oldest first
    pub fn history(&self, limit: Option<usize>) -> Vec<StateTransition> {
        let state = self.state.read();
        let skip = limit.map_or(0, |n| state.history.len().saturating_sub(n));
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn is_in_state(&self, states: &[RobotState]) -> bool {
        states.contains(&self.current_state())
    }

    /// Whether the adjacency table permits `target` from the current state
    pub fn can_transition_to(&self, target: RobotState) -> bool {
        self.current_state().can_transition(target)
    }

    pub fn available_transitions(&self) -> &'static [RobotState] {
        self.current_state().allowed_transitions()
    }

    pub fn status(&self) -> StateMachineStatus {
        let state = self.state.read();
        StateMachineStatus {
            current_state: state.current,
            previous_state: state.previous,
            state_duration: state.entered_at.elapsed().as_secs_f64(),
            available_transitions: state.current.allowed_transitions().to_vec(),
            history_count: state.history.len(),
            last_transition: state.history.back().cloned(),
        }
    }
}

impl std::fmt::Debug for RobotStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotStateMachine")
            .field("current", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn machine() -> (RobotStateMachine, EventBus) {
        let bus = EventBus::new(100);
        (RobotStateMachine::new(bus.clone()), bus)
    }

    async fn to_idle(machine: &RobotStateMachine) {
        assert!(
            machine
                .transition_to(RobotState::Idle, StateChangeReason::SystemInit, None)
                .await
        );
    }

    #[tokio::test]
    async fn test_idle_to_navigating_succeeds() {
        let (machine, _bus) = machine();
        to_idle(&machine).await;

        assert!(
            machine
                .transition_to(
                    RobotState::Navigating,
                    StateChangeReason::NewTaskAssigned,
                    Some(serde_json::json!({"goal": {"x": 1.0, "y": 2.0}})),
                )
                .await
        );
        assert_eq!(machine.current_state(), RobotState::Navigating);
        assert_eq!(machine.previous_state(), Some(RobotState::Idle));
    }

    #[tokio::test]
    async fn test_rejected_transition_is_recorded() {
        let (machine, _bus) = machine();

        // Initializing -> Navigating is not in the table
        assert!(
            !machine
                .transition_to(RobotState::Navigating, StateChangeReason::UserCommand, None)
                .await
        );
        assert_eq!(machine.current_state(), RobotState::Initializing);

        let history = machine.history(None);
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].from, RobotState::Initializing);
        assert_eq!(history[0].to, RobotState::Navigating);
    }

    #[tokio::test]
    async fn test_shutdown_has_no_exit() {
        let (machine, _bus) = machine();
        to_idle(&machine).await;
        assert!(
            machine
                .transition_to(RobotState::ShuttingDown, StateChangeReason::SystemShutdown, None)
                .await
        );
        assert!(
            machine
                .transition_to(RobotState::Shutdown, StateChangeReason::SystemShutdown, None)
                .await
        );

        for state in RobotState::ALL {
            assert!(
                !machine
                    .transition_to(state, StateChangeReason::UserCommand, None)
                    .await
            );
        }
        assert_eq!(machine.current_state(), RobotState::Shutdown);
        assert!(machine.available_transitions().is_empty());
    }

    #[tokio::test]
    async fn test_validator_can_veto() {
        let (machine, _bus) = machine();
        let battery_ok = Arc::new(AtomicBool::new(false));
        let flag = battery_ok.clone();
        machine.add_state_validator(RobotState::Navigating, move |_state, _data| {
            let flag = flag.clone();
            async move { Ok(flag.load(Ordering::SeqCst)) }
        });
        to_idle(&machine).await;

        assert!(
            !machine
                .transition_to(RobotState::Navigating, StateChangeReason::NewTaskAssigned, None)
                .await
        );
        let last = machine.history(Some(1));
        assert!(!last[0].success);
        assert_eq!(machine.current_state(), RobotState::Idle);

        battery_ok.store(true, Ordering::SeqCst);
        assert!(
            machine
                .transition_to(RobotState::Navigating, StateChangeReason::NewTaskAssigned, None)
                .await
        );
    }

    #[tokio::test]
    async fn test_validator_error_rejects() {
        let (machine, _bus) = machine();
        machine.add_state_validator(RobotState::Idle, |_state, _data| async {
            Err(anyhow::anyhow!("sensor bus unavailable"))
        });

        assert!(
            !machine
                .transition_to(RobotState::Idle, StateChangeReason::SystemInit, None)
                .await
        );
        assert_eq!(machine.current_state(), RobotState::Initializing);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_order() {
        let (machine, _bus) = machine();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let t = trace.clone();
        machine.on_state_exit(RobotState::Initializing, move |state| {
            let t = t.clone();
            async move {
                t.lock().push(format!("exit {state}"));
                Ok(())
            }
        });
        let t = trace.clone();
        machine.on_state_enter(RobotState::Idle, move |state| {
            let t = t.clone();
            async move {
                t.lock().push(format!("enter {state}"));
                Ok(())
            }
        });
        machine.on_state_enter(RobotState::Idle, |_state| async {
            Err(anyhow::anyhow!("callback failure is logged only"))
        });

        to_idle(&machine).await;
        assert_eq!(*trace.lock(), vec!["exit initializing", "enter idle"]);
    }

    #[tokio::test]
    async fn test_successful_transition_publishes_event() {
        let (machine, bus) = machine();
        to_idle(&machine).await;

        let stats = bus.stats();
        assert_eq!(stats.events_by_kind[&EventKind::SystemState], 1);
        assert_eq!(bus.recent_events(1)[0].kind, EventKind::SystemState);

        // Rejections do not announce anything
        machine
            .transition_to(RobotState::Shutdown, StateChangeReason::UserCommand, None)
            .await;
        assert_eq!(bus.stats().events_by_kind[&EventKind::SystemState], 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let machine = RobotStateMachine::with_history(EventBus::new(10), 3);
        for _ in 0..5 {
            machine
                .transition_to(RobotState::Charging, StateChangeReason::LowBattery, None)
                .await;
        }
        assert_eq!(machine.history(None).len(), 3);
        assert_eq!(machine.status().history_count, 3);
    }

    #[tokio::test]
    async fn test_queries() {
        let (machine, _bus) = machine();
        to_idle(&machine).await;

        assert!(machine.is_in_state(&[RobotState::Idle, RobotState::Charging]));
        assert!(!machine.is_in_state(&[RobotState::Navigating]));
        assert!(machine.can_transition_to(RobotState::Navigating));
        assert!(!machine.can_transition_to(RobotState::Recovering));
        assert!(machine.state_duration() >= 0.0);

        let status = machine.status();
        assert_eq!(status.current_state, RobotState::Idle);
        assert_eq!(status.available_transitions.len(), 9);
        assert!(status.last_transition.map_or(false, |t| t.success));
    }
}
