//! Fixed-rate task runner for the estimator loops
//!
//! Each [`PeriodicNode`] owns its state and is driven by one tokio task with
//! its own tick timer. The task only suspends at the rate-limiting sleep, so
//! a shutdown request is observed within one period at most.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::{RoverError, RoverResult};

/// A component stepped at a fixed rate
pub trait PeriodicNode: Send + 'static {
    fn name(&self) -> &'static str;

    /// One update step. Must not block.
    fn tick(&mut self);

    /// Called once after the last tick
    fn shutdown(&mut self) {}
}

#[derive(Debug)]
enum TaskMessage {
    Shutdown,
}

/// Handle to a running [`PeriodicNode`]
///
/// `stop` hands the node back so its final state can be inspected.
pub struct PeriodicTask<N: PeriodicNode> {
    name: &'static str,
    control: mpsc::Sender<TaskMessage>,
    handle: JoinHandle<N>,
}

impl<N: PeriodicNode> PeriodicTask<N> {
    /// Spawn `node` on the current tokio runtime, ticking every `period`
    pub fn spawn(mut node: N, period: Duration) -> Self {
        let name = node.name();
        let (control, mut rx) = mpsc::channel::<TaskMessage>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut panics = 0u64;

            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => {
                        match msg {
                            Some(TaskMessage::Shutdown) | None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if catch_unwind(AssertUnwindSafe(|| node.tick())).is_err() {
                            panics += 1;
                            error!(node = name, panics, "periodic node panicked during tick");
                        }
                    }
                }
            }

            node.shutdown();
            debug!(node = name, "periodic task exited");
            node
        });

        info!(node = name, period_ms = period.as_millis() as u64, "periodic task started");
        Self {
            name,
            control,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the timer, let the current tick finish and return the node
    pub async fn stop(self) -> RoverResult<N> {
        let _ = self.control.send(TaskMessage::Shutdown).await;
        let node = self
            .handle
            .await
            .map_err(|e| RoverError::TaskJoin(self.name, e.to_string()))?;
        info!(node = self.name, "periodic task stopped");
        Ok(node)
    }
}
