//! Testnet run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TestnetConfig;
use crate::error::{Result, TestnetError};
use crate::plan::Plan;

/// State of a testnet run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Configuration accepted and planned.
    Planned,

    /// Images and instances are being provisioned.
    Provisioning,

    /// Provisioning finished with at least one instance running.
    Running,

    /// Resources are being removed.
    CleaningUp,

    /// All resources are gone.
    Stopped,

    /// Provisioning aborted, or no instance could be started.
    Failed,
}

impl RunState {
    /// Returns true if the run may move to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, next),
            (Planned, Provisioning)
                | (Planned, CleaningUp)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, CleaningUp)
                | (Running, Failed)
                | (Failed, CleaningUp)
                | (CleaningUp, Stopped)
        )
    }

    /// Returns the state name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planned => "Planned",
            Self::Provisioning => "Provisioning",
            Self::Running => "Running",
            Self::CleaningUp => "CleaningUp",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A recorded run-state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Previous state.
    pub from: RunState,
    /// New state.
    pub to: RunState,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// One configuration, its plan, and where the run stands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testnet {
    config: TestnetConfig,
    plan: Plan,
    state: RunState,
    history: Vec<StateChange>,
}

impl Testnet {
    /// Creates a testnet in the `Planned` state.
    pub fn new(config: TestnetConfig, plan: Plan) -> Self {
        Self {
            config,
            plan,
            state: RunState::Planned,
            history: Vec::new(),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &TestnetConfig {
        &self.config
    }

    /// The instance plan.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// All state changes so far.
    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Moves to `next`, rejecting transitions the run state machine forbids.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TestnetError::invalid_state_transition(
                self.state.name(),
                next.name(),
            ));
        }
        self.history.push(StateChange {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}
