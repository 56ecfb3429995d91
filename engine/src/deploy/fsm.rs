//! Finite State Machine for the deployment lifecycle
//!
//! `Pending -> Provisioning -> Configuring -> Succeeded`, with `Failed`
//! reachable from either running stage and `Cancelled` from any
//! non-terminal state. Terminal states accept no further events.

use crate::errors::EngineError;
use crate::models::deployment::{DeploymentState, FailureKind, Outcome, StageName};

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Begin the pipeline
    Start,

    /// Provisioning stage completed successfully
    ProvisionSucceeded,

    /// Configuration stage completed successfully
    ConfigureSucceeded,

    /// The running stage failed
    StageFailed {
        kind: FailureKind,
        exit_code: Option<i32>,
        reason: String,
    },

    /// Cancellation requested
    Cancel,

    /// Found non-terminal after an engine restart
    Interrupt,
}

impl DeploymentEvent {
    fn action(&self) -> &'static str {
        match self {
            DeploymentEvent::Start => "start",
            DeploymentEvent::ProvisionSucceeded => "complete provisioning",
            DeploymentEvent::ConfigureSucceeded => "complete configuration",
            DeploymentEvent::StageFailed { .. } => "fail stage",
            DeploymentEvent::Cancel => "cancel",
            DeploymentEvent::Interrupt => "interrupt",
        }
    }
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    outcome: Option<Outcome>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::from_state(DeploymentState::Pending)
    }

    /// Resume the FSM from a persisted state
    pub fn from_state(state: DeploymentState) -> Self {
        Self {
            state,
            outcome: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Terminal outcome, set once a terminal state is reached
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, EngineError> {
        let stage = self.state.stage();
        let new_state = match (self.state, &event) {
            (DeploymentState::Pending, DeploymentEvent::Start) => DeploymentState::Provisioning,

            (DeploymentState::Provisioning, DeploymentEvent::ProvisionSucceeded) => {
                DeploymentState::Configuring
            }

            (DeploymentState::Configuring, DeploymentEvent::ConfigureSucceeded) => {
                self.outcome = Some(Outcome::Succeeded);
                DeploymentState::Succeeded
            }

            (
                DeploymentState::Provisioning | DeploymentState::Configuring,
                DeploymentEvent::StageFailed {
                    kind,
                    exit_code,
                    reason,
                },
            ) => {
                self.outcome = Some(Outcome::Failed {
                    stage,
                    kind: *kind,
                    exit_code: *exit_code,
                    reason: reason.clone(),
                });
                DeploymentState::Failed
            }

            (state, DeploymentEvent::Cancel) if !state.is_terminal() => {
                self.outcome = Some(Outcome::Cancelled { stage });
                DeploymentState::Cancelled
            }

            (state, DeploymentEvent::Interrupt) if !state.is_terminal() => {
                self.outcome = Some(Outcome::Failed {
                    stage,
                    kind: FailureKind::Interrupted,
                    exit_code: None,
                    reason: "interrupted".to_string(),
                });
                DeploymentState::Failed
            }

            (state, event) => {
                return Err(EngineError::InvalidTransition {
                    state,
                    action: event.action(),
                });
            }
        };

        self.state = new_state;
        Ok(new_state)
    }

    /// Event to apply when `stage` completes successfully
    pub fn success_event(stage: StageName) -> DeploymentEvent {
        match stage {
            StageName::Provision => DeploymentEvent::ProvisionSucceeded,
            StageName::Configure => DeploymentEvent::ConfigureSucceeded,
        }
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
