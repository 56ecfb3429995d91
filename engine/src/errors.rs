//! Error types for the deployment engine

use std::time::Duration;

use thiserror::Error;

use crate::models::deployment::{DeploymentId, DeploymentState, StageName};

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Deployment already running: {0}")]
    AlreadyRunning(DeploymentId),

    #[error("Invalid transition: cannot {action} from {state}")]
    InvalidTransition {
        state: DeploymentState,
        action: &'static str,
    },

    #[error("Stage {stage} failed with exit code {exit_code}")]
    StageFailure { stage: StageName, exit_code: i32 },

    #[error("Stage {stage} exceeded maximum duration of {limit:?}")]
    StageTimeout { stage: StageName, limit: Duration },

    #[error("Failed to spawn {program}: {message}")]
    ProcessSpawn { program: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscriber lagged behind, resume from sequence {next_sequence}")]
    SubscriberLagged { next_sequence: u64 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
