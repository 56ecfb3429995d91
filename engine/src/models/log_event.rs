//! Log event models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::{DeploymentId, DeploymentState, StageName, StageStatus};

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

/// Lifecycle marker carried by synthetic system events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "marker", rename_all = "snake_case")]
pub enum Marker {
    StageStarted { stage: StageName },
    StageFinished { stage: StageName, status: StageStatus },
    DeploymentFinished { state: DeploymentState },
}

/// One line of a deployment transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub deployment_id: DeploymentId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
    #[serde(flatten)]
    pub marker: Option<Marker>,
}

impl LogEvent {
    /// Whether this event closes the transcript
    pub fn is_terminal(&self) -> bool {
        matches!(self.marker, Some(Marker::DeploymentFinished { .. }))
    }
}

/// A log line before the hub assigns its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: LogSource,
    pub text: String,
    pub marker: Option<Marker>,
}

impl LogRecord {
    pub fn output(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            marker: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::output(LogSource::System, text)
    }

    pub fn stage_started(stage: StageName) -> Self {
        Self {
            source: LogSource::System,
            text: format!("Stage {} started", stage),
            marker: Some(Marker::StageStarted { stage }),
        }
    }

    pub fn stage_finished(stage: StageName, status: StageStatus, detail: Option<&str>) -> Self {
        let text = match detail {
            Some(detail) => format!("Stage {} {}: {}", stage, status, detail),
            None => format!("Stage {} {}", stage, status),
        };
        Self {
            source: LogSource::System,
            text,
            marker: Some(Marker::StageFinished { stage, status }),
        }
    }

    pub fn deployment_finished(state: DeploymentState, detail: Option<&str>) -> Self {
        let text = match detail {
            Some(detail) => format!("Deployment {}: {}", state, detail),
            None => format!("Deployment {}", state),
        };
        Self {
            source: LogSource::System,
            text,
            marker: Some(Marker::DeploymentFinished { state }),
        }
    }
}
