//! Status store: durable deployment records and transcripts

pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::deployment::{Deployment, DeploymentId, ListFilter, StageUpdate};
use crate::models::log_event::LogEvent;

pub use file::FileStatusStore;
pub use memory::MemoryStatusStore;

/// Persistence interface for deployment status. Each call is expected to be
/// durable once it returns.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a new record; `Conflict` if the id exists
    async fn create(&self, deployment: &Deployment) -> Result<(), EngineError>;

    /// Apply a state change and return the updated record
    async fn update_stage(
        &self,
        id: &DeploymentId,
        update: &StageUpdate,
    ) -> Result<Deployment, EngineError>;

    /// Append events to the transcript. Events already stored are skipped,
    /// so re-sending a segment is harmless.
    async fn append_log_segment(
        &self,
        id: &DeploymentId,
        events: &[LogEvent],
    ) -> Result<(), EngineError>;

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, EngineError>;

    /// Full persisted transcript in sequence order
    async fn transcript(&self, id: &DeploymentId) -> Result<Vec<LogEvent>, EngineError>;

    /// Matching records, newest first
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Deployment>, EngineError>;

    async fn delete(&self, id: &DeploymentId) -> Result<(), EngineError>;
}

/// The part of `events` not yet stored, given `stored` events on record
pub(crate) fn unseen_events<'a>(
    id: &DeploymentId,
    stored: u64,
    events: &'a [LogEvent],
) -> Result<&'a [LogEvent], EngineError> {
    let skip = events.iter().take_while(|e| e.sequence < stored).count();
    let rest = &events[skip..];
    if let Some(first) = rest.first() {
        if first.sequence != stored {
            return Err(EngineError::StorageError(format!(
                "transcript gap for {}: expected sequence {}, got {}",
                id, stored, first.sequence
            )));
        }
    }
    Ok(rest)
}

pub(crate) fn not_found(id: &DeploymentId) -> EngineError {
    EngineError::NotFound(format!("deployment {}", id))
}
