//! In-memory status store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::EngineError;
use crate::models::deployment::{Deployment, DeploymentId, ListFilter, StageUpdate};
use crate::models::log_event::LogEvent;
use crate::store::{not_found, unseen_events, StatusStore};

struct Entry {
    deployment: Deployment,
    transcript: Vec<LogEvent>,
}

/// Status store kept in process memory
#[derive(Default)]
pub struct MemoryStatusStore {
    entries: RwLock<HashMap<DeploymentId, Entry>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&deployment.id) {
            return Err(EngineError::Conflict(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        entries.insert(
            deployment.id.clone(),
            Entry {
                deployment: deployment.clone(),
                transcript: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_stage(
        &self,
        id: &DeploymentId,
        update: &StageUpdate,
    ) -> Result<Deployment, EngineError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.deployment.apply(update);
        Ok(entry.deployment.clone())
    }

    async fn append_log_segment(
        &self,
        id: &DeploymentId,
        events: &[LogEvent],
    ) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        let rest = unseen_events(id, entry.transcript.len() as u64, events)?;
        entry.transcript.extend_from_slice(rest);
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, EngineError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.deployment.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn transcript(&self, id: &DeploymentId) -> Result<Vec<LogEvent>, EngineError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.transcript.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Deployment>, EngineError> {
        let mut deployments: Vec<Deployment> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| filter.matches(&entry.deployment))
            .map(|entry| entry.deployment.clone())
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn delete(&self, id: &DeploymentId) -> Result<(), EngineError> {
        self.entries
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }
}
