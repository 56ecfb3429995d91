//! File-backed status store
//!
//! Layout: `<root>/<deployment_id>/deployment.json` (replaced atomically on
//! every update) and `<root>/<deployment_id>/transcript.jsonl` (one event per
//! line, appended and synced per segment).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{Deployment, DeploymentId, ListFilter, StageUpdate};
use crate::models::log_event::LogEvent;
use crate::store::{not_found, unseen_events, StatusStore};

const RECORD_FILE: &str = "deployment.json";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";

/// Status store persisted as JSON files
pub struct FileStatusStore {
    root: Dir,
    /// Stored transcript length per deployment, loaded lazily
    transcript_lens: Mutex<HashMap<DeploymentId, u64>>,
}

impl FileStatusStore {
    pub async fn open(root: Dir) -> Result<Self, EngineError> {
        root.create().await?;
        Ok(Self {
            root,
            transcript_lens: Mutex::new(HashMap::new()),
        })
    }

    fn deployment_dir(&self, id: &DeploymentId) -> Result<Dir, EngineError> {
        let name = id.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(not_found(id));
        }
        Ok(self.root.subdir(name))
    }

    fn record_file(&self, id: &DeploymentId) -> Result<File, EngineError> {
        Ok(self.deployment_dir(id)?.file(RECORD_FILE))
    }

    fn transcript_file(&self, id: &DeploymentId) -> Result<File, EngineError> {
        Ok(self.deployment_dir(id)?.file(TRANSCRIPT_FILE))
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), EngineError> {
        let record = self.record_file(&deployment.id)?;
        if record.exists().await {
            return Err(EngineError::Conflict(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        record.write_json(deployment).await?;
        self.transcript_lens
            .lock()
            .await
            .insert(deployment.id.clone(), 0);
        Ok(())
    }

    async fn update_stage(
        &self,
        id: &DeploymentId,
        update: &StageUpdate,
    ) -> Result<Deployment, EngineError> {
        let mut deployment = self.get(id).await?;
        deployment.apply(update);
        self.record_file(id)?.write_json(&deployment).await?;
        Ok(deployment)
    }

    async fn append_log_segment(
        &self,
        id: &DeploymentId,
        events: &[LogEvent],
    ) -> Result<(), EngineError> {
        let record = self.record_file(id)?;
        if !record.exists().await {
            return Err(not_found(id));
        }
        let transcript = self.transcript_file(id)?;

        let mut lens = self.transcript_lens.lock().await;
        let stored = match lens.get(id) {
            Some(len) => *len,
            None => {
                if transcript.repair_json_lines().await? {
                    warn!(deployment_id = %id, "repaired torn transcript tail");
                }
                transcript.read_json_lines::<LogEvent>().await?.len() as u64
            }
        };

        let rest = unseen_events(id, stored, events)?;
        if let Err(e) = transcript.append_json_lines(rest).await {
            // a partial write may have landed; reload and repair next time
            lens.remove(id);
            return Err(e);
        }
        lens.insert(id.clone(), stored + rest.len() as u64);
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, EngineError> {
        let record = self.record_file(id)?;
        if !record.exists().await {
            return Err(not_found(id));
        }
        record.read_json().await
    }

    async fn transcript(&self, id: &DeploymentId) -> Result<Vec<LogEvent>, EngineError> {
        if !self.record_file(id)?.exists().await {
            return Err(not_found(id));
        }
        self.transcript_file(id)?.read_json_lines().await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Deployment>, EngineError> {
        let mut deployments = Vec::new();
        for path in self.root.list_dirs().await? {
            let record = File::new(path.join(RECORD_FILE));
            if !record.exists().await {
                continue;
            }
            match record.read_json::<Deployment>().await {
                Ok(deployment) if filter.matches(&deployment) => deployments.push(deployment),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), "skipping unreadable deployment record: {}", e),
            }
        }
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn delete(&self, id: &DeploymentId) -> Result<(), EngineError> {
        let dir = self.deployment_dir(id)?;
        if !dir.exists().await {
            return Err(not_found(id));
        }
        dir.delete().await?;
        self.transcript_lens.lock().await.remove(id);
        Ok(())
    }
}
