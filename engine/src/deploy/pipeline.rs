//! Deployment pipeline
//!
//! Drives one deployment through its stages with the state machine, which is
//! the only writer of the deployment's status. Every transition is persisted
//! (transcript first, then the record) before the next stage begins.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::stage::{StageExecutor, StageVerdict, Transcript};
use crate::errors::EngineError;
use crate::hub::LogHub;
use crate::models::deployment::{
    Deployment, DeploymentId, FailureKind, Outcome, StageResult, StageUpdate,
};
use crate::models::log_event::{LogEvent, LogRecord};
use crate::store::StatusStore;

/// Stage sequencing for deployments
pub struct Pipeline {
    executor: Arc<StageExecutor>,
    store: Arc<dyn StatusStore>,
    hub: LogHub,
}

impl Pipeline {
    pub fn new(executor: Arc<StageExecutor>, store: Arc<dyn StatusStore>, hub: LogHub) -> Self {
        Self {
            executor,
            store,
            hub,
        }
    }

    pub fn executor(&self) -> &Arc<StageExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Run a pending deployment to a terminal state
    pub async fn start(
        &self,
        deployment_id: &DeploymentId,
        cancel: &CancellationToken,
    ) -> Result<Deployment, EngineError> {
        let deployment = self.store.get(deployment_id).await?;
        let mut fsm = DeploymentFsm::from_state(deployment.state);
        let state = fsm.process(DeploymentEvent::Start)?;

        let transcript = Transcript::new(deployment_id.clone(), self.hub.clone(), self.store.clone());
        let mut deployment = match self
            .store
            .update_stage(deployment_id, &StageUpdate::state(state))
            .await
        {
            Ok(deployment) => deployment,
            Err(e) => {
                transcript.close();
                return Err(e);
            }
        };
        info!(deployment_id = %deployment_id, "deployment started");

        while let Some(stage) = fsm.state().stage() {
            if cancel.is_cancelled() {
                return self.abort(&mut fsm, DeploymentEvent::Cancel, &transcript).await;
            }

            let report = match self.executor.run(stage, &deployment, &transcript, cancel).await {
                Ok(report) => report,
                Err(e) => {
                    error!(deployment_id = %deployment_id, stage = %stage, "stage aborted: {}", e);
                    let event = DeploymentEvent::StageFailed {
                        kind: FailureKind::Interrupted,
                        exit_code: None,
                        reason: e.to_string(),
                    };
                    return self.abort(&mut fsm, event, &transcript).await;
                }
            };

            let event = match report.verdict {
                StageVerdict::Succeeded => DeploymentFsm::success_event(stage),
                StageVerdict::Failed {
                    kind,
                    exit_code,
                    reason,
                } => DeploymentEvent::StageFailed {
                    kind,
                    exit_code,
                    reason,
                },
                StageVerdict::Cancelled => DeploymentEvent::Cancel,
            };

            let state = match fsm.process(event) {
                Ok(state) => state,
                Err(e) => {
                    transcript.close();
                    return Err(e);
                }
            };
            if state.is_terminal() {
                return self
                    .finish(&fsm, Some(report.result), report.outputs, &transcript)
                    .await;
            }

            let update = StageUpdate::state(state)
                .with_stage_result(report.result)
                .with_outputs(report.outputs);
            deployment = match self.persist(&transcript, &update).await {
                Ok(deployment) => deployment,
                Err(e) => {
                    transcript.close();
                    return Err(e);
                }
            };
        }

        Ok(deployment)
    }

    /// Cancel a non-terminal deployment that has no running stage
    pub async fn cancel_idle(&self, deployment_id: &DeploymentId) -> Result<Deployment, EngineError> {
        let deployment = self.store.get(deployment_id).await?;
        let mut fsm = DeploymentFsm::from_state(deployment.state);
        let transcript = Transcript::new(deployment_id.clone(), self.hub.clone(), self.store.clone());
        self.abort(&mut fsm, DeploymentEvent::Cancel, &transcript).await
    }

    /// Mark a deployment found mid-pipeline after a restart as failed
    pub async fn interrupt(&self, deployment: &Deployment) -> Result<Deployment, EngineError> {
        let mut fsm = DeploymentFsm::from_state(deployment.state);
        let state = fsm.process(DeploymentEvent::Interrupt)?;
        let outcome = fsm
            .outcome()
            .cloned()
            .ok_or_else(|| EngineError::Internal("interrupt produced no outcome".to_string()))?;

        let sequence = self.store.transcript(&deployment.id).await?.len() as u64;
        let record = LogRecord::deployment_finished(state, Some("interrupted"));
        let marker = LogEvent {
            deployment_id: deployment.id.clone(),
            sequence,
            timestamp: Utc::now(),
            source: record.source,
            text: record.text,
            marker: record.marker,
        };
        self.store
            .append_log_segment(&deployment.id, &[marker])
            .await?;

        warn!(deployment_id = %deployment.id, state = %deployment.state, "deployment interrupted by restart");
        self.store
            .update_stage(&deployment.id, &StageUpdate::state(state).with_outcome(outcome))
            .await
    }

    /// End the pipeline outside of a stage result
    async fn abort(
        &self,
        fsm: &mut DeploymentFsm,
        event: DeploymentEvent,
        transcript: &Transcript,
    ) -> Result<Deployment, EngineError> {
        if let Err(e) = fsm.process(event) {
            transcript.close();
            return Err(e);
        }
        self.finish(fsm, None, BTreeMap::new(), transcript).await
    }

    /// Publish the terminal marker, persist the outcome and close the transcript
    async fn finish(
        &self,
        fsm: &DeploymentFsm,
        result: Option<StageResult>,
        outputs: BTreeMap<String, String>,
        transcript: &Transcript,
    ) -> Result<Deployment, EngineError> {
        let finished = self.record_outcome(fsm, result, outputs, transcript).await;
        transcript.close();

        let deployment = finished?;
        info!(deployment_id = %deployment.id, state = %deployment.state, "deployment finished");
        Ok(deployment)
    }

    async fn record_outcome(
        &self,
        fsm: &DeploymentFsm,
        result: Option<StageResult>,
        outputs: BTreeMap<String, String>,
        transcript: &Transcript,
    ) -> Result<Deployment, EngineError> {
        let state = fsm.state();
        let outcome = fsm.outcome().cloned().ok_or_else(|| {
            EngineError::Internal(format!("deployment reached {} without an outcome", state))
        })?;

        let detail = match &outcome {
            Outcome::Failed { reason, .. } => Some(reason.as_str()),
            _ => None,
        };
        transcript.publish(LogRecord::deployment_finished(state, detail))?;

        let mut update = StageUpdate::state(state).with_outcome(outcome);
        if let Some(result) = result {
            update = update.with_stage_result(result);
        }
        if !outputs.is_empty() {
            update = update.with_outputs(outputs);
        }
        self.persist(transcript, &update).await
    }

    async fn persist(
        &self,
        transcript: &Transcript,
        update: &StageUpdate,
    ) -> Result<Deployment, EngineError> {
        transcript.flush().await?;
        self.store
            .update_stage(transcript.deployment_id(), update)
            .await
    }
}
