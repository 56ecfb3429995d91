//! Stage executor
//!
//! Runs one pipeline stage: resolves the tool for the stage, drives it through
//! the process driver while publishing every output line to the log hub, and
//! classifies the result. Each attempt is bracketed by a `stage_started` and a
//! `stage_finished` marker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::credentials::CredentialProvider;
use crate::deploy::process::{ProcessDriver, ProcessInvocation, ProcessOutcome, Termination};
use crate::deploy::tools::{parse_outputs, TemplateContext, ToolSet};
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::hub::LogHub;
use crate::models::deployment::{
    Deployment, DeploymentId, FailureKind, LogSegment, StageName, StageResult, StageStatus,
};
use crate::models::log_event::{LogEvent, LogRecord};
use crate::store::StatusStore;

/// File the provisioning tool may leave behind with its outputs
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Writes a deployment's log events to the hub and, on flush, to the store
pub struct Transcript {
    deployment_id: DeploymentId,
    hub: LogHub,
    store: Arc<dyn StatusStore>,
    persisted: AtomicU64,
}

impl Transcript {
    pub fn new(deployment_id: DeploymentId, hub: LogHub, store: Arc<dyn StatusStore>) -> Self {
        hub.open(&deployment_id);
        let persisted = hub.next_sequence(&deployment_id).unwrap_or(0);
        Self {
            deployment_id,
            hub,
            store,
            persisted: AtomicU64::new(persisted),
        }
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    pub fn publish(&self, record: LogRecord) -> Result<LogEvent, EngineError> {
        self.hub.publish(&self.deployment_id, record)
    }

    /// Persist every event published since the last flush
    pub async fn flush(&self) -> Result<(), EngineError> {
        let from = self.persisted.load(Ordering::SeqCst);
        let events = self.hub.events_since(&self.deployment_id, from);
        let Some(last) = events.last() else {
            return Ok(());
        };
        let next = last.sequence + 1;
        self.store
            .append_log_segment(&self.deployment_id, &events)
            .await?;
        self.persisted.store(next, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the transcript complete; live subscribers end after draining
    pub fn close(&self) {
        self.hub.close(&self.deployment_id);
    }
}

/// How a stage attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Succeeded,
    Failed {
        kind: FailureKind,
        exit_code: Option<i32>,
        reason: String,
    },
    Cancelled,
}

/// Everything the pipeline needs to know about a finished stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub result: StageResult,
    pub verdict: StageVerdict,
    /// Provisioning outputs, empty for other stages
    pub outputs: BTreeMap<String, String>,
}

/// Stage executor options
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub max_stage_duration: Duration,
    pub log_flush_interval: Duration,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            max_stage_duration: Duration::from_secs(30 * 60),
            log_flush_interval: Duration::from_secs(1),
        }
    }
}

/// Runs provisioning and configuration stages
pub struct StageExecutor {
    options: StageOptions,
    driver: ProcessDriver,
    tools: ToolSet,
    credentials: Arc<dyn CredentialProvider>,
    workspace: Dir,
    templates: Option<Dir>,
}

impl StageExecutor {
    pub fn new(
        options: StageOptions,
        driver: ProcessDriver,
        tools: ToolSet,
        credentials: Arc<dyn CredentialProvider>,
        workspace: Dir,
        templates: Option<Dir>,
    ) -> Self {
        Self {
            options,
            driver,
            tools,
            credentials,
            workspace,
            templates,
        }
    }

    /// Working directory of a deployment
    pub fn workdir(&self, deployment_id: &DeploymentId) -> Dir {
        self.workspace.subdir(deployment_id.as_str())
    }

    /// Run `stage` for `deployment` to completion, cancellation or timeout
    pub async fn run(
        &self,
        stage: StageName,
        deployment: &Deployment,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> Result<StageReport, EngineError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let first = transcript.publish(LogRecord::stage_started(stage))?;
        info!(deployment_id = %deployment.id, stage = %stage, "stage started");

        let outcome = match self.prepare(stage, deployment).await {
            Ok(invocation) => self.drive(&invocation, transcript, cancel).await,
            Err(e) => Err(e),
        };

        let (status, verdict) = match outcome {
            Ok(outcome) => self.classify(stage, &outcome),
            Err(e) => {
                warn!(deployment_id = %deployment.id, stage = %stage, "stage could not start: {}", e);
                (
                    StageStatus::SpawnError,
                    StageVerdict::Failed {
                        kind: FailureKind::ProcessSpawnError,
                        exit_code: None,
                        reason: e.to_string(),
                    },
                )
            }
        };

        let outputs = if stage == StageName::Provision && verdict == StageVerdict::Succeeded {
            self.read_outputs(&deployment.id).await
        } else {
            BTreeMap::new()
        };

        let exit_code = match &verdict {
            StageVerdict::Failed { exit_code, .. } => *exit_code,
            StageVerdict::Succeeded => Some(0),
            StageVerdict::Cancelled => None,
        };
        let detail = match &verdict {
            StageVerdict::Failed { reason, .. } => Some(reason.as_str()),
            _ => None,
        };
        let last = transcript.publish(LogRecord::stage_finished(stage, status, detail))?;
        info!(deployment_id = %deployment.id, stage = %stage, status = %status, "stage finished");

        Ok(StageReport {
            result: StageResult {
                stage,
                status,
                exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                started_at,
                log_segment: LogSegment {
                    first_sequence: first.sequence,
                    last_sequence: last.sequence,
                },
            },
            verdict,
            outputs,
        })
    }

    /// Resolve the stage's invocation, preparing the working directory first
    async fn prepare(
        &self,
        stage: StageName,
        deployment: &Deployment,
    ) -> Result<ProcessInvocation, EngineError> {
        let workdir = self.workdir(&deployment.id);
        if stage == StageName::Provision {
            self.prepare_workdir(deployment, &workdir).await?;
        }

        let context = TemplateContext::new(deployment, workdir.path())?;
        let mut invocation = self.tools.for_stage(stage).resolve(&context)?;
        invocation.secret_env = self
            .credentials
            .credentials(deployment.params.provider)
            .await?;
        Ok(invocation)
    }

    async fn prepare_workdir(&self, deployment: &Deployment, workdir: &Dir) -> Result<(), EngineError> {
        workdir.create().await?;
        if let Some(templates) = &self.templates {
            let source = templates.subdir(deployment.params.provider.as_str());
            if source.exists().await {
                let copied = workdir.copy_files_from(&source, "tf").await?;
                debug!(deployment_id = %deployment.id, copied, "copied infrastructure templates");
            }
        }
        Ok(())
    }

    /// Run the process, flushing the transcript periodically
    async fn drive(
        &self,
        invocation: &ProcessInvocation,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        let run = self.driver.run(
            invocation,
            Some(self.options.max_stage_duration),
            cancel,
            |line| {
                if let Err(e) = transcript.publish(LogRecord::output(line.source, line.text)) {
                    warn!(deployment_id = %transcript.deployment_id(), "dropping output line: {}", e);
                }
            },
        );
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.options.log_flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = ticker.tick() => {
                    if let Err(e) = transcript.flush().await {
                        warn!(deployment_id = %transcript.deployment_id(), "transcript flush failed: {}", e);
                    }
                }
            }
        }
    }

    fn classify(&self, stage: StageName, outcome: &ProcessOutcome) -> (StageStatus, StageVerdict) {
        match outcome.termination {
            Termination::Exited if outcome.exit_code == 0 => {
                (StageStatus::Ok, StageVerdict::Succeeded)
            }
            Termination::Exited => (
                StageStatus::Failed,
                StageVerdict::Failed {
                    kind: FailureKind::StageFailure,
                    exit_code: Some(outcome.exit_code),
                    reason: EngineError::StageFailure {
                        stage,
                        exit_code: outcome.exit_code,
                    }
                    .to_string(),
                },
            ),
            Termination::TimedOut => (
                StageStatus::Timeout,
                StageVerdict::Failed {
                    kind: FailureKind::StageTimeout,
                    exit_code: Some(outcome.exit_code),
                    reason: EngineError::StageTimeout {
                        stage,
                        limit: self.options.max_stage_duration,
                    }
                    .to_string(),
                },
            ),
            Termination::Cancelled => (StageStatus::Cancelled, StageVerdict::Cancelled),
        }
    }

    async fn read_outputs(&self, deployment_id: &DeploymentId) -> BTreeMap<String, String> {
        let file = self.workdir(deployment_id).file(OUTPUTS_FILE);
        if !file.exists().await {
            return BTreeMap::new();
        }
        match file.read_string().await.and_then(|contents| parse_outputs(&contents)) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(deployment_id = %deployment_id, "ignoring unreadable provisioning outputs: {}", e);
                BTreeMap::new()
            }
        }
    }

    /// Release provisioned resources. Output goes to the engine log only.
    pub async fn teardown(
        &self,
        deployment: &Deployment,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessOutcome>, EngineError> {
        let workdir = self.workdir(&deployment.id);
        if !workdir.exists().await {
            debug!(deployment_id = %deployment.id, "no working directory, nothing to tear down");
            return Ok(None);
        }

        let context = TemplateContext::new(deployment, workdir.path())?;
        let mut invocation = self.tools.teardown.resolve(&context)?;
        invocation.secret_env = self
            .credentials
            .credentials(deployment.params.provider)
            .await?;

        info!(deployment_id = %deployment.id, command = %invocation.display(), "tearing down resources");
        let deployment_id = deployment.id.clone();
        let outcome = self
            .driver
            .run(&invocation, Some(self.options.max_stage_duration), cancel, |line| {
                info!(deployment_id = %deployment_id, source = ?line.source, "{}", line.text);
            })
            .await?;
        Ok(Some(outcome))
    }

    /// Remove a deployment's working directory
    pub async fn remove_workdir(&self, deployment_id: &DeploymentId) -> Result<(), EngineError> {
        self.workdir(deployment_id).delete().await
    }
}
