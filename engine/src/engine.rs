//! Deployment engine: the operations exposed to the API layer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::deploy::credentials::CredentialProvider;
use crate::deploy::pipeline::Pipeline;
use crate::deploy::process::ProcessDriver;
use crate::deploy::stage::{StageExecutor, StageOptions};
use crate::deploy::tools::ToolSet;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::hub::{LogHub, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
use crate::models::deployment::{
    Deployment, DeploymentId, DeploymentParams, DeploymentRequest, DeploymentState,
    DeploymentStatus, ListFilter, Provider,
};
use crate::models::log_event::LogEvent;
use crate::store::StatusStore;
use crate::workers::runner::{self, TaskRunner};

const DEFAULT_BRANCH: &str = "main";

/// Engine options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub concurrency: usize,
    pub max_stage_duration: Duration,
    pub cancel_grace: Duration,
    /// How long `cancel_deployment` waits for a running deployment; derived
    /// from `cancel_grace` when unset
    pub cancel_timeout: Option<Duration>,
    pub log_flush_interval: Duration,
    pub subscriber_buffer: usize,
    pub workspace_dir: PathBuf,
    pub templates_dir: Option<PathBuf>,
    pub tools: ToolSet,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_stage_duration: Duration::from_secs(30 * 60),
            cancel_grace: Duration::from_secs(10),
            cancel_timeout: None,
            log_flush_interval: Duration::from_secs(1),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            workspace_dir: std::env::temp_dir().join("deployd").join("workspace"),
            templates_dir: None,
            tools: ToolSet::default(),
        }
    }
}

pub struct DeploymentEngine {
    store: Arc<dyn StatusStore>,
    hub: LogHub,
    pipeline: Arc<Pipeline>,
    runner: Arc<TaskRunner>,
    /// Serializes the in-flight check and record creation of submissions
    submit_lock: Mutex<()>,
}

impl DeploymentEngine {
    pub fn new(
        options: EngineOptions,
        store: Arc<dyn StatusStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let hub = LogHub::new(options.subscriber_buffer);
        let executor = StageExecutor::new(
            StageOptions {
                max_stage_duration: options.max_stage_duration,
                log_flush_interval: options.log_flush_interval,
            },
            ProcessDriver::new(options.cancel_grace),
            options.tools,
            credentials,
            Dir::new(options.workspace_dir),
            options.templates_dir.map(Dir::new),
        );
        let pipeline = Arc::new(Pipeline::new(Arc::new(executor), store.clone(), hub.clone()));
        let runner = TaskRunner::new(
            runner::Options {
                concurrency: options.concurrency,
                // terminate, escalate to kill, drain output, then persist
                cancel_timeout: options
                    .cancel_timeout
                    .unwrap_or(options.cancel_grace * 2 + Duration::from_secs(5)),
            },
            pipeline.clone(),
        );

        Self {
            store,
            hub,
            pipeline,
            runner,
            submit_lock: Mutex::new(()),
        }
    }

    /// Start the worker pool
    pub async fn start(&self) {
        self.runner.start().await;
    }

    /// Validate a request, record it and queue it for execution
    pub async fn submit_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentId, EngineError> {
        let params = validate_request(request)?;

        let deployment = {
            let _guard = self.submit_lock.lock().await;
            let filter = ListFilter {
                project: Some(params.project.clone()),
                provider: Some(params.provider),
                ..ListFilter::non_terminal()
            };
            let in_flight = self.store.list(&filter).await?;
            if let Some(existing) = in_flight
                .iter()
                .find(|d| d.params.target_key() == params.target_key())
            {
                return Err(EngineError::Conflict(format!(
                    "deployment {} for {}/{}/{} is still {}",
                    existing.id, params.project, params.provider, params.region, existing.state
                )));
            }

            let deployment = Deployment::new(params);
            self.store.create(&deployment).await?;
            deployment
        };

        self.hub.open(&deployment.id);
        if let Err(e) = self.runner.submit(&deployment.id).await {
            warn!(deployment_id = %deployment.id, "could not queue deployment: {}", e);
            self.pipeline.cancel_idle(&deployment.id).await?;
            return Err(e);
        }

        info!(
            deployment_id = %deployment.id,
            project = %deployment.params.project,
            provider = %deployment.params.provider,
            region = %deployment.params.region,
            "deployment submitted"
        );
        Ok(deployment.id)
    }

    /// Queue an existing pending deployment
    pub async fn start_deployment(&self, deployment_id: &DeploymentId) -> Result<(), EngineError> {
        if self.runner.contains(deployment_id).await {
            return Err(EngineError::AlreadyRunning(deployment_id.clone()));
        }
        let deployment = self.store.get(deployment_id).await?;
        if deployment.state != DeploymentState::Pending {
            return Err(EngineError::InvalidTransition {
                state: deployment.state,
                action: "start",
            });
        }
        self.hub.open(deployment_id);
        self.runner.submit(deployment_id).await
    }

    pub async fn get_status(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<DeploymentStatus, EngineError> {
        Ok(self.store.get(deployment_id).await?.status())
    }

    /// Full record, including stage results and provisioning outputs
    pub async fn get_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Deployment, EngineError> {
        self.store.get(deployment_id).await
    }

    pub async fn list_deployments(&self, filter: &ListFilter) -> Result<Vec<Deployment>, EngineError> {
        self.store.list(filter).await
    }

    /// Persisted transcript
    pub async fn transcript(&self, deployment_id: &DeploymentId) -> Result<Vec<LogEvent>, EngineError> {
        self.store.transcript(deployment_id).await
    }

    /// Live log feed starting at `from_sequence`. Ends once the deployment
    /// is terminal and every event has been delivered.
    pub async fn stream_logs(
        &self,
        deployment_id: &DeploymentId,
        from_sequence: u64,
    ) -> Result<Subscription, EngineError> {
        self.store.get(deployment_id).await?;
        match self.hub.subscribe(deployment_id, from_sequence) {
            Ok(subscription) => Ok(subscription),
            Err(EngineError::NotFound(_)) => {
                // Evicted: the store holds the complete transcript
                let events = self.store.transcript(deployment_id).await?;
                Ok(Subscription::from_transcript(events, from_sequence))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Deployment, EngineError> {
        let deployment = self.store.get(deployment_id).await?;
        if deployment.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                state: deployment.state,
                action: "cancel",
            });
        }

        match self.runner.cancel(deployment_id).await? {
            Some(deployment) => Ok(deployment),
            None => self.pipeline.cancel_idle(deployment_id).await,
        }
    }

    /// Submit a fresh deployment with the parameters of a failed or
    /// cancelled one
    pub async fn retry_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<DeploymentId, EngineError> {
        let deployment = self.store.get(deployment_id).await?;
        if !matches!(
            deployment.state,
            DeploymentState::Failed | DeploymentState::Cancelled
        ) {
            return Err(EngineError::InvalidTransition {
                state: deployment.state,
                action: "retry",
            });
        }

        let params = deployment.params;
        let retry = self
            .submit_deployment(DeploymentRequest {
                project: params.project,
                provider: params.provider.to_string(),
                region: params.region,
                instance_size: params.instance_size,
                branch: Some(params.branch),
                env_vars: params.env_vars,
            })
            .await?;
        info!(deployment_id = %deployment_id, retry_id = %retry, "deployment retried");
        Ok(retry)
    }

    /// Tear down provisioned resources and remove every trace of a
    /// terminal deployment
    pub async fn delete_deployment(&self, deployment_id: &DeploymentId) -> Result<(), EngineError> {
        let deployment = self.store.get(deployment_id).await?;
        if !deployment.state.is_terminal() || self.runner.contains(deployment_id).await {
            return Err(EngineError::Conflict(format!(
                "deployment {} is {} and cannot be deleted",
                deployment_id, deployment.state
            )));
        }

        let executor = self.pipeline.executor();
        match executor.teardown(&deployment, &CancellationToken::new()).await {
            Ok(Some(outcome)) if !outcome.success() => {
                warn!(deployment_id = %deployment_id, exit_code = outcome.exit_code, "teardown failed, removing deployment anyway")
            }
            Ok(_) => {}
            Err(e) => warn!(deployment_id = %deployment_id, "teardown could not run: {}", e),
        }

        executor.remove_workdir(deployment_id).await?;
        self.store.delete(deployment_id).await?;
        self.hub.evict(deployment_id);
        info!(deployment_id = %deployment_id, "deployment deleted");
        Ok(())
    }

    /// Fail every deployment a previous process left mid-pipeline.
    ///
    /// Returns the number of deployments marked interrupted.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let stranded = self.store.list(&ListFilter::non_terminal()).await?;
        let mut recovered = 0;
        for deployment in stranded {
            if self.runner.contains(&deployment.id).await {
                continue;
            }
            match self.pipeline.interrupt(&deployment).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(deployment_id = %deployment.id, "recovery failed: {}", e),
            }
        }
        if recovered > 0 {
            info!(recovered, "marked interrupted deployments as failed");
        }
        Ok(recovered)
    }

    /// Cancel in-flight deployments and stop the workers
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        self.runner.shutdown(timeout).await
    }
}

/// Check a raw request and turn it into deployment parameters
pub fn validate_request(request: DeploymentRequest) -> Result<DeploymentParams, EngineError> {
    let provider: Provider = request
        .provider
        .trim()
        .parse()
        .map_err(EngineError::ValidationError)?;

    let project = validate_field("project", &request.project)?;
    let region = validate_field("region", &request.region)?;
    let instance_size = validate_field("instance_size", &request.instance_size)?;
    let branch = match request.branch.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_BRANCH.to_string(),
        Some(branch) => validate_field("branch", branch)?,
    };

    for key in request.env_vars.keys() {
        if !is_identifier(key) {
            return Err(EngineError::ValidationError(format!(
                "invalid environment variable name: '{}'",
                key
            )));
        }
    }

    Ok(DeploymentParams {
        project,
        provider,
        region,
        instance_size,
        branch,
        env_vars: request.env_vars,
    })
}

fn validate_field(name: &str, value: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::ValidationError(format!("{} is required", name)));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if !valid {
        return Err(EngineError::ValidationError(format!(
            "{} contains invalid characters: '{}'",
            name, value
        )));
    }
    Ok(value.to_string())
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
