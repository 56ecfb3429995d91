//! Deployment models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, unique deployment identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeploymentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeploymentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target cloud provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }

    /// Resolve a requested instance size to a concrete instance type.
    ///
    /// Sizes that already name an instance family pass through unchanged;
    /// the legacy vCPU sizes are mapped per provider.
    pub fn instance_type(&self, size: &str) -> String {
        match self {
            Provider::Aws => {
                if size.starts_with('t') || size.starts_with('m') || size.starts_with('c') {
                    return size.to_string();
                }
                match size {
                    "0.5" => "t2.micro",
                    "1" => "t2.small",
                    "2" => "t2.medium",
                    _ => "t2.micro",
                }
                .to_string()
            }
            Provider::Gcp => {
                if size.starts_with("e2-") || size.starts_with("n1-") {
                    return size.to_string();
                }
                match size {
                    "0.5" => "e2-micro",
                    "1" => "e2-small",
                    "2" => "e2-medium",
                    _ => "e2-micro",
                }
                .to_string()
            }
            Provider::Azure => {
                if size.starts_with("Standard_") {
                    return size.to_string();
                }
                match size {
                    "0.5" => "Standard_B1ls",
                    "1" => "Standard_B1s",
                    "2" => "Standard_B2s",
                    _ => "Standard_B1s",
                }
                .to_string()
            }
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "gcp" => Ok(Provider::Gcp),
            "azure" => Ok(Provider::Azure),
            _ => Err(format!("unsupported provider: {}", s)),
        }
    }
}

/// Raw deployment request, as handed over by the project service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Project reference
    pub project: String,

    /// Cloud provider name: 'aws', 'gcp', 'azure'
    pub provider: String,

    /// Target region
    pub region: String,

    /// Instance size or instance type
    pub instance_size: String,

    /// Source branch to configure
    #[serde(default)]
    pub branch: Option<String>,

    /// Application environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Validated deployment parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParams {
    pub project: String,
    pub provider: Provider,
    pub region: String,
    pub instance_size: String,
    pub branch: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl DeploymentParams {
    /// Key identifying the infrastructure target of a deployment
    pub fn target_key(&self) -> (&str, Provider, &str) {
        (&self.project, self.provider, &self.region)
    }

    pub fn instance_type(&self) -> String {
        self.provider.instance_type(&self.instance_size)
    }
}

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Pending,
    Provisioning,
    Configuring,
    Succeeded,
    Failed,
    Cancelled,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::Cancelled
        )
    }

    /// The stage running while in this state
    pub fn stage(&self) -> Option<StageName> {
        match self {
            DeploymentState::Provisioning => Some(StageName::Provision),
            DeploymentState::Configuring => Some(StageName::Configure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Provisioning => "provisioning",
            DeploymentState::Configuring => "configuring",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeploymentState::Pending),
            "provisioning" => Ok(DeploymentState::Provisioning),
            "configuring" => Ok(DeploymentState::Configuring),
            "succeeded" => Ok(DeploymentState::Succeeded),
            "failed" => Ok(DeploymentState::Failed),
            "cancelled" => Ok(DeploymentState::Cancelled),
            _ => Err(format!("unknown deployment state: {}", s)),
        }
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Provision,
    Configure,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Provision => "provision",
            StageName::Configure => "configure",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result status of one stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
    Timeout,
    Cancelled,
    SpawnError,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ok => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Timeout => "timeout",
            StageStatus::Cancelled => "cancelled",
            StageStatus::SpawnError => "spawn_error",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range of sequence numbers a stage attempt wrote to the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Outcome of one stage execution, kept for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub log_segment: LogSegment,
}

/// Why a deployment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StageFailure,
    StageTimeout,
    ProcessSpawnError,
    Interrupted,
}

/// Terminal outcome of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<StageName>,
        kind: FailureKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        reason: String,
    },
    Cancelled {
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<StageName>,
    },
}

impl Outcome {
    /// The terminal state this outcome corresponds to
    pub fn state(&self) -> DeploymentState {
        match self {
            Outcome::Succeeded => DeploymentState::Succeeded,
            Outcome::Failed { .. } => DeploymentState::Failed,
            Outcome::Cancelled { .. } => DeploymentState::Cancelled,
        }
    }
}

/// Durable deployment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub params: DeploymentParams,
    pub state: DeploymentState,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Create a new pending deployment
    pub fn new(params: DeploymentParams) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            params,
            state: DeploymentState::Pending,
            outcome: None,
            stage_results: Vec::new(),
            outputs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a persisted stage update
    pub fn apply(&mut self, update: &StageUpdate) {
        let now = update.at;
        if self.state == DeploymentState::Pending && update.state == DeploymentState::Provisioning {
            self.started_at = Some(now);
        }
        self.state = update.state;
        if let Some(result) = &update.stage_result {
            self.stage_results.push(result.clone());
        }
        if let Some(outputs) = &update.outputs {
            self.outputs.extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(outcome) = &update.outcome {
            self.outcome = Some(outcome.clone());
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            id: self.id.clone(),
            state: self.state,
            stage: self
                .state
                .stage()
                .or_else(|| self.stage_results.last().map(|r| r.stage)),
            outcome: self.outcome.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// A single state change written to the status store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUpdate {
    pub state: DeploymentState,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub stage_result: Option<StageResult>,
    #[serde(default)]
    pub outputs: Option<BTreeMap<String, String>>,
    pub at: DateTime<Utc>,
}

impl StageUpdate {
    pub fn state(state: DeploymentState) -> Self {
        Self {
            state,
            outcome: None,
            stage_result: None,
            outputs: None,
            at: Utc::now(),
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_stage_result(mut self, result: StageResult) -> Self {
        self.stage_result = Some(result);
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

/// Status view returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub id: DeploymentId,
    pub state: DeploymentState,
    /// Current stage, or the last stage that ran once terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for listing deployments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub state: Option<DeploymentState>,
    #[serde(default)]
    pub non_terminal_only: bool,
}

impl ListFilter {
    pub fn non_terminal() -> Self {
        Self {
            non_terminal_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, deployment: &Deployment) -> bool {
        if let Some(project) = &self.project {
            if &deployment.params.project != project {
                return false;
            }
        }
        if let Some(provider) = self.provider {
            if deployment.params.provider != provider {
                return false;
            }
        }
        if let Some(state) = self.state {
            if deployment.state != state {
                return false;
            }
        }
        !(self.non_terminal_only && deployment.state.is_terminal())
    }
}
