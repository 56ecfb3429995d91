//! Settings file management

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::deploy::credentials::default_credential_vars;
use crate::deploy::tools::ToolSet;
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::deployment::Provider;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deployment execution configuration
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Working directory root; defaults to `<base>/workspace`
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Infrastructure templates, one subdirectory per provider
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    /// Tool definitions per stage
    #[serde(default)]
    pub tools: ToolSet,

    /// Environment variables forwarded as credentials, per provider
    #[serde(default = "default_credential_vars")]
    pub credentials: HashMap<Provider, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            server: ServerSettings::default(),
            execution: ExecutionSettings::default(),
            workspace_dir: None,
            templates_dir: None,
            tools: ToolSet::default(),
            credentials: default_credential_vars(),
        }
    }
}

impl Settings {
    /// Read settings from `file`, falling back to defaults when it is absent
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            EngineError::ConfigError(format!(
                "invalid settings file {}: {}",
                file.path().display(),
                e
            ))
        })
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Enable the HTTP server
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Deployment execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Deployments executing at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum duration of one stage in seconds
    #[serde(default = "default_max_stage_secs")]
    pub max_stage_secs: u64,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Milliseconds between transcript flushes while a stage runs
    #[serde(default = "default_log_flush_ms")]
    pub log_flush_ms: u64,

    /// Events queued per log subscriber before it is disconnected
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Maximum seconds to wait for in-flight work on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_stage_secs() -> u64 {
    30 * 60
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_log_flush_ms() -> u64 {
    1000
}

fn default_subscriber_buffer() -> usize {
    crate::hub::DEFAULT_SUBSCRIBER_BUFFER
}

fn default_shutdown_secs() -> u64 {
    30
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_stage_secs: default_max_stage_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            log_flush_ms: default_log_flush_ms(),
            subscriber_buffer: default_subscriber_buffer(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}
