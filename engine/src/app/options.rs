//! Application configuration options

use std::time::Duration;

use crate::engine::EngineOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable local HTTP server
    pub enable_socket_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployment engine configuration
    pub engine: EngineOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_socket_server: true,
            server: ServerOptions::default(),
            engine: EngineOptions::default(),
        }
    }
}

impl AppOptions {
    /// Build options from a settings file rooted at `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let execution = &settings.execution;
        let workspace_dir = settings
            .workspace_dir
            .clone()
            .unwrap_or_else(|| layout.workspace_dir().path().to_path_buf());

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(execution.shutdown_secs),
            },
            storage: StorageOptions { layout },
            enable_socket_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            engine: EngineOptions {
                concurrency: execution.concurrency,
                max_stage_duration: Duration::from_secs(execution.max_stage_secs),
                cancel_grace: Duration::from_secs(execution.cancel_grace_secs),
                cancel_timeout: None,
                log_flush_interval: Duration::from_millis(execution.log_flush_ms.max(10)),
                subscriber_buffer: execution.subscriber_buffer,
                workspace_dir,
                templates_dir: settings.templates_dir.clone(),
                tools: settings.tools.clone(),
            },
        }
    }
}

/// Lifecycle options for the engine process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}
