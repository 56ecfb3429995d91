//! Main application run loop

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::EngineError;
use crate::models::deployment::Provider;
use crate::server::serve::serve;
use crate::server::state::ServerState;

/// Run the deployment engine until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    credential_vars: HashMap<Provider, Vec<String>>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing deployment engine...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, credential_vars, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start engine: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Time open connections get to finish once the engine is down
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    credential_vars: HashMap<Provider, Vec<String>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, EngineError> {
    let app_state = Arc::new(
        AppState::init(
            &options.storage.layout,
            options.engine.clone(),
            credential_vars,
        )
        .await?,
    );
    shutdown_manager.with_app_state(app_state.clone())?;

    app_state.engine.start().await;

    if options.enable_socket_server {
        init_socket_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(app_state.engine.clone());
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), EngineError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), EngineError> {
        if self.app_state.is_some() {
            return Err(EngineError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        if self.socket_server_handle.is_some() {
            return Err(EngineError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        let delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}", delay);
                Err(EngineError::ShutdownError(format!(
                    "shutdown timed out after {:?}",
                    delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down deployment engine...");

        // 1. Engine: cancel in-flight deployments and stop workers. This also
        // ends the log streams the server is still serving.
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown(self.lifecycle_options.max_shutdown_delay).await?;
        }

        // 2. Socket server, already refusing new connections
        if let Some(mut handle) = self.socket_server_handle.take() {
            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut handle).await {
                Ok(joined) => joined.map_err(|e| EngineError::ShutdownError(e.to_string()))??,
                Err(_) => {
                    warn!("Dropping connections still open after {:?}", SERVER_DRAIN_TIMEOUT);
                    handle.abort();
                }
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}
