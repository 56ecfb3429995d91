//! Application state management

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::deploy::credentials::EnvCredentialProvider;
use crate::engine::{DeploymentEngine, EngineOptions};
use crate::errors::EngineError;
use crate::models::deployment::Provider;
use crate::storage::layout::StorageLayout;
use crate::store::FileStatusStore;

/// Main application state
pub struct AppState {
    /// Deployment engine
    pub engine: Arc<DeploymentEngine>,
}

impl AppState {
    /// Open the status store, build the engine and recover stranded
    /// deployments. Workers are not started yet.
    pub async fn init(
        layout: &StorageLayout,
        engine_options: EngineOptions,
        credential_vars: HashMap<Provider, Vec<String>>,
    ) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        layout.setup().await?;
        let store = Arc::new(FileStatusStore::open(layout.deployments_dir()).await?);
        let credentials = Arc::new(EnvCredentialProvider::new(credential_vars));
        let engine = Arc::new(DeploymentEngine::new(engine_options, store, credentials));

        engine.recover().await?;

        Ok(Self { engine })
    }

    /// Shutdown application state
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        info!("Shutting down application state...");
        self.engine.shutdown(timeout).await
    }
}
