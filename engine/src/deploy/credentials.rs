//! Provider credentials injected into tool processes

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use crate::errors::EngineError;
use crate::models::deployment::Provider;

/// Supplies opaque provider credentials for a deployment's subprocesses
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Environment variables carrying the credentials for `provider`
    async fn credentials(&self, provider: Provider)
        -> Result<Vec<(String, SecretString)>, EngineError>;
}

/// Reads credentials from the engine's own environment
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    variables: HashMap<Provider, Vec<String>>,
}

impl EnvCredentialProvider {
    pub fn new(variables: HashMap<Provider, Vec<String>>) -> Self {
        Self { variables }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new(default_credential_vars())
    }
}

/// Variable names forwarded per provider
pub fn default_credential_vars() -> HashMap<Provider, Vec<String>> {
    let mut variables = HashMap::new();
    variables.insert(
        Provider::Aws,
        vec![
            "AWS_ACCESS_KEY_ID".to_string(),
            "AWS_SECRET_ACCESS_KEY".to_string(),
            "AWS_SESSION_TOKEN".to_string(),
            "AWS_DEFAULT_REGION".to_string(),
        ],
    );
    variables.insert(
        Provider::Gcp,
        vec![
            "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
            "GOOGLE_PROJECT".to_string(),
        ],
    );
    variables.insert(
        Provider::Azure,
        vec![
            "ARM_CLIENT_ID".to_string(),
            "ARM_CLIENT_SECRET".to_string(),
            "ARM_SUBSCRIPTION_ID".to_string(),
            "ARM_TENANT_ID".to_string(),
        ],
    );
    variables
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn credentials(
        &self,
        provider: Provider,
    ) -> Result<Vec<(String, SecretString)>, EngineError> {
        let names = match self.variables.get(&provider) {
            Some(names) => names,
            None => return Ok(Vec::new()),
        };

        let mut credentials = Vec::with_capacity(names.len());
        for name in names {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    credentials.push((name.clone(), SecretString::from(value)));
                }
                _ => debug!(%provider, variable = %name, "credential variable not set"),
            }
        }
        Ok(credentials)
    }
}

/// Fixed credentials, for tests and embedded use
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    credentials: HashMap<Provider, Vec<(String, SecretString)>>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Provider, name: &str, value: &str) -> Self {
        self.credentials
            .entry(provider)
            .or_default()
            .push((name.to_string(), SecretString::from(value.to_string())));
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(
        &self,
        provider: Provider,
    ) -> Result<Vec<(String, SecretString)>, EngineError> {
        Ok(self.credentials.get(&provider).cloned().unwrap_or_default())
    }
}
