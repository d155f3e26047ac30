//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Secret store capability for credential-bearing collaborators."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("secret names must not be empty")]
    EmptyName,
}

/// Get/set/delete of named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError>;
    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError>;
    async fn delete_secret(&self, name: &str) -> Result<(), SecretError>;
}

/// Process-local store; values never leave memory and are never logged.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for InMemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySecretStore")
            .field("entries", &self.secrets.read().len())
            .finish()
    }
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_name(name: &str) -> Result<(), SecretError> {
    if name.trim().is_empty() {
        return Err(SecretError::EmptyName);
    }
    Ok(())
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        check_name(name)?;
        info!(secret = %name, "retrieving secret");
        self.secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_owned()))
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError> {
        check_name(name)?;
        info!(secret = %name, "setting secret");
        self.secrets.write().insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), SecretError> {
        check_name(name)?;
        info!(secret = %name, "deleting secret");
        self.secrets
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SecretError::NotFound(name.to_owned()))
    }
}
