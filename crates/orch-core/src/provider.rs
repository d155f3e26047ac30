//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Pluggable provider integrations resolved by name at startup."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use orch_common::ProviderConfig;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::ProvisioningBackend;
use crate::error::{BackendError, OrchestrationError, RecordKind, Result};
use crate::models::{ActionOutcome, OperationKind, ResourceHandle, ResourceSpec, STATUS_RUNNING};

/// Action name passed to [`Provider::execute_action`] when creating a resource.
pub const PROVISION_ACTION: &str = "provision";

/// Capability exposed by an external integration such as a source host or cloud.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_metadata(&self, resource_id: &str)
        -> std::result::Result<IndexMap<String, Value>, BackendError>;

    async fn execute_action(
        &self,
        resource_id: &str,
        action: &str,
        parameters: &IndexMap<String, Value>,
    ) -> std::result::Result<String, BackendError>;
}

/// Provider that answers after a fixed latency with canned metadata.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    name: String,
    latency: Duration,
    metadata: IndexMap<String, String>,
}

impl SimulatedProvider {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            name: name.into(),
            latency: config.latency,
            metadata: config.metadata.clone(),
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_metadata(
        &self,
        resource_id: &str,
    ) -> std::result::Result<IndexMap<String, Value>, BackendError> {
        info!(provider = %self.name, resource_id, "retrieving provider metadata");
        sleep(self.latency).await;
        let mut metadata = IndexMap::new();
        metadata.insert("id".to_owned(), Value::from(resource_id));
        metadata.insert("provider".to_owned(), Value::from(self.name.as_str()));
        for (key, value) in &self.metadata {
            metadata.insert(key.clone(), Value::from(value.as_str()));
        }
        metadata.insert("retrieved_at".to_owned(), Value::from(Utc::now().to_rfc3339()));
        Ok(metadata)
    }

    async fn execute_action(
        &self,
        resource_id: &str,
        action: &str,
        _parameters: &IndexMap<String, Value>,
    ) -> std::result::Result<String, BackendError> {
        info!(provider = %self.name, resource_id, action, "executing provider action");
        sleep(self.latency).await;
        Ok(format!(
            "Operation '{action}' executed successfully on resource '{resource_id}'"
        ))
    }
}

/// [`ProvisioningBackend`] that delegates to a resolved [`Provider`].
///
/// Provisioning assigns a fresh id, runs the provider's `provision` action on
/// it and records the provider metadata as resource properties.
#[derive(Clone)]
pub struct ProviderBackend {
    provider: Arc<dyn Provider>,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

impl std::fmt::Debug for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBackend")
            .field("provider", &self.provider.name())
            .finish()
    }
}

#[async_trait]
impl ProvisioningBackend for ProviderBackend {
    async fn provision(
        &self,
        spec: &ResourceSpec,
    ) -> std::result::Result<ResourceHandle, BackendError> {
        let resource_id = Uuid::new_v4().to_string();
        let detail = self
            .provider
            .execute_action(&resource_id, PROVISION_ACTION, &spec.parameters)
            .await?;
        debug!(provider = %self.provider.name(), resource_id = %resource_id, name = %spec.name, detail = %detail, "provider provisioned resource");
        let properties = self.provider.get_metadata(&resource_id).await?;
        Ok(ResourceHandle {
            resource_id,
            status: STATUS_RUNNING.to_owned(),
            properties,
        })
    }

    async fn perform_resource_action(
        &self,
        resource_id: &str,
        action: OperationKind,
        parameters: &IndexMap<String, Value>,
    ) -> std::result::Result<ActionOutcome, BackendError> {
        let detail = self
            .provider
            .execute_action(resource_id, action.as_str(), parameters)
            .await?;
        Ok(ActionOutcome { detail })
    }
}

/// Public listing entry for a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
}

/// Providers keyed by case-insensitive name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: IndexMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`SimulatedProvider`] for every `[providers.<name>]` table.
    pub fn from_config(providers: &IndexMap<String, ProviderConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in providers {
            registry.register(Arc::new(SimulatedProvider::new(name.clone(), config)));
        }
        registry
    }

    /// Add or replace a provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let key = provider.name().to_lowercase();
        info!(provider = %provider.name(), "provider registered");
        self.providers.insert(key, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(RecordKind::Provider, name))
    }

    /// Resolve `name` into a backend for the execution engine.
    pub fn backend(&self, name: &str) -> Result<ProviderBackend> {
        self.get(name).map(ProviderBackend::new)
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.providers
            .values()
            .map(|provider| ProviderSummary {
                name: provider.name().to_owned(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
