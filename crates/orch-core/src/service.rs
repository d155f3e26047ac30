//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Orchestration service facade exposed to the HTTP boundary."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use orch_common::AppConfig;
use orch_metrics::EngineMetrics;
use serde::Serialize;
use tracing::{error, info};

use crate::backend::{ProvisioningBackend, SimulatedBackend};
use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::models::{
    DeploymentRequest, DeploymentResult, DeploymentStatus, OperationRequest, OperationResult,
    Resource, ResourceQuery,
};
use crate::provider::{ProviderRegistry, ProviderSummary};
use crate::registry::ResourceRegistry;
use crate::tracker::{DeploymentTracker, OperationTracker};

/// Outcome of a liveness probe against the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
    pub resource_count: usize,
    pub deployments_tracked: usize,
    pub operations_tracked: usize,
    pub in_flight: usize,
}

/// Single entry point for deployment and operation requests.
#[async_trait]
pub trait OrchestrationService: Send + Sync {
    async fn create_deployment(&self, request: DeploymentRequest) -> Result<DeploymentResult>;

    async fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus>;

    async fn get_resources(&self, query: &ResourceQuery) -> Result<Vec<Resource>>;

    async fn execute_operation(&self, request: OperationRequest) -> Result<OperationResult>;

    async fn get_operation_status(&self, operation_id: &str) -> Result<OperationResult>;

    async fn health(&self) -> HealthReport;

    fn providers(&self) -> Vec<ProviderSummary>;
}

/// In-process [`OrchestrationService`] backed by an [`ExecutionEngine`].
#[derive(Debug)]
pub struct Orchestrator {
    engine: Arc<ExecutionEngine>,
    providers: ProviderRegistry,
}

impl Orchestrator {
    pub fn new(engine: Arc<ExecutionEngine>, providers: ProviderRegistry) -> Self {
        Self { engine, providers }
    }

    /// Register the configured providers and build the engine around either the
    /// `engine.default_provider` backend or the built-in simulation.
    pub fn from_config(config: &AppConfig, metrics: Option<EngineMetrics>) -> Result<Self> {
        let providers = ProviderRegistry::from_config(&config.providers);
        let backend: Arc<dyn ProvisioningBackend> = match &config.engine.default_provider {
            Some(name) => {
                let backend = providers.backend(name)?;
                info!(provider = %backend.provider_name(), "provisioning through provider");
                Arc::new(backend)
            }
            None => Arc::new(SimulatedBackend::from_config(&config.engine)),
        };
        let mut engine = ExecutionEngine::new(
            Arc::new(ResourceRegistry::new()),
            Arc::new(DeploymentTracker::new()),
            Arc::new(OperationTracker::new()),
            backend,
            &config.engine,
        );
        if let Some(metrics) = metrics {
            engine = engine.with_metrics(metrics);
        }
        Ok(Self::new(Arc::new(engine), providers))
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn provider_registry(&self) -> &ProviderRegistry {
        &self.providers
    }
}

#[async_trait]
impl OrchestrationService for Orchestrator {
    async fn create_deployment(&self, request: DeploymentRequest) -> Result<DeploymentResult> {
        self.engine.submit_deployment(request)
    }

    async fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus> {
        self.engine.deployments().get(deployment_id)
    }

    async fn get_resources(&self, query: &ResourceQuery) -> Result<Vec<Resource>> {
        self.engine.registry().query(query)
    }

    async fn execute_operation(&self, request: OperationRequest) -> Result<OperationResult> {
        self.engine.submit_operation(request)
    }

    async fn get_operation_status(&self, operation_id: &str) -> Result<OperationResult> {
        self.engine.operations().get(operation_id)
    }

    async fn health(&self) -> HealthReport {
        info!("performing orchestrator health check");
        let (healthy, message) = match self.get_resources(&ResourceQuery::default()).await {
            Ok(_) => (true, "Platform orchestrator is healthy".to_owned()),
            Err(err) => {
                error!(error = %err, "health check failed");
                (false, "Platform orchestrator is unhealthy".to_owned())
            }
        };
        HealthReport {
            healthy,
            message,
            resource_count: self.engine.registry().len(),
            deployments_tracked: self.engine.deployments().len(),
            operations_tracked: self.engine.operations().len(),
            in_flight: self.engine.in_flight(),
        }
    }

    fn providers(&self) -> Vec<ProviderSummary> {
        self.providers.summaries()
    }
}
