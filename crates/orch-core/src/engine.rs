//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Execution engine creating tracking records and running background units."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use orch_common::EngineConfig;
use orch_metrics::EngineMetrics;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ProvisioningBackend, RetryPolicy, RetryingBackend, SimulatedBackend};
use crate::dispatch::TaskDispatcher;
use crate::error::{OrchestrationError, RecordKind, Result};
use crate::models::{
    DeploymentRequest, DeploymentResult, DeploymentStatus, ExecutionStatus, OperationKind,
    OperationRequest, OperationResult, Resource, ResourceSpec,
};
use crate::registry::ResourceRegistry;
use crate::tracker::{DeploymentTracker, OperationTracker, TerminalSink, TrackedRecord, Tracker};

const UNSUPPORTED_LABEL: &str = "unsupported";

/// Async mutexes keyed by resource id.
#[derive(Debug, Default)]
struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ResourceLocks {
    async fn acquire(&self, resource_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(resource_id.to_owned())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn forget(&self, resource_id: &str) {
        self.locks.lock().remove(resource_id);
    }
}

/// Terminal sink that also counts the failure.
struct MeteredSink<R: TrackedRecord> {
    tracker: Arc<Tracker<R>>,
    on_failure: Box<dyn Fn() + Send + Sync>,
}

impl<R: TrackedRecord> TerminalSink for MeteredSink<R> {
    fn fail(&self, id: &str, reason: &str) -> bool {
        let written = self.tracker.fail(id, reason);
        if written {
            (self.on_failure)();
        }
        written
    }
}

/// Creates tracking records synchronously and detaches the work that drives
/// them to a terminal state.
pub struct ExecutionEngine {
    registry: Arc<ResourceRegistry>,
    deployments: Arc<DeploymentTracker>,
    operations: Arc<OperationTracker>,
    backend: Arc<dyn ProvisioningBackend>,
    dispatcher: TaskDispatcher,
    resource_locks: Option<Arc<ResourceLocks>>,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("resources", &self.registry.len())
            .field("deployments", &self.deployments.len())
            .field("operations", &self.operations.len())
            .field("in_flight", &self.dispatcher.in_flight())
            .field("serialized", &self.resource_locks.is_some())
            .finish()
    }
}

impl ExecutionEngine {
    /// Build an engine around `backend`, wrapping it in a [`RetryingBackend`]
    /// when the configuration allows more than one attempt.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        deployments: Arc<DeploymentTracker>,
        operations: Arc<OperationTracker>,
        backend: Arc<dyn ProvisioningBackend>,
        config: &EngineConfig,
    ) -> Self {
        let backend: Arc<dyn ProvisioningBackend> = if config.retry.max_attempts > 1 {
            Arc::new(RetryingBackend::new(backend, RetryPolicy::from(&config.retry)))
        } else {
            backend
        };
        let resource_locks = config
            .serialize_resource_operations
            .then(|| Arc::new(ResourceLocks::default()));
        Self {
            registry,
            deployments,
            operations,
            backend,
            dispatcher: TaskDispatcher::new(config.execution_timeout),
            resource_locks,
            metrics: None,
        }
    }

    /// Engine with fresh stores and the simulated backend.
    pub fn simulated(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(ResourceRegistry::new()),
            Arc::new(DeploymentTracker::new()),
            Arc::new(OperationTracker::new()),
            Arc::new(SimulatedBackend::from_config(config)),
            config,
        )
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.dispatcher = self.dispatcher.clone().with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn deployments(&self) -> &Arc<DeploymentTracker> {
        &self.deployments
    }

    pub fn operations(&self) -> &Arc<OperationTracker> {
        &self.operations
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Resolve once every dispatched unit has been finalised.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Validate, record `Pending`, and detach provisioning.
    pub fn submit_deployment(&self, request: DeploymentRequest) -> Result<DeploymentResult> {
        request.validate()?;

        let deployment_id = Uuid::new_v4().to_string();
        let record = DeploymentStatus::pending(deployment_id.clone(), Utc::now());
        let result = record.to_result();
        self.deployments.insert(record);
        if let Some(metrics) = &self.metrics {
            metrics.inc_deployment_submitted();
        }
        info!(
            deployment_id = %deployment_id,
            resource_type = %request.resource_type,
            name = %request.name,
            region = %request.region,
            "deployment accepted"
        );

        let metrics = self.metrics.clone();
        let sink = Arc::new(MeteredSink {
            tracker: self.deployments.clone(),
            on_failure: Box::new(move || {
                if let Some(metrics) = &metrics {
                    metrics.record_deployment_outcome(ExecutionStatus::Failed.as_str());
                }
            }),
        });
        let unit = DeploymentUnit {
            deployment_id: deployment_id.clone(),
            request,
            registry: self.registry.clone(),
            deployments: self.deployments.clone(),
            backend: self.backend.clone(),
            metrics: self.metrics.clone(),
        };
        self.dispatcher.dispatch(deployment_id, sink, unit.run());
        Ok(result)
    }

    /// Check the target exists, record `Pending`, and detach the action.
    pub fn submit_operation(&self, request: OperationRequest) -> Result<OperationResult> {
        if !self.registry.contains(&request.resource_id) {
            return Err(OrchestrationError::not_found(
                RecordKind::Resource,
                request.resource_id,
            ));
        }

        let operation_id = Uuid::new_v4().to_string();
        let record = OperationResult::pending(operation_id.clone(), &request, Utc::now());
        self.operations.insert(record.clone());
        info!(
            operation_id = %operation_id,
            resource_id = %request.resource_id,
            operation = %request.operation_type,
            "operation accepted"
        );

        let kind = OperationKind::parse(&request.operation_type);
        let label = kind.map_or(UNSUPPORTED_LABEL, |kind| kind.as_str());
        let metrics = self.metrics.clone();
        let sink = Arc::new(MeteredSink {
            tracker: self.operations.clone(),
            on_failure: Box::new(move || {
                if let Some(metrics) = &metrics {
                    metrics.record_operation_outcome(label, ExecutionStatus::Failed.as_str());
                }
            }),
        });
        let unit = OperationUnit {
            operation_id: operation_id.clone(),
            kind,
            request,
            registry: self.registry.clone(),
            operations: self.operations.clone(),
            backend: self.backend.clone(),
            resource_locks: self.resource_locks.clone(),
            metrics: self.metrics.clone(),
        };
        self.dispatcher.dispatch(operation_id, sink, unit.run());
        Ok(record)
    }
}

struct DeploymentUnit {
    deployment_id: String,
    request: DeploymentRequest,
    registry: Arc<ResourceRegistry>,
    deployments: Arc<DeploymentTracker>,
    backend: Arc<dyn ProvisioningBackend>,
    metrics: Option<EngineMetrics>,
}

impl DeploymentUnit {
    async fn run(self) -> Result<()> {
        let id = self.deployment_id.as_str();
        self.deployments
            .transition(id, ExecutionStatus::InProgress, "Deployment in progress")?;

        let handle = self
            .backend
            .provision(&ResourceSpec::from(&self.request))
            .await?;

        let request = self.request;
        let resource = Resource {
            id: handle.resource_id,
            name: request.name,
            resource_type: request.resource_type,
            region: request.region,
            status: handle.status,
            tags: request.tags,
            properties: handle.properties,
            created_at: Utc::now(),
            last_updated_at: None,
        };
        let resource_id = resource.id.clone();
        self.registry.insert(resource)?;
        debug!(deployment_id = %id, resource_id = %resource_id, "resource registered");

        self.deployments.transition_with(
            id,
            ExecutionStatus::Succeeded,
            "Deployment completed successfully",
            |record| record.resource_id = Some(resource_id),
        )?;
        if let Some(metrics) = &self.metrics {
            metrics.record_deployment_outcome(ExecutionStatus::Succeeded.as_str());
        }
        Ok(())
    }
}

struct OperationUnit {
    operation_id: String,
    kind: Option<OperationKind>,
    request: OperationRequest,
    registry: Arc<ResourceRegistry>,
    operations: Arc<OperationTracker>,
    backend: Arc<dyn ProvisioningBackend>,
    resource_locks: Option<Arc<ResourceLocks>>,
    metrics: Option<EngineMetrics>,
}

impl OperationUnit {
    async fn run(self) -> Result<()> {
        let id = self.operation_id.as_str();
        let resource_id = self.request.resource_id.as_str();
        self.operations
            .transition(id, ExecutionStatus::InProgress, "Operation in progress")?;

        let Some(kind) = self.kind else {
            warn!(operation_id = %id, operation = %self.request.operation_type, "unsupported operation type");
            self.operations.transition(
                id,
                ExecutionStatus::Failed,
                format!("Unsupported operation type: {}", self.request.operation_type),
            )?;
            self.record(UNSUPPORTED_LABEL, ExecutionStatus::Failed);
            return Ok(());
        };

        let _permit = match &self.resource_locks {
            Some(locks) => Some(locks.acquire(resource_id).await),
            None => None,
        };

        let outcome = self
            .backend
            .perform_resource_action(resource_id, kind, &self.request.parameters)
            .await?;
        debug!(operation_id = %id, resource_id, detail = %outcome.detail, "backend action finished");

        match kind.resulting_status() {
            Some(status) => {
                self.registry.set_status(resource_id, status, Utc::now())?;
            }
            None => {
                self.registry
                    .remove(resource_id)
                    .ok_or_else(|| OrchestrationError::not_found(RecordKind::Resource, resource_id))?;
                if let Some(locks) = &self.resource_locks {
                    locks.forget(resource_id);
                }
            }
        }

        self.operations
            .transition(id, ExecutionStatus::Succeeded, kind.success_message())?;
        self.record(kind.as_str(), ExecutionStatus::Succeeded);
        Ok(())
    }

    fn record(&self, operation: &str, status: ExecutionStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation_outcome(operation, status.as_str());
        }
    }
}
