//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Core orchestration crate: trackers, registry, engine, and service facade."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
//! Asynchronous deployment and operation tracking.
//!
//! Requests are accepted synchronously: a `Pending` tracking record is stored
//! and returned before any background work runs. The [`TaskDispatcher`] then
//! drives every record to `Succeeded` or `Failed`, whatever way its unit ends.

pub mod backend;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod models;
pub mod provider;
pub mod registry;
pub mod secrets;
pub mod service;
pub mod tracker;

pub use backend::{ProvisioningBackend, RetryPolicy, RetryingBackend, SimulatedBackend};
pub use dispatch::TaskDispatcher;
pub use engine::ExecutionEngine;
pub use error::{BackendError, OrchestrationError, RecordKind, Result};
pub use models::{
    ActionOutcome, DeploymentRequest, DeploymentResult, DeploymentStatus, ExecutionStatus,
    OperationKind, OperationRequest, OperationResult, Resource, ResourceHandle, ResourceQuery,
    ResourceSpec,
};
pub use provider::{
    Provider, ProviderBackend, ProviderRegistry, ProviderSummary, SimulatedProvider,
    PROVISION_ACTION,
};
pub use registry::ResourceRegistry;
pub use secrets::{InMemorySecretStore, SecretError, SecretStore};
pub use service::{HealthReport, OrchestrationService, Orchestrator};
pub use tracker::{DeploymentTracker, OperationTracker, TerminalSink, TrackedRecord, Tracker};
