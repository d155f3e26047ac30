//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "tests"
//! orch_type: "test"
//! orch_scope: "code"
//! orch_description: "Integration tests for deployment and operation execution."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use orch_common::{init_test_tracing, AppConfig, EngineConfig, ProviderConfig};
use orch_core::{
    ActionOutcome, BackendError, DeploymentRequest, DeploymentStatus, DeploymentTracker,
    ExecutionEngine, ExecutionStatus, OperationKind, OperationRequest, OperationResult,
    OperationTracker, OrchestrationError, OrchestrationService, Orchestrator, ProviderRegistry,
    ProvisioningBackend, RecordKind, ResourceHandle, ResourceQuery, ResourceRegistry,
    ResourceSpec,
};
use serde_json::Value;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    Hang,
    FailTimes(usize),
    /// Provisioning always hands out the same resource id.
    DuplicateId,
    /// Provisioning succeeds but every resource action fails.
    ActionFail,
    ActionPanic,
}

const SHARED_RESOURCE_ID: &str = "shared-id";

/// Backend with scripted provisioning outcomes that records concurrent actions.
struct ScriptedBackend {
    behaviour: Behaviour,
    delay: Duration,
    calls: AtomicUsize,
    active_actions: AtomicUsize,
    max_active_actions: AtomicUsize,
}

impl ScriptedBackend {
    fn new(behaviour: Behaviour, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            delay,
            calls: AtomicUsize::new(0),
            active_actions: AtomicUsize::new(0),
            max_active_actions: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    async fn provision(&self, _spec: &ResourceSpec) -> Result<ResourceHandle, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        match self.behaviour {
            Behaviour::Succeed => {}
            Behaviour::Fail => return Err(BackendError::permanent("subscription quota exceeded")),
            Behaviour::Panic => panic!("provisioner crashed"),
            Behaviour::Hang => sleep(Duration::from_secs(3600)).await,
            Behaviour::FailTimes(times) if call < times => {
                return Err(BackendError::new("throttled"))
            }
            Behaviour::FailTimes(_) => {}
            Behaviour::DuplicateId => {
                return Ok(ResourceHandle {
                    resource_id: SHARED_RESOURCE_ID.into(),
                    status: "Running".into(),
                    properties: IndexMap::new(),
                })
            }
            Behaviour::ActionFail | Behaviour::ActionPanic => {}
        }
        Ok(ResourceHandle {
            resource_id: uuid::Uuid::new_v4().to_string(),
            status: "Running".into(),
            properties: IndexMap::new(),
        })
    }

    async fn perform_resource_action(
        &self,
        resource_id: &str,
        action: OperationKind,
        _parameters: &IndexMap<String, Value>,
    ) -> Result<ActionOutcome, BackendError> {
        let active = self.active_actions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_actions.fetch_max(active, Ordering::SeqCst);
        sleep(self.delay).await;
        self.active_actions.fetch_sub(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::ActionFail => return Err(BackendError::permanent("hypervisor unreachable")),
            Behaviour::ActionPanic => panic!("agent crashed during {action}"),
            _ => {}
        }
        Ok(ActionOutcome {
            detail: format!("{action} on {resource_id}"),
        })
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        provisioning_delay: Duration::from_millis(5),
        operation_delay: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

fn orchestrator_with(backend: Arc<dyn ProvisioningBackend>, config: &EngineConfig) -> Orchestrator {
    init_test_tracing();
    let engine = ExecutionEngine::new(
        Arc::new(ResourceRegistry::new()),
        Arc::new(DeploymentTracker::new()),
        Arc::new(OperationTracker::new()),
        backend,
        config,
    );
    Orchestrator::new(Arc::new(engine), ProviderRegistry::new())
}

fn simulated() -> Orchestrator {
    init_test_tracing();
    Orchestrator::new(
        Arc::new(ExecutionEngine::simulated(&fast_config())),
        ProviderRegistry::new(),
    )
}

fn vm_request(name: &str) -> DeploymentRequest {
    DeploymentRequest::new("VirtualMachine", name, "westeurope")
        .with_tag("env", "test")
        .with_parameter("size", Value::from("Standard_B2s"))
}

async fn wait_deployment(service: &Orchestrator, id: &str) -> DeploymentStatus {
    timeout(Duration::from_secs(5), async {
        loop {
            let status = service.get_deployment_status(id).await.unwrap();
            if status.status.is_terminal() {
                return status;
            }
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("deployment did not reach a terminal state")
}

async fn wait_operation(service: &Orchestrator, id: &str) -> OperationResult {
    timeout(Duration::from_secs(5), async {
        loop {
            let result = service.get_operation_status(id).await.unwrap();
            if result.status.is_terminal() {
                return result;
            }
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("operation did not reach a terminal state")
}

async fn deploy(service: &Orchestrator, name: &str) -> String {
    let result = service.create_deployment(vm_request(name)).await.unwrap();
    let status = wait_deployment(service, &result.deployment_id).await;
    assert_eq!(status.status, ExecutionStatus::Succeeded, "{}", status.message);
    status.resource_id.expect("succeeded deployment carries a resource id")
}

#[tokio::test]
async fn deployment_is_pending_immediately() {
    let service = simulated();
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Pending);

    let status = service
        .get_deployment_status(&result.deployment_id)
        .await
        .unwrap();
    assert_eq!(status.status, ExecutionStatus::Pending);
    assert_eq!(status.message, "Deployment queued");
    assert_eq!(status.resource_id, None);
    assert_eq!(status.created_at, result.created_at);
}

#[tokio::test]
async fn invalid_deployment_is_rejected_synchronously() {
    let service = simulated();
    let err = service
        .create_deployment(DeploymentRequest::new("", "vm-1", "westeurope"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidArgument(_)));
    assert!(service.engine().deployments().is_empty());
}

#[tokio::test]
async fn unknown_deployment_is_not_found() {
    let service = simulated();
    let err = service.get_deployment_status("missing").await.unwrap_err();
    assert_eq!(err, OrchestrationError::not_found(RecordKind::Deployment, "missing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observed_statuses_never_move_backwards() {
    let backend = ScriptedBackend::new(Behaviour::Succeed, Duration::from_millis(30));
    let service = orchestrator_with(backend, &fast_config());
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();

    let mut observed = vec![ExecutionStatus::Pending];
    timeout(Duration::from_secs(5), async {
        loop {
            let status = service
                .get_deployment_status(&result.deployment_id)
                .await
                .unwrap()
                .status;
            if observed.last() != Some(&status) {
                observed.push(status);
            }
            if status.is_terminal() {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    for pair in observed.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{observed:?}");
    }
    assert_eq!(observed.last(), Some(&ExecutionStatus::Succeeded));

    service.engine().wait_idle().await;
    let settled = service
        .get_deployment_status(&result.deployment_id)
        .await
        .unwrap();
    assert_eq!(settled.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn succeeded_deployment_registers_matching_resource() {
    let service = simulated();
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    let status = wait_deployment(&service, &result.deployment_id).await;

    assert_eq!(status.status, ExecutionStatus::Succeeded);
    assert_eq!(status.message, "Deployment completed successfully");
    let resource_id = status.resource_id.unwrap();
    let resource = service.engine().registry().get(&resource_id).unwrap();
    let request = vm_request("vm-1");
    assert_eq!(resource.name, request.name);
    assert_eq!(resource.resource_type, request.resource_type);
    assert_eq!(resource.region, request.region);
    assert_eq!(resource.tags, request.tags);
    assert_eq!(resource.status, "Running");
}

#[tokio::test]
async fn backend_failure_marks_deployment_failed() {
    let backend = ScriptedBackend::new(Behaviour::Fail, Duration::from_millis(1));
    let service = orchestrator_with(backend, &fast_config());
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    let status = wait_deployment(&service, &result.deployment_id).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.message, "Deployment failed: subscription quota exceeded");
    assert_eq!(status.resource_id, None);
    assert!(service.engine().registry().is_empty());
}

#[tokio::test]
async fn backend_panic_marks_deployment_failed() {
    let backend = ScriptedBackend::new(Behaviour::Panic, Duration::from_millis(1));
    let service = orchestrator_with(backend, &fast_config());
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    let status = wait_deployment(&service, &result.deployment_id).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert!(status.message.contains("provisioner crashed"), "{}", status.message);
    assert_eq!(service.engine().in_flight(), 0);
}

#[tokio::test]
async fn stuck_deployment_times_out_when_configured() {
    let backend = ScriptedBackend::new(Behaviour::Hang, Duration::from_millis(1));
    let config = EngineConfig {
        execution_timeout: Some(Duration::from_millis(50)),
        ..fast_config()
    };
    let service = orchestrator_with(backend, &config);
    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    service.engine().wait_idle().await;

    let status = service
        .get_deployment_status(&result.deployment_id)
        .await
        .unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.message, "Deployment failed: timed out after 50ms");
}

#[tokio::test]
async fn retry_policy_recovers_transient_failures() {
    let backend = ScriptedBackend::new(Behaviour::FailTimes(2), Duration::from_millis(1));
    let mut config = fast_config();
    config.retry.max_attempts = 3;
    config.retry.base_delay = Duration::from_millis(1);
    let service = orchestrator_with(backend.clone(), &config);

    let result = service.create_deployment(vm_request("vm-1")).await.unwrap();
    let status = wait_deployment(&service, &result.deployment_id).await;
    assert_eq!(status.status, ExecutionStatus::Succeeded);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn operation_on_unknown_resource_creates_no_record() {
    let service = simulated();
    let err = service
        .execute_operation(OperationRequest::new("missing", "stop"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestrationError::not_found(RecordKind::Resource, "missing"));
    assert!(service.engine().operations().is_empty());
}

#[tokio::test]
async fn stop_and_start_update_resource_status() {
    let service = simulated();
    let resource_id = deploy(&service, "vm-1").await;

    let stop = service
        .execute_operation(OperationRequest::new(&resource_id, "STOP"))
        .await
        .unwrap();
    assert_eq!(stop.status, ExecutionStatus::Pending);
    assert_eq!(stop.message, "Operation queued");
    let stopped = wait_operation(&service, &stop.operation_id).await;
    assert_eq!(stopped.status, ExecutionStatus::Succeeded);
    assert_eq!(stopped.message, "Resource stopped successfully");
    let resource = service.engine().registry().get(&resource_id).unwrap();
    assert_eq!(resource.status, "Stopped");
    assert!(resource.last_updated_at.is_some());

    let restart = service
        .execute_operation(OperationRequest::new(&resource_id, "restart"))
        .await
        .unwrap();
    let restarted = wait_operation(&service, &restart.operation_id).await;
    assert_eq!(restarted.message, "Resource restarted successfully");
    assert_eq!(
        service.engine().registry().get(&resource_id).unwrap().status,
        "Running"
    );
}

#[tokio::test]
async fn unsupported_operation_fails_without_touching_resource() {
    let service = simulated();
    let resource_id = deploy(&service, "vm-1").await;
    let before = service.engine().registry().get(&resource_id).unwrap();

    let op = service
        .execute_operation(OperationRequest::new(&resource_id, "resize"))
        .await
        .unwrap();
    let result = wait_operation(&service, &op.operation_id).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.message, "Unsupported operation type: resize");
    assert_eq!(service.engine().registry().get(&resource_id).unwrap(), before);
}

#[tokio::test]
async fn delete_removes_resource_for_good() {
    let service = simulated();
    let resource_id = deploy(&service, "vm-1").await;

    let op = service
        .execute_operation(OperationRequest::new(&resource_id, "Delete"))
        .await
        .unwrap();
    let result = wait_operation(&service, &op.operation_id).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.message, "Resource deleted successfully");

    let listed = service
        .get_resources(&ResourceQuery::page(100, 1))
        .await
        .unwrap();
    assert!(listed.iter().all(|resource| resource.id != resource_id));

    let err = service
        .execute_operation(OperationRequest::new(&resource_id, "start"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let service = simulated();
    let err = service.get_operation_status("missing").await.unwrap_err();
    assert_eq!(err.to_string(), "Operation with ID missing not found");
}

#[tokio::test]
async fn resources_paginate_and_filter() {
    let service = simulated();
    for index in 0..25 {
        service
            .create_deployment(vm_request(&format!("vm-{index}")))
            .await
            .unwrap();
    }
    service
        .create_deployment(DeploymentRequest::new("StorageAccount", "logs", "eastus"))
        .await
        .unwrap();
    service.engine().wait_idle().await;

    let vms = ResourceQuery::page(10, 1).with_type("virtualmachine");
    assert_eq!(service.get_resources(&vms).await.unwrap().len(), 10);
    let second = ResourceQuery { page_number: 2, ..vms.clone() };
    assert_eq!(service.get_resources(&second).await.unwrap().len(), 10);
    let third = ResourceQuery { page_number: 3, ..vms.clone() };
    assert_eq!(service.get_resources(&third).await.unwrap().len(), 5);

    let storage = ResourceQuery::default()
        .with_type("STORAGEACCOUNT")
        .with_region("EastUS");
    let hits = service.get_resources(&storage).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "logs");

    for bad in [ResourceQuery::page(0, 1), ResourceQuery::page(101, 1), ResourceQuery::page(10, 0)] {
        assert!(matches!(
            service.get_resources(&bad).await.unwrap_err(),
            OrchestrationError::InvalidArgument(_)
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deployments_stay_independent() {
    let service = Arc::new(simulated());
    let mut handles = Vec::new();
    for index in 0..32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("vm-{index}");
            let result = service.create_deployment(vm_request(&name)).await.unwrap();
            (name, result.deployment_id)
        }));
    }
    let submitted: Vec<(String, String)> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let ids: HashSet<&String> = submitted.iter().map(|(_, id)| id).collect();
    assert_eq!(ids.len(), submitted.len());

    service.engine().wait_idle().await;
    for (name, deployment_id) in &submitted {
        let status = service.get_deployment_status(deployment_id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Succeeded);
        let resource = service
            .engine()
            .registry()
            .get(status.resource_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(&resource.name, name);
    }
    assert_eq!(service.engine().registry().len(), 32);
}

#[tokio::test]
async fn unserialized_operations_on_one_resource_overlap() {
    let backend = ScriptedBackend::new(Behaviour::Succeed, Duration::from_millis(20));
    let service = orchestrator_with(backend.clone(), &fast_config());
    let resource_id = deploy(&service, "vm-1").await;

    let stop = service
        .execute_operation(OperationRequest::new(&resource_id, "stop"))
        .await
        .unwrap();
    let start = service
        .execute_operation(OperationRequest::new(&resource_id, "start"))
        .await
        .unwrap();
    service.engine().wait_idle().await;

    // Last writer wins; both report success regardless of the final status.
    assert_eq!(backend.max_active_actions.load(Ordering::SeqCst), 2);
    for id in [&stop.operation_id, &start.operation_id] {
        assert_eq!(
            service.get_operation_status(id).await.unwrap().status,
            ExecutionStatus::Succeeded
        );
    }
    let status = service.engine().registry().get(&resource_id).unwrap().status;
    assert!(status == "Running" || status == "Stopped");
}

#[tokio::test]
async fn serialized_operations_on_one_resource_do_not_overlap() {
    let backend = ScriptedBackend::new(Behaviour::Succeed, Duration::from_millis(20));
    let config = EngineConfig {
        serialize_resource_operations: true,
        ..fast_config()
    };
    let service = orchestrator_with(backend.clone(), &config);
    let resource_id = deploy(&service, "vm-1").await;

    for operation in ["stop", "start", "restart", "stop"] {
        service
            .execute_operation(OperationRequest::new(&resource_id, operation))
            .await
            .unwrap();
    }
    service.engine().wait_idle().await;

    assert_eq!(backend.max_active_actions.load(Ordering::SeqCst), 1);
    assert_eq!(service.engine().operations().len(), 4);
}

#[tokio::test]
async fn health_reports_store_sizes() {
    let service = simulated();
    deploy(&service, "vm-1").await;
    service.engine().wait_idle().await;

    let report = service.health().await;
    assert!(report.healthy);
    assert_eq!(report.message, "Platform orchestrator is healthy");
    assert_eq!(report.resource_count, 1);
    assert_eq!(report.deployments_tracked, 1);
    assert_eq!(report.operations_tracked, 0);
    assert_eq!(report.in_flight, 0);
}

#[tokio::test]
async fn reused_backend_id_fails_deployment_and_keeps_first_resource() {
    let backend = ScriptedBackend::new(Behaviour::DuplicateId, Duration::from_millis(1));
    let service = orchestrator_with(backend, &fast_config());
    let first = deploy(&service, "first").await;
    assert_eq!(first, SHARED_RESOURCE_ID);

    let second = service.create_deployment(vm_request("second")).await.unwrap();
    let status = wait_deployment(&service, &second.deployment_id).await;
    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(
        status.message,
        "Deployment failed: Resource with ID shared-id already exists"
    );
    assert_eq!(status.resource_id, None);

    let registry = service.engine().registry();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(SHARED_RESOURCE_ID).unwrap().name, "first");
}

#[tokio::test]
async fn failed_action_leaves_resource_untouched() {
    let backend = ScriptedBackend::new(Behaviour::ActionFail, Duration::from_millis(1));
    let service = orchestrator_with(backend, &fast_config());
    let resource_id = deploy(&service, "vm-1").await;
    let before = service.engine().registry().get(&resource_id).unwrap();

    let op = service
        .execute_operation(OperationRequest::new(&resource_id, "stop"))
        .await
        .unwrap();
    let result = wait_operation(&service, &op.operation_id).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.message, "Operation failed: hypervisor unreachable");

    let after = service.engine().registry().get(&resource_id).unwrap();
    assert_eq!(after.status, "Running");
    assert_eq!(after.last_updated_at, None);
    assert_eq!(after, before);
}

#[tokio::test]
async fn panicking_delete_keeps_resource_registered() {
    let backend = ScriptedBackend::new(Behaviour::ActionPanic, Duration::from_millis(1));
    let service = orchestrator_with(backend, &fast_config());
    let resource_id = deploy(&service, "vm-1").await;
    let before = service.engine().registry().get(&resource_id).unwrap();

    let op = service
        .execute_operation(OperationRequest::new(&resource_id, "delete"))
        .await
        .unwrap();
    let result = wait_operation(&service, &op.operation_id).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.message.starts_with("Operation failed: "), "{}", result.message);
    assert!(result.message.contains("agent crashed during delete"), "{}", result.message);
    assert_eq!(service.engine().registry().get(&resource_id).unwrap(), before);
    assert_eq!(service.engine().in_flight(), 0);
}

#[tokio::test]
async fn default_provider_backs_provisioning_and_actions() {
    let mut config = AppConfig::default();
    config.engine = fast_config();
    config.engine.default_provider = Some("github".into());
    let mut metadata = IndexMap::new();
    metadata.insert("owner".to_owned(), "platformteam".to_owned());
    config.providers.insert(
        "GitHub".to_owned(),
        ProviderConfig {
            latency: Duration::from_millis(1),
            metadata,
        },
    );
    init_test_tracing();
    let service = Orchestrator::from_config(&config, None).unwrap();

    let resource_id = deploy(&service, "repo-1").await;
    let resource = service.engine().registry().get(&resource_id).unwrap();
    assert_eq!(resource.properties["provider"], "GitHub");
    assert_eq!(resource.properties["owner"], "platformteam");

    let op = service
        .execute_operation(OperationRequest::new(&resource_id, "stop"))
        .await
        .unwrap();
    let result = wait_operation(&service, &op.operation_id).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.message, "Resource stopped successfully");

    config.engine.default_provider = Some("gitlab".into());
    let err = Orchestrator::from_config(&config, None).unwrap_err();
    assert_eq!(err, OrchestrationError::not_found(RecordKind::Provider, "gitlab"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_read_on_worker_pool_is_not_yet_terminal() {
    let backend = ScriptedBackend::new(Behaviour::Succeed, Duration::from_millis(20));
    let service = orchestrator_with(backend, &fast_config());

    for index in 0..200 {
        let result = service
            .create_deployment(vm_request(&format!("vm-{index}")))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Pending);
        let status = service
            .get_deployment_status(&result.deployment_id)
            .await
            .unwrap()
            .status;
        assert!(
            matches!(status, ExecutionStatus::Pending | ExecutionStatus::InProgress),
            "{status:?}"
        );
    }
    service.engine().wait_idle().await;
}
