//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Provisioning backend capability, simulated backend, and retry wrapper."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use orch_common::{EngineConfig, RetryConfig};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BackendError;
use crate::models::{ActionOutcome, OperationKind, ResourceHandle, ResourceSpec, STATUS_RUNNING};

/// External capability that performs the actual infrastructure work.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceHandle, BackendError>;

    async fn perform_resource_action(
        &self,
        resource_id: &str,
        action: OperationKind,
        parameters: &IndexMap<String, Value>,
    ) -> Result<ActionOutcome, BackendError>;
}

#[async_trait]
impl<T: ProvisioningBackend + ?Sized> ProvisioningBackend for Arc<T> {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceHandle, BackendError> {
        (**self).provision(spec).await
    }

    async fn perform_resource_action(
        &self,
        resource_id: &str,
        action: OperationKind,
        parameters: &IndexMap<String, Value>,
    ) -> Result<ActionOutcome, BackendError> {
        (**self)
            .perform_resource_action(resource_id, action, parameters)
            .await
    }
}

/// Backend that only waits out a configured latency and always succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    provisioning_delay: Duration,
    operation_delay: Duration,
}

impl SimulatedBackend {
    pub fn new(provisioning_delay: Duration, operation_delay: Duration) -> Self {
        Self {
            provisioning_delay,
            operation_delay,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.provisioning_delay, config.operation_delay)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceHandle, BackendError> {
        sleep(self.provisioning_delay).await;
        let resource_id = Uuid::new_v4().to_string();
        debug!(resource_id = %resource_id, name = %spec.name, "simulated provisioning finished");
        let mut properties = IndexMap::new();
        properties.insert("provisioner".to_owned(), Value::from("simulated"));
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
        _parameters: &IndexMap<String, Value>,
    ) -> Result<ActionOutcome, BackendError> {
        sleep(self.operation_delay).await;
        Ok(ActionOutcome {
            detail: format!("{action} completed on {resource_id}"),
        })
    }
}

/// Retry schedule with exponential backoff and bounded random jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self.base_delay.saturating_mul(2u32.pow(exponent));
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis()) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay, config.jitter)
    }
}

/// Wraps a backend with bounded retries for retryable failures.
#[derive(Debug)]
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl<B: ProvisioningBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seed the jitter source for deterministic tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock();
        self.policy.backoff_delay(attempt, &mut rng)
    }

    async fn retry<T, F, Fut>(&self, action: &str, mut call: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, BackendError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt < self.policy.max_attempts => {
                    let delay = self.next_delay(attempt);
                    warn!(
                        action,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backend call failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<B: ProvisioningBackend> ProvisioningBackend for RetryingBackend<B> {
    async fn provision(&self, spec: &ResourceSpec) -> Result<ResourceHandle, BackendError> {
        self.retry("provision", || self.inner.provision(spec)).await
    }

    async fn perform_resource_action(
        &self,
        resource_id: &str,
        action: OperationKind,
        parameters: &IndexMap<String, Value>,
    ) -> Result<ActionOutcome, BackendError> {
        self.retry(action.as_str(), || {
            self.inner
                .perform_resource_action(resource_id, action, parameters)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::models::DeploymentRequest;

    struct Flaky {
        failures_left: AtomicU32,
        calls: Arc<AtomicU32>,
        retryable: bool,
    }

    #[async_trait]
    impl ProvisioningBackend for Flaky {
        async fn provision(&self, _spec: &ResourceSpec) -> Result<ResourceHandle, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BackendError {
                    message: "throttled".into(),
                    retryable: self.retryable,
                });
            }
            Ok(ResourceHandle {
                resource_id: "r-1".into(),
                status: STATUS_RUNNING.into(),
                properties: IndexMap::new(),
            })
        }

        async fn perform_resource_action(
            &self,
            _resource_id: &str,
            _action: OperationKind,
            _parameters: &IndexMap<String, Value>,
        ) -> Result<ActionOutcome, BackendError> {
            Err(BackendError::permanent("unsupported"))
        }
    }

    fn spec() -> ResourceSpec {
        ResourceSpec::from(&DeploymentRequest::new("VirtualMachine", "vm-1", "westeurope"))
    }

    fn flaky(failures: u32, retryable: bool) -> (Flaky, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Flaky {
                failures_left: AtomicU32::new(failures),
                calls: calls.clone(),
                retryable,
            },
            calls,
        )
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.backoff_delay(1, &mut rng), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2, &mut rng), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(4, &mut rng), Duration::from_millis(800));

        let jittered = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_millis(50));
        let delay = jittered.backoff_delay(1, &mut rng);
        assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (inner, calls) = flaky(2, true);
        let backend = RetryingBackend::new(
            inner,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::ZERO),
        )
        .with_seed(1);
        let handle = backend.provision(&spec()).await.unwrap();
        assert_eq!(handle.resource_id, "r-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (inner, calls) = flaky(5, true);
        let backend = RetryingBackend::new(
            inner,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::ZERO),
        );
        let err = backend.provision(&spec()).await.unwrap_err();
        assert_eq!(err.message, "throttled");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (inner, calls) = flaky(1, false);
        let backend = RetryingBackend::new(
            inner,
            RetryPolicy::new(4, Duration::from_millis(1), Duration::ZERO),
        );
        assert!(backend.provision(&spec()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn simulated_backend_reports_running() {
        let backend = SimulatedBackend::new(Duration::from_millis(1), Duration::from_millis(1));
        let handle = backend.provision(&spec()).await.unwrap();
        assert_eq!(handle.status, STATUS_RUNNING);
        assert!(!handle.resource_id.is_empty());

        let outcome = backend
            .perform_resource_action(&handle.resource_id, OperationKind::Stop, &IndexMap::new())
            .await
            .unwrap();
        assert!(outcome.detail.starts_with("stop completed"));
    }
}
