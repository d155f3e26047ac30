//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Keyed stores of deployment and operation tracking records."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::{OrchestrationError, RecordKind, Result};
use crate::models::{DeploymentStatus, ExecutionStatus, OperationResult};

/// Record shape shared by the deployment and operation trackers.
pub trait TrackedRecord: Clone + Send + Sync + 'static {
    const KIND: RecordKind;
    /// Prefix applied to failure reasons, e.g. `Deployment failed`.
    const FAILURE_PREFIX: &'static str;

    fn id(&self) -> &str;
    fn status(&self) -> ExecutionStatus;
    fn set_progress(&mut self, status: ExecutionStatus, message: String, now: DateTime<Utc>);
}

impl TrackedRecord for DeploymentStatus {
    const KIND: RecordKind = RecordKind::Deployment;
    const FAILURE_PREFIX: &'static str = "Deployment failed";

    fn id(&self) -> &str {
        &self.deployment_id
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn set_progress(&mut self, status: ExecutionStatus, message: String, now: DateTime<Utc>) {
        self.status = status;
        self.message = message;
        self.last_updated_at = now;
    }
}

impl TrackedRecord for OperationResult {
    const KIND: RecordKind = RecordKind::Operation;
    const FAILURE_PREFIX: &'static str = "Operation failed";

    fn id(&self) -> &str {
        &self.operation_id
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn set_progress(&mut self, status: ExecutionStatus, message: String, now: DateTime<Utc>) {
        self.status = status;
        self.message = message;
        self.last_updated_at = now;
    }
}

/// Sink for the terminal write a background unit must always produce.
pub trait TerminalSink: Send + Sync {
    /// Move the record to `Failed`. Returns `false` when it was already terminal or unknown.
    fn fail(&self, id: &str, reason: &str) -> bool;
}

/// Concurrency-safe keyed store enforcing monotonic status transitions.
#[derive(Debug)]
pub struct Tracker<R: TrackedRecord> {
    records: RwLock<IndexMap<String, R>>,
}

pub type DeploymentTracker = Tracker<DeploymentStatus>;
pub type OperationTracker = Tracker<OperationResult>;

impl<R: TrackedRecord> Default for Tracker<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
        }
    }
}

impl<R: TrackedRecord> Tracker<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record; visible to readers once this returns.
    pub fn insert(&self, record: R) {
        let id = record.id().to_owned();
        debug!(kind = %R::KIND, record_id = %id, status = %record.status(), "tracking record created");
        self.records.write().insert(id, record);
    }

    pub fn get(&self, id: &str) -> Result<R> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::not_found(R::KIND, id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn transition(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: impl Into<String>,
    ) -> Result<R> {
        self.transition_with(id, status, message, |_| {})
    }

    /// Advance a record and apply `update` under the same write lock.
    pub fn transition_with<F>(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: impl Into<String>,
        update: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut R),
    {
        let mut guard = self.records.write();
        let record = guard
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::not_found(R::KIND, id))?;
        let from = record.status();
        if !from.can_transition_to(status) {
            return Err(OrchestrationError::InvalidTransition {
                id: id.to_owned(),
                from,
                to: status,
            });
        }
        let message = message.into();
        info!(kind = %R::KIND, record_id = %id, from = %from, status = %status, detail = %message, "tracking record updated");
        record.set_progress(status, message, Utc::now());
        update(record);
        Ok(record.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl<R: TrackedRecord> TerminalSink for Tracker<R> {
    fn fail(&self, id: &str, reason: &str) -> bool {
        let mut guard = self.records.write();
        let Some(record) = guard.get_mut(id) else {
            return false;
        };
        if record.status().is_terminal() {
            return false;
        }
        let message = format!("{}: {}", R::FAILURE_PREFIX, reason);
        error!(kind = %R::KIND, record_id = %id, from = %record.status(), error = %reason, "tracking record failed");
        record.set_progress(ExecutionStatus::Failed, message, Utc::now());
        true
    }
}
