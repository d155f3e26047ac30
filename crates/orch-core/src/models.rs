//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Resource, deployment, and operation data model."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestrationError, Result};

pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_STOPPED: &str = "Stopped";

/// Lifecycle state shared by deployment and operation tracking records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::InProgress => "InProgress",
            ExecutionStatus::Succeeded => "Succeeded",
            ExecutionStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::InProgress => 1,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed => 2,
        }
    }

    /// Whether `next` lies strictly further along Pending -> InProgress -> terminal.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned unit of infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub region: String,
    pub status: String,
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Request to provision a new resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub resource_type: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub tags: IndexMap<String, String>,
}

impl DeploymentRequest {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Reject requests missing any of the required fields.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("resourceType", &self.resource_type),
            ("name", &self.name),
            ("region", &self.region),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestrationError::invalid(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Handle returned immediately when a deployment is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle record of a single deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub deployment_id: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl DeploymentStatus {
    pub fn pending(deployment_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status: ExecutionStatus::Pending,
            message: "Deployment queued".to_owned(),
            resource_id: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn to_result(&self) -> DeploymentResult {
        DeploymentResult {
            deployment_id: self.deployment_id.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Request to act on an existing resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub resource_id: String,
    pub operation_type: String,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
}

impl OperationRequest {
    pub fn new(resource_id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            operation_type: operation_type.into(),
            parameters: IndexMap::new(),
        }
    }
}

/// Lifecycle record of a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: String,
    pub resource_id: String,
    pub operation_type: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl OperationResult {
    pub fn pending(
        operation_id: impl Into<String>,
        request: &OperationRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            resource_id: request.resource_id.clone(),
            operation_type: request.operation_type.clone(),
            status: ExecutionStatus::Pending,
            message: "Operation queued".to_owned(),
            created_at: now,
            last_updated_at: now,
        }
    }
}

/// Supported resource actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
    Delete,
}

impl OperationKind {
    /// Case-insensitive parse; `None` for unsupported operation types.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "start" => Some(OperationKind::Start),
            "stop" => Some(OperationKind::Stop),
            "restart" => Some(OperationKind::Restart),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Delete => "delete",
        }
    }

    /// Resource status after the action, or `None` when the resource is removed.
    pub fn resulting_status(&self) -> Option<&'static str> {
        match self {
            OperationKind::Start | OperationKind::Restart => Some(STATUS_RUNNING),
            OperationKind::Stop => Some(STATUS_STOPPED),
            OperationKind::Delete => None,
        }
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            OperationKind::Start => "Resource started successfully",
            OperationKind::Stop => "Resource stopped successfully",
            OperationKind::Restart => "Resource restarted successfully",
            OperationKind::Delete => "Resource deleted successfully",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of the resource a backend is asked to provision.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub name: String,
    pub resource_type: String,
    pub region: String,
    pub parameters: IndexMap<String, Value>,
    pub tags: IndexMap<String, String>,
}

impl From<&DeploymentRequest> for ResourceSpec {
    fn from(request: &DeploymentRequest) -> Self {
        Self {
            name: request.name.clone(),
            resource_type: request.resource_type.clone(),
            region: request.region.clone(),
            parameters: request.parameters.clone(),
            tags: request.tags.clone(),
        }
    }
}

/// What a backend reports after provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle {
    pub resource_id: String,
    pub status: String,
    pub properties: IndexMap<String, Value>,
}

/// What a backend reports after performing a resource action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub detail: String,
}

/// Filter and page selection for resource listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuery {
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_number")]
    pub page_number: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_page_number() -> u32 {
    1
}

impl Default for ResourceQuery {
    fn default() -> Self {
        Self {
            resource_type: None,
            region: None,
            status: None,
            page_size: DEFAULT_PAGE_SIZE,
            page_number: 1,
        }
    }
}

impl ResourceQuery {
    pub fn page(page_size: u32, page_number: u32) -> Self {
        Self {
            page_size,
            page_number,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(OrchestrationError::invalid(format!(
                "Page size must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            )));
        }
        if self.page_number < 1 {
            return Err(OrchestrationError::invalid(
                "Page number must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Zero-based number of matches skipped before the page starts.
    pub fn skip(&self) -> usize {
        (self.page_number.saturating_sub(1) as usize).saturating_mul(self.page_size as usize)
    }

    /// Conjunctive, case-insensitive match; absent or empty filters match everything.
    pub fn matches(&self, resource: &Resource) -> bool {
        filter_matches(self.resource_type.as_deref(), &resource.resource_type)
            && filter_matches(self.region.as_deref(), &resource.region)
            && filter_matches(self.status.as_deref(), &resource.status)
    }
}

fn filter_matches(filter: Option<&str>, value: &str) -> bool {
    match filter {
        None => true,
        Some(filter) if filter.is_empty() => true,
        Some(filter) => filter.to_lowercase() == value.to_lowercase(),
    }
}
