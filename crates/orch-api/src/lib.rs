//! ---
//! orch_section: "04-external-interfaces"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "HTTP routes mapping the orchestration facade onto JSON."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use orch_core::{
    DeploymentRequest, DeploymentResult, DeploymentStatus, OperationRequest, OperationResult,
    OrchestrationError, OrchestrationService, ProviderSummary, Resource, ResourceQuery,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const RESOURCE_CACHE_CONTROL: &str = "private, max-age=60";

/// Shared API state exposed to handlers.
#[derive(Clone)]
pub struct ApiState {
    service: Arc<dyn OrchestrationService>,
}

impl ApiState {
    pub fn new(service: Arc<dyn OrchestrationService>) -> Self {
        Self { service }
    }
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState").finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Build the router without binding a listener.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/orchestrator/deployments", post(create_deployment))
        .route(
            "/api/orchestrator/deployments/:deployment_id",
            get(get_deployment_status),
        )
        .route("/api/orchestrator/resources", get(get_resources))
        .route("/api/orchestrator/operations", post(execute_operation))
        .route(
            "/api/orchestrator/operations/:operation_id",
            get(get_operation_status),
        )
        .route("/api/providers", get(list_providers))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the orchestrator API until shutdown.
pub fn spawn_api_server(state: ApiState, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        let status = match &err {
            OrchestrationError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            OrchestrationError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestrationError::Backend(_) => StatusCode::BAD_GATEWAY,
            OrchestrationError::AlreadyExists { .. }
            | OrchestrationError::InvalidTransition { .. } => StatusCode::CONFLICT,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %err, "request rejected");
        }
        let message = match err {
            OrchestrationError::InvalidArgument(message) => message,
            other => other.to_string(),
        };
        Self::new(status, message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn create_deployment(
    State(state): State<ApiState>,
    payload: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DeploymentResult>), ApiError> {
    let Json(request) = payload?;
    let result = state.service.create_deployment(request).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn get_deployment_status(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> Result<Json<DeploymentStatus>, ApiError> {
    Ok(Json(
        state.service.get_deployment_status(&deployment_id).await?,
    ))
}

/// Raw listing parameters; widened so out-of-range numbers reach validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceListParams {
    resource_type: Option<String>,
    region: Option<String>,
    status: Option<String>,
    page_size: Option<i64>,
    page_number: Option<i64>,
}

impl ResourceListParams {
    fn into_query(self) -> Result<ResourceQuery, ApiError> {
        let defaults = ResourceQuery::default();
        let page_size = narrow(
            self.page_size,
            defaults.page_size,
            "Page size must be between 1 and 100",
        )?;
        let page_number = narrow(
            self.page_number,
            defaults.page_number,
            "Page number must be greater than 0",
        )?;
        Ok(ResourceQuery {
            resource_type: self.resource_type,
            region: self.region,
            status: self.status,
            page_size,
            page_number,
        })
    }
}

fn narrow(value: Option<i64>, default: u32, message: &str) -> Result<u32, ApiError> {
    match value {
        None => Ok(default),
        Some(raw) => u32::try_from(raw).map_err(|_| ApiError::bad_request(message)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourcePage {
    page_size: u32,
    page_number: u32,
    resources: Vec<Resource>,
}

async fn get_resources(
    State(state): State<ApiState>,
    params: Result<Query<ResourceListParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let query = params.into_query()?;
    let resources = state.service.get_resources(&query).await?;
    let page = ResourcePage {
        page_size: query.page_size,
        page_number: query.page_number,
        resources,
    };
    Ok((
        [(
            header::CACHE_CONTROL,
            HeaderValue::from_static(RESOURCE_CACHE_CONTROL),
        )],
        Json(page),
    )
        .into_response())
}

async fn execute_operation(
    State(state): State<ApiState>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OperationResult>), ApiError> {
    let Json(request) = payload?;
    let result = state.service.execute_operation(request).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn get_operation_status(
    State(state): State<ApiState>,
    Path(operation_id): Path<String>,
) -> Result<Json<OperationResult>, ApiError> {
    Ok(Json(state.service.get_operation_status(&operation_id).await?))
}

async fn list_providers(State(state): State<ApiState>) -> Json<Vec<ProviderSummary>> {
    Json(state.service.providers())
}

async fn health(State(state): State<ApiState>) -> Response {
    let report = state.service.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}
