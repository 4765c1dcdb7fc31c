//! HTTP API handlers for MetricHub.
//!
//! Every route lives under `/api/v1`. Engine failures are rendered through
//! [`EngineError`]'s `IntoResponse` impl as
//! `{"error": {"code": ..., "message": ...}}`; malformed JSON bodies and query
//! strings are reported the same way as validation errors.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::engine::MetricsEngine;
use crate::error::{EngineError, Result};
use crate::fixtures::FixtureSpec;
use crate::model::{
    DeploymentCompletion, DoraReport, MetricKind, MetricResponse, MetricValue, NewDeployment,
    NewIncident, ResolveRequest, Scope, SystemState, TimeRange, WebhookEvent,
};

/// Window used when a request names neither `days` nor `start`/`end`.
pub const DEFAULT_WINDOW_DAYS: u32 = 30;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MetricsEngine>,
}

/// Build the full `/api/v1` router.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/health", get(health_check))
        .route("/metrics/dora", get(get_dora_metrics))
        .route(
            "/metrics/dora/deployment-frequency",
            get(get_deployment_frequency),
        )
        .route("/metrics/dora/lead-time", get(get_lead_time))
        .route("/metrics/dora/mttr", get(get_mttr))
        .route(
            "/metrics/dora/change-failure-rate",
            get(get_change_failure_rate),
        )
        .route("/deployments", post(create_deployment).get(list_deployments))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/complete", post(complete_deployment))
        .route("/incidents", post(create_incident).get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .route("/state", get(get_state))
        .route("/webhook/:plugin", post(handle_webhook))
        .route("/simulate", post(simulate));

    Router::new().nest("/api/v1", v1).with_state(state)
}

/// Query parameters shared by metric and listing endpoints.
///
/// Either `days` or both `start` and `end` (RFC 3339) select the window.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub days: Option<u32>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub environment: Option<String>,
}

impl WindowQuery {
    pub fn scope(&self) -> Scope {
        Scope {
            service: self.service.clone(),
            environment: self.environment.clone(),
        }
    }

    /// The window to compute metrics over; defaults to the last 30 days.
    pub fn range(&self, engine: &MetricsEngine) -> Result<TimeRange> {
        match self.explicit_range(engine)? {
            Some(range) => Ok(range),
            None => engine.rolling_range(DEFAULT_WINDOW_DAYS),
        }
    }

    /// The window a listing is restricted to, if the caller named one.
    pub fn explicit_range(&self, engine: &MetricsEngine) -> Result<Option<TimeRange>> {
        match (self.start, self.end, self.days) {
            (Some(start), Some(end), _) => TimeRange::new(start, end).map(Some),
            (Some(_), None, _) | (None, Some(_), _) => Err(EngineError::Validation(
                "start and end must be given together".to_string(),
            )),
            (None, None, Some(days)) => engine.rolling_range(days).map(Some),
            (None, None, None) => Ok(None),
        }
    }
}

fn query<T>(query: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    query
        .map(|Query(value)| value)
        .map_err(|e| EngineError::Validation(e.body_text()))
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| EngineError::Validation(e.body_text()))
}

/// GET /health - Liveness plus a storage check.
///
/// Returns `503 Service Unavailable` when the event log cannot be reached.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    match state.engine.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "version": version,
                "checks": { "storage": "ok" }
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Storage health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "version": version,
                    "checks": { "storage": "unavailable" }
                })),
            )
        }
    }
}

/// GET /metrics/dora - All four metrics with their classification.
///
/// # Query Parameters
///
/// - `days` (optional): Rolling window length, 1 to 365 (default: 30)
/// - `start`, `end` (optional): Explicit RFC 3339 window instead of `days`
/// - `service`, `environment` (optional): Restrict to matching partitions
///
/// # Response
///
/// ```json
/// {
///     "data": {
///         "time_range": { "start": "...", "end": "..." },
///         "deployment_frequency": 1.2,
///         "lead_time": "2h 30m",
///         "mttr": "45m",
///         "change_failure_rate": 0.1,
///         "deployments_count": 36,
///         "classification": { "overall": "high", ... }
///     },
///     "metadata": { "data_quality": "high", ... }
/// }
/// ```
#[instrument(skip(state, params))]
pub async fn get_dora_metrics(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricResponse<DoraReport>>> {
    let params = query(params)?;
    let range = params.range(&state.engine)?;
    let report = state.engine.report(range, &params.scope());

    info!(
        deployments = report.data.window.summary.samples.deployments_count,
        incidents = report.data.window.summary.samples.incidents_count,
        overall = ?report.data.classification.overall,
        "DORA metrics queried"
    );
    Ok(Json(report))
}

async fn single_metric(
    state: AppState,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
    kind: MetricKind,
) -> Result<Json<MetricResponse<MetricValue>>> {
    let params = query(params)?;
    let range = params.range(&state.engine)?;
    let response = state.engine.metric(kind, range, &params.scope());
    info!(metric = ?kind, tier = ?response.data.tier, "Metric queried");
    Ok(Json(response))
}

/// GET /metrics/dora/deployment-frequency
#[instrument(skip(state, params))]
pub async fn get_deployment_frequency(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricResponse<MetricValue>>> {
    single_metric(state, params, MetricKind::DeploymentFrequency).await
}

/// GET /metrics/dora/lead-time
#[instrument(skip(state, params))]
pub async fn get_lead_time(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricResponse<MetricValue>>> {
    single_metric(state, params, MetricKind::LeadTime).await
}

/// GET /metrics/dora/mttr
#[instrument(skip(state, params))]
pub async fn get_mttr(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricResponse<MetricValue>>> {
    single_metric(state, params, MetricKind::Mttr).await
}

/// GET /metrics/dora/change-failure-rate
#[instrument(skip(state, params))]
pub async fn get_change_failure_rate(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricResponse<MetricValue>>> {
    single_metric(state, params, MetricKind::ChangeFailureRate).await
}

/// POST /deployments - Record a deployment.
///
/// # Request Body
///
/// ```json
/// {
///     "id": "deploy-123",
///     "service": "api",
///     "environment": "production",
///     "status": "success",
///     "start_time": "2025-01-15T10:00:00Z",
///     "commit_time": "2025-01-15T08:00:00Z"
/// }
/// ```
///
/// `id`, `status` and `start_time` are optional.
///
/// # Response
///
/// Returns `201 Created` with `{"data": {"deployment": ...}}`.
#[instrument(skip(state, payload))]
pub async fn create_deployment(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewDeployment>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let deployment = state.engine.ingest_deployment(body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "deployment": deployment } })),
    ))
}

/// GET /deployments - Deployments sorted by start time.
///
/// Covers everything unless `days` or `start`/`end` is given.
#[instrument(skip(state, params))]
pub async fn list_deployments(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<impl IntoResponse> {
    let params = query(params)?;
    let range = params.explicit_range(&state.engine)?;
    let deployments = state.engine.deployments(range.as_ref(), &params.scope());
    let count = deployments.len();
    Ok(Json(json!({ "deployments": deployments, "count": count })))
}

/// GET /deployments/:id
#[instrument(skip(state))]
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let deployment = state.engine.deployment(&id)?;
    Ok(Json(json!({ "data": { "deployment": deployment } })))
}

/// POST /deployments/:id/complete - Finish an in-progress deployment.
///
/// Body: `{"status": "success" | "failed" | "rolled_back", "end_time"?: ...}`.
#[instrument(skip(state, payload))]
pub async fn complete_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<DeploymentCompletion>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let deployment = state
        .engine
        .complete_deployment(&id, body(payload)?)
        .await?;
    Ok(Json(json!({ "data": { "deployment": deployment } })))
}

/// POST /incidents - Record an incident.
///
/// Returns `201 Created` with `{"data": {"incident": ...}}`.
#[instrument(skip(state, payload))]
pub async fn create_incident(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewIncident>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let incident = state.engine.ingest_incident(body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "incident": incident } })),
    ))
}

/// GET /incidents - Incidents sorted by start time.
#[instrument(skip(state, params))]
pub async fn list_incidents(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<impl IntoResponse> {
    let params = query(params)?;
    let range = params.explicit_range(&state.engine)?;
    let incidents = state.engine.incidents(range.as_ref(), &params.scope());
    let count = incidents.len();
    Ok(Json(json!({ "incidents": incidents, "count": count })))
}

/// GET /incidents/:id - An incident and its lifecycle state.
#[instrument(skip(state))]
pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let incident = state.engine.incident(&id)?;
    let lifecycle = state.engine.incident_state(&id)?;
    Ok(Json(
        json!({ "data": { "incident": incident, "lifecycle": lifecycle } }),
    ))
}

/// POST /incidents/:id/resolve - Resolve an open incident.
///
/// The body is optional: `{"resolved_time": "..."}`. Without it the
/// incident is resolved at the current time.
#[instrument(skip(state, payload))]
pub async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Bytes,
) -> Result<impl IntoResponse> {
    let request: ResolveRequest = if payload.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest::default()
    } else {
        serde_json::from_slice(&payload).map_err(|e| EngineError::Validation(e.to_string()))?
    };

    let incident = match state
        .engine
        .resolve_incident(&id, request.resolved_time)
        .await
    {
        Ok(incident) => incident,
        Err(e) => {
            warn!(id = %id, error = %e, "Failed to resolve incident");
            return Err(e);
        }
    };
    let lifecycle = state.engine.incident_state(&id)?;

    Ok(Json(
        json!({ "data": { "incident": incident, "lifecycle": lifecycle } }),
    ))
}

/// GET /state - Every deployment and incident in scope.
#[instrument(skip(state, params))]
pub async fn get_state(
    State(state): State<AppState>,
    params: std::result::Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<SystemState>> {
    let params = query(params)?;
    let range = params.explicit_range(&state.engine)?;
    Ok(Json(state.engine.snapshot(range.as_ref(), &params.scope())))
}

/// POST /webhook/:plugin - Canonical event envelope from a plugin.
///
/// # Request Body
///
/// ```json
/// {
///     "event_type": "deployment" | "deployment_completed" | "incident" | "incident_resolved",
///     "data": { ... }
/// }
/// ```
///
/// Returns `202 Accepted` once the event is durably recorded.
#[instrument(skip(state, payload))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(plugin): Path<String>,
    payload: std::result::Result<Json<WebhookEvent>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let event = match body(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(plugin = %plugin, error = %e, "Rejected webhook payload");
            return Err(e);
        }
    };

    let (event_type, id) = match event {
        WebhookEvent::Deployment(new) => {
            ("deployment", state.engine.ingest_deployment(new).await?.id)
        }
        WebhookEvent::DeploymentCompleted {
            id,
            status,
            end_time,
        } => {
            let completion = DeploymentCompletion { status, end_time };
            let deployment = state.engine.complete_deployment(&id, completion).await?;
            ("deployment_completed", deployment.id)
        }
        WebhookEvent::Incident(new) => ("incident", state.engine.ingest_incident(new).await?.id),
        WebhookEvent::IncidentResolved { id, resolved_time } => {
            let incident = state.engine.resolve_incident(&id, resolved_time).await?;
            ("incident_resolved", incident.id)
        }
    };

    info!(plugin = %plugin, event_type, id = %id, "Webhook processed");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": { "plugin": plugin, "event_type": event_type, "id": id }
        })),
    ))
}

/// POST /simulate - Ingest a deterministic synthetic history.
///
/// Body: `{"seed": 42, "days"?: 30, "services"?: ["api", "web"], "max_deployments_per_day"?: 3}`.
#[instrument(skip(state, payload))]
pub async fn simulate(
    State(state): State<AppState>,
    payload: std::result::Result<Json<FixtureSpec>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let summary = state.engine.simulate(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": summary }))))
}
