//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::deployment::{
    Deployment, DeploymentId, DeploymentRequest, DeploymentState, DeploymentStatus, ListFilter,
    Provider,
};
use crate::models::log_event::LogEvent;
use crate::server::state::ServerState;
use crate::utils::version_info;

const LAST_EVENT_ID: &str = "last-event-id";

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Identifier of a newly created deployment
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: DeploymentId,
}

pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let id = state.engine.submit_deployment(request).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// List query parameters
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub project: Option<String>,
    pub provider: Option<String>,
    pub state: Option<String>,
}

impl TryFrom<ListQuery> for ListFilter {
    type Error = EngineError;

    fn try_from(query: ListQuery) -> Result<Self, Self::Error> {
        let provider = query
            .provider
            .map(|p| p.parse::<Provider>())
            .transpose()
            .map_err(EngineError::ValidationError)?;
        let state = query
            .state
            .map(|s| s.parse::<DeploymentState>())
            .transpose()
            .map_err(EngineError::ValidationError)?;
        Ok(ListFilter {
            project: query.project,
            provider,
            state,
            non_terminal_only: false,
        })
    }
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Deployment>>, EngineError> {
    let filter = ListFilter::try_from(query)?;
    Ok(Json(state.engine.list_deployments(&filter).await?))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, EngineError> {
    let id = DeploymentId::from(id);
    Ok(Json(state.engine.get_deployment(&id).await?))
}

pub async fn get_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentStatus>, EngineError> {
    let id = DeploymentId::from(id);
    Ok(Json(state.engine.get_status(&id).await?))
}

pub async fn transcript_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogEvent>>, EngineError> {
    let id = DeploymentId::from(id);
    Ok(Json(state.engine.transcript(&id).await?))
}

/// Stream query parameters
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub from: Option<u64>,
}

/// Server-Sent Events feed of a deployment's log. A reconnecting client's
/// `Last-Event-ID` takes precedence over `from`.
pub async fn stream_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let id = DeploymentId::from(id);
    let from = resume_sequence(&headers).or(query.from).unwrap_or(0);
    let subscription = state.engine.stream_logs(&id, from).await?;

    let stream = subscription.into_stream().map(|item| -> Result<Event, Infallible> {
        Ok(match item {
            Ok(event) => log_event(&event),
            Err(EngineError::SubscriberLagged { next_sequence }) => Event::default()
                .event("lagged")
                .data(next_sequence.to_string()),
            Err(e) => Event::default().event("error").data(e.to_string()),
        })
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn log_event(event: &LogEvent) -> Event {
    let sse = Event::default()
        .id(event.sequence.to_string())
        .event(if event.is_terminal() { "finished" } else { "log" });
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(_) => sse.data(event.text.clone()),
    }
}

fn resume_sequence(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|last_seen| last_seen + 1)
}

pub async fn cancel_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentStatus>, EngineError> {
    let id = DeploymentId::from(id);
    let deployment = state.engine.cancel_deployment(&id).await?;
    Ok(Json(deployment.status()))
}

pub async fn retry_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let id = DeploymentId::from(id);
    let retry = state.engine.retry_deployment(&id).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: retry })))
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, EngineError> {
    let id = DeploymentId::from(id);
    state.engine.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
