use std::convert::Infallible;

use atelier_relay_core::{
    generate_client_id, BroadcastRequest, BroadcastResponse, ConnectionInfo, ErrorBody, Frame,
    CONNECTIONS_PATH, REALTIME_PATH,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{hub::BroadcastHub, instruments};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Clone)]
pub struct RelayState {
    pub hub: BroadcastHub,
    pub metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(hub: BroadcastHub) -> Self {
        Self { hub, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(REALTIME_PATH, get(subscribe_handler).post(broadcast_handler))
        .route(CONNECTIONS_PATH, get(connections_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<RelayState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn subscribe_handler(
    State(state): State<RelayState>,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let client_id = non_blank(query.client_id).unwrap_or_else(generate_client_id);
    let user_id = non_blank(query.user_id);

    let registration = state.hub.registry().register(client_id, user_id);
    info!(
        target: "relay.routes",
        client_id = %registration.client_id,
        active_connections = registration.active_connections,
        replaced = registration.replaced,
        "push channel opened"
    );

    let stream = registration
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(frame_event(&frame)));

    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

fn frame_event(frame: &Frame) -> Event {
    match frame.to_json() {
        Ok(data) => Event::default().data(data),
        Err(err) => {
            warn!(target: "relay.routes", kind = frame.kind(), error = %err, "failed to encode frame");
            Event::default().comment("encode error")
        }
    }
}

async fn broadcast_handler(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let request: BroadcastRequest = serde_json::from_slice(&body).map_err(|err| {
        counter!(instruments::BROADCASTS_REJECTED_TOTAL, "reason" => "invalid_json").increment(1);
        ApiError::BadRequest(format!("invalid request body: {err}"))
    })?;
    let event = request.into_event().map_err(|err| {
        counter!(instruments::BROADCASTS_REJECTED_TOTAL, "reason" => "missing_field").increment(1);
        ApiError::BadRequest(err.to_string())
    })?;

    let hub = state.hub.clone();
    let change_event = event.clone();
    let outcome = tokio::spawn(async move { hub.publish(event).await })
        .await
        .map_err(|err| {
            warn!(target: "relay.routes", error = %err, "broadcast task failed");
            ApiError::Internal(format!("broadcast failed: {err}"))
        })?;

    Ok(Json(BroadcastResponse {
        success: true,
        broadcast_count: outcome.delivered,
        active_connections: outcome.active_connections,
        change_event,
    }))
}

async fn connections_handler(State(state): State<RelayState>) -> Json<ConnectionInfo> {
    Json(state.hub.connection_info())
}
