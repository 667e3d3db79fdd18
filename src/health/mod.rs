//! Health and metrics HTTP surface.
//!
//! `GET /health` aggregates the registered component checks (200 when all
//! are up, 503 otherwise), `/health/live` answers while the process runs,
//! `/health/ready` gates on the checks, `/metrics` serves the Prometheus
//! text exposition, `/status` a JSON summary. Routes accept GET only;
//! other verbs get 405.

mod metrics;

pub use metrics::{
    ConsumerStatus, GatewaySnapshot, Histogram, Metrics, MSG_DEVICE_CONFIG, MSG_OBJECT_DEFINITION,
    MSG_OBJECT_DELETE, MSG_VALUE_UPDATE, PROCESSING_BUCKETS, READ_BUCKETS,
};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Component health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "DEGRADED")]
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    pub fn up() -> Self {
        Self {
            status: HealthStatus::Up,
            message: "OK".to_string(),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Down,
            message: message.into(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }
}

/// One registered component check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

/// Supplies the live gauges for `/metrics` and `/status`.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> GatewaySnapshot;
}

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<Metrics>,
    pub checks: Arc<Vec<Box<dyn HealthCheck>>>,
    pub source: Arc<dyn SnapshotSource>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_endpoint))
        .route("/status", get(status))
        .with_state(state)
}

async fn run_checks(state: &HealthState) -> (bool, BTreeMap<String, ComponentHealth>) {
    let mut components = BTreeMap::new();
    let mut all_up = true;
    for check in state.checks.iter() {
        let result = check.check().await;
        if result.status != HealthStatus::Up {
            all_up = false;
        }
        components.insert(check.name().to_string(), result);
    }
    (all_up, components)
}

async fn health(State(state): State<HealthState>) -> Response {
    let (all_up, components) = run_checks(&state).await;
    let body = json!({
        "status": if all_up { "UP" } else { "DOWN" },
        "components": components,
    });
    let code = if all_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn health_live() -> Json<serde_json::Value> {
    Json(json!({ "status": "UP" }))
}

async fn health_ready(State(state): State<HealthState>) -> Response {
    let (all_up, _) = run_checks(&state).await;
    if all_up {
        (StatusCode::OK, Json(json!({ "status": "UP" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "DOWN" })),
        )
            .into_response()
    }
}

async fn metrics_endpoint(State(state): State<HealthState>) -> Response {
    let snapshot = state.source.snapshot();
    let body = state.metrics.render(&snapshot);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn status(State(state): State<HealthState>) -> Json<GatewaySnapshot> {
    Json(state.source.snapshot())
}
