//! HTTP API: cluster snapshot, Prometheus exposition, probes and docs

use crate::middleware::{log_requests, require_bearer};
use axum::{
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA, X_CONTENT_TYPE_OPTIONS},
        StatusCode,
    },
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_lib::{
    health::{components, HealthRegistry, LivenessResponse},
    Aggregator, ClusterSnapshot, CollectError, MetricRegistry,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SWAGGER_YAML: &str = include_str!("../docs/swagger.yaml");

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8"/>
<title>K8s Metrics API Docs</title>
<link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css"/>
<style>.topbar{display:none}</style>
</head>
<body>
<div id="swagger-ui"></div>
<script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
<script>
window.onload = () => {
  window.ui = SwaggerUIBundle({url: '/swagger.yaml', dom_id: '#swagger-ui', deepLinking: true});
};
</script>
</body>
</html>
"#;

/// Shared application state
pub struct AppState {
    pub aggregator: Aggregator,
    pub registry: MetricRegistry,
    pub health_registry: HealthRegistry,
    pub auth_token: String,
    pub poll_budget: Duration,
    pub scrape_triggers_poll: bool,
}

impl AppState {
    pub fn new(
        aggregator: Aggregator,
        registry: MetricRegistry,
        health_registry: HealthRegistry,
        auth_token: impl Into<String>,
        poll_budget: Duration,
    ) -> Self {
        Self {
            aggregator,
            registry,
            health_registry,
            auth_token: auth_token.into(),
            poll_budget,
            scrape_triggers_poll: false,
        }
    }

    pub fn with_scrape_triggers_poll(mut self, enabled: bool) -> Self {
        self.scrape_triggers_poll = enabled;
        self
    }

    /// Run one poll and record its outcome on the cluster reader component
    pub async fn poll(&self) -> Result<ClusterSnapshot, CollectError> {
        let result = self.aggregator.collect(self.poll_budget).await;

        match &result {
            Ok(_) => {
                self.health_registry
                    .set_healthy(components::CLUSTER_READER)
                    .await
            }
            Err(err) => {
                self.health_registry
                    .set_degraded(components::CLUSTER_READER, err.to_string())
                    .await
            }
        }

        result
    }
}

/// Liveness: always 200
async fn healthz() -> impl IntoResponse {
    Json(LivenessResponse::ok())
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

fn plain_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        message,
    )
        .into_response()
}

/// Poll the cluster and return the snapshot as JSON
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match state.poll().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = %err, "Cluster poll failed");
            return plain_error(err.to_string());
        }
    };

    match snapshot.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to encode cluster snapshot");
            plain_error("failed to encode snapshot".to_string())
        }
    }
}

/// Prometheus text exposition of the resident gauges
async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Response {
    if state.scrape_triggers_poll {
        if let Err(err) = state.poll().await {
            warn!(error = %err, "Scrape-triggered poll failed, serving resident values");
        }
    }

    match state.registry.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to encode metrics");
            plain_error("failed to encode metrics".to_string())
        }
    }
}

async fn swagger() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "application/yaml; charset=utf-8"),
            (CACHE_CONTROL, NO_CACHE),
            (PRAGMA, "no-cache"),
            (X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        SWAGGER_YAML,
    )
}

async fn docs() -> impl IntoResponse {
    ([(CACHE_CONTROL, NO_CACHE)], Html(DOCS_HTML))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/metrics", get(snapshot))
        .route("/prometheus", get(prometheus_metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/swagger.yaml", get(swagger))
        .route("/docs", get(docs))
        .merge(protected)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Start the API server and run until `shutdown` resolves
pub async fn serve<F>(port: u16, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
