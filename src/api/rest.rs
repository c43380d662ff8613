// =============================================================================
// HTTP Router — Axum 0.7
// =============================================================================
//
// Health endpoints plus the two WebSocket subscription routes. Timezones are
// IANA names that contain `/`, hence the wildcard segment.
//
// CORS is configured permissively; chart clients are served from other
// origins.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::ws;
use crate::app_state::AppState;
use crate::streaming::ConnectionMetrics;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/health/websocket", get(websocket_health))
        // ── Live subscriptions ──────────────────────────────────────
        .route("/ws/live/:symbol/:interval/*timezone", get(ws::live_bars))
        .route("/ws-ha/live/:symbol/:interval/*timezone", get(ws::live_heikin_ashi))
        // ── Middleware & State ──────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.uptime_secs(),
    })
}

#[derive(Serialize)]
struct WebSocketHealthResponse {
    status: &'static str,
    metrics: ConnectionMetrics,
}

async fn websocket_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(WebSocketHealthResponse {
        status: "healthy",
        metrics: state.manager.metrics(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::runtime_config::ServerConfig;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn websocket_health_reports_metrics() {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        let (status, body) = get_json(router(state), "/health/websocket").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["active_groups"], 0);
        assert_eq!(body["metrics"]["active_connections"], 0);
        assert_eq!(body["metrics"]["live_connections"], 0);
    }

    #[tokio::test]
    async fn liveness_endpoint_responds() {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        let (status, body) = get_json(router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["server_time"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn plain_get_on_subscribe_route_is_not_upgraded() {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/ws/live/ESU5/1m/America/New_York")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
