//! 运维 HTTP 接口

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use hislink_admin::MetricsCollector;
use hislink_core::AggregateHealth;
use hislink_integration::ConnectorRegistry;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectorRegistry>,
    pub metrics: MetricsCollector,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_root))
        .route("/health", get(health_all))
        .route("/health/:org_id", get(health_org))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "HisLink connector service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "org_health": "/health/{org_id}",
            "stats": "/stats",
            "metrics": "/metrics"
        }
    }))
}

fn health_response(aggregate: AggregateHealth) -> Response {
    let status = if aggregate.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(aggregate)).into_response()
}

/// 全部连接器的健康状态，不健康时返回 503
async fn health_all(State(state): State<AppState>) -> Response {
    health_response(state.registry.health_check_all().await)
}

async fn health_org(State(state): State<AppState>, Path(org_id): Path<String>) -> Response {
    health_response(state.registry.health_check_org(&org_id).await)
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "stats": state.registry.get_stats(),
        "connectors": state.registry.list_connectors(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hislink_core::ConnectorConfig;
    use hislink_integration::DefaultConnectorFactory;
    use serde_json::Value;

    async fn spawn_app() -> (String, AppState) {
        let metrics = MetricsCollector::new().unwrap();
        let registry = ConnectorRegistry::new(Arc::new(DefaultConnectorFactory::default()))
            .with_metrics(metrics.clone());
        let state = AppState {
            registry: Arc::new(registry),
            metrics,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_health_without_connectors_is_unavailable() {
        let (base_url, _) = spawn_app().await;
        let response = reqwest::get(format!("{}/health", base_url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 503);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["healthy"], json!(false));
        assert_eq!(body["total_connectors"], json!(0));
    }

    #[tokio::test]
    async fn test_stats_and_org_health() {
        let (base_url, state) = spawn_app().await;
        let config = ConnectorConfig::new("h1", "hl7", "lab")
            .with_settings(json!({ "host": "127.0.0.1", "port": 2575 }))
            .disabled();
        state.registry.get_connector(&config).await.unwrap();

        let body: Value = reqwest::get(format!("{}/stats", base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["stats"]["total_connectors"], json!(1));
        assert_eq!(body["stats"]["by_org"]["h1"], json!(1));
        assert_eq!(body["connectors"][0]["key"], json!("h1:hl7:lab"));
        assert_eq!(body["connectors"][0]["status"], json!("disconnected"));

        let response = reqwest::get(format!("{}/health/h1", base_url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 503);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["unhealthy_connectors"], json!(1));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (base_url, _) = spawn_app().await;
        let response = reqwest::get(format!("{}/metrics", base_url)).await.unwrap();
        assert!(response.status().is_success());
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
