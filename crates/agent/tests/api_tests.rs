//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use power_agent::api::{create_router, AppState};
use power_agent_lib::{
    collector::StaticMetricsSource,
    health::{components, HealthRegistry},
    observability::ControllerMetrics,
    Controller, MetricsSnapshot, OptimizerConfig,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let controller = Controller::builder(
        OptimizerConfig::default(),
        Arc::new(StaticMetricsSource::new(MetricsSnapshot::degraded(0))),
    )
    .health(health_registry.clone())
    .build();

    let state = Arc::new(AppState::new(health_registry, Arc::new(controller)));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["monitor"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_degraded(components::MONITOR, "battery not readable")
        .await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["monitor"]["message"],
        "battery not readable"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_unhealthy(components::EXECUTOR, "no backends")
        .await;

    let (status, _) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_returns_503_until_controller_runs() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let metrics = ControllerMetrics::new();
    metrics.observe_decision_latency(0.002);
    metrics.record_apply(2, 0);
    metrics.set_classifier_version("untrained");

    let (status, body) = get(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("power_agent_decision_latency_seconds_bucket"));
    assert!(text.contains("power_agent_actions_applied_total"));
    assert!(text.contains("power_agent_classifier_version_info"));
}

#[tokio::test]
async fn test_state_endpoint_reports_controller_view() {
    let (app, state) = setup_test_app().await;
    state.controller.pause_optimization();

    let (status, body) = get(app, "/state").await;

    assert_eq!(status, StatusCode::OK);
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(view["optimization_mode"], "balanced");
    assert_eq!(view["running"], false);
    assert_eq!(view["paused"], true);
    assert_eq!(view["active_optimizations"], 0);
    assert_eq!(view["user_satisfaction"], 0.8);
}
