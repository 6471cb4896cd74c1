//! Status endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;
use voice_terminal::coordinator::{ConversationState, CoordinatorStats};
use voice_terminal::observability::{Diagnostics, DiagnosticsSource, TelemetrySnapshot, router};

/// Fixed diagnostics for a terminal mid-reply
struct Speaking;

impl DiagnosticsSource for Speaking {
    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            timestamp: 1_700_000_000_000,
            version: "test",
            state: ConversationState::Speaking,
            free_memory_kb: Some(2048),
            telemetry: TelemetrySnapshot {
                uptime_ms: 42_000,
                audio_level: 0.25,
                frames_captured: 2100,
                ..TelemetrySnapshot::default()
            },
            coordinator: CoordinatorStats {
                state: ConversationState::Speaking,
                connected: true,
                sessions_started: 3,
                ..CoordinatorStats::default()
            },
            ..Diagnostics::default()
        }
    }
}

async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
    let app = router(Arc::new(Speaking));
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or_default())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (status, json) = get_json("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_status_endpoint() {
    let (status, json) = get_json("/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "speaking");
    assert_eq!(json["connected"], true);
    assert_eq!(json["free_memory_kb"], 2048);
    assert_eq!(json["uptime_ms"], 42_000);
    assert!(json["wifi_rssi"].is_null());
    assert!((json["audio_level"].as_f64().unwrap() - 0.25).abs() < 1e-6);
}

#[tokio::test]
async fn test_diagnostics_endpoint() {
    let (status, json) = get_json("/diagnostics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "speaking");
    assert_eq!(json["coordinator"]["sessions_started"], 3);
    assert_eq!(json["telemetry"]["frames_captured"], 2100);
    assert!(json["datagram"].is_object());
    assert!(json["playback"].is_object());
}

#[tokio::test]
async fn test_unknown_route() {
    let (status, _) = get_json("/config").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
