//! Discovery integration tests
//!
//! Candidate servers are local axum apps; mDNS is not used.

use std::time::Duration;

use axum::{Json, Router, routing::get};
use tokio::net::TcpListener;
use voice_terminal::Config;
use voice_terminal::discovery::{Discovery, EndpointSource, StaticEndpoints};

/// Serve `/health` on an ephemeral port, returning the port
async fn health_server(body: serde_json::Value) -> u16 {
    let app = Router::new().route(
        "/health",
        get(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config() -> Config {
    let mut config = Config::default();
    config.discovery.mdns = false;
    config.discovery.health_timeout_ms = 1000;
    config
}

#[tokio::test]
async fn test_best_server_is_online_and_fastest() {
    let healthy = health_server(serde_json::json!({
        "status": "healthy",
        "version": "2.1.0",
        "active_sessions": 1,
        "cpu_usage": 12.5,
    }))
    .await;
    let dead = closed_port().await;

    let statics = StaticEndpoints::parse(&[
        format!("127.0.0.1:8000:{dead}"),
        format!("127.0.0.1:8000:{healthy}"),
    ])
    .unwrap();
    let sources: Vec<Box<dyn EndpointSource>> = vec![Box::new(statics)];
    let (discovery, handle) = Discovery::new(&config(), sources).unwrap();
    let mut best_rx = handle.subscribe_best();

    let best = tokio::time::timeout(Duration::from_secs(10), discovery.refresh())
        .await
        .unwrap()
        .expect("an online server");

    assert_eq!(best.control_port, healthy);
    assert_eq!(handle.best().unwrap().control_port, healthy);
    assert!(best_rx.has_changed().unwrap());
    assert_eq!(
        best_rx.borrow_and_update().as_ref().map(|e| e.control_port),
        Some(healthy)
    );

    let ranked = handle.ranked().await;
    assert_eq!(ranked.len(), 2);
    let first = ranked[0].health.as_ref().unwrap();
    assert!(first.online);
    assert_eq!(first.status, "healthy");
    assert_eq!(first.version.as_deref(), Some("2.1.0"));
    assert_eq!(first.active_sessions, Some(1));
    assert!(!ranked[1].health.as_ref().unwrap().online);
}

#[tokio::test]
async fn test_repeated_refresh_keeps_best_stable() {
    let healthy = health_server(serde_json::json!({ "status": "ok" })).await;
    let statics = StaticEndpoints::parse(&[format!("127.0.0.1:8000:{healthy}")]).unwrap();
    let sources: Vec<Box<dyn EndpointSource>> = vec![Box::new(statics)];
    let (discovery, handle) = Discovery::new(&config(), sources).unwrap();
    let mut best_rx = handle.subscribe_best();

    discovery.refresh().await;
    let _ = best_rx.borrow_and_update();
    discovery.refresh().await;

    // Same server again: no change notification
    assert!(!best_rx.has_changed().unwrap());
    assert_eq!(handle.ranked().await.len(), 1);
}

#[tokio::test]
async fn test_no_sources_no_best() {
    let (discovery, handle) = Discovery::new(&config(), Vec::new()).unwrap();

    assert!(discovery.refresh().await.is_none());
    assert!(handle.best().is_none());
    assert!(handle.ranked().await.is_empty());
}
