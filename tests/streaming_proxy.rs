//! End-to-end tests: reqwest client → gateway → raw TCP backend.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::StreamExt;
use stream_gateway::config::GatewayConfig;
use stream_gateway::routing::PassThroughRouting;

mod common;

use common::{eventually, proxy_route, start_chunked_backend, start_gateway, start_silent_backend, CountingBreaker};

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

#[tokio::test]
async fn chunked_response_is_streamed_through() {
    let backend = start_chunked_backend(&["c1", "c2", "c3"]).await;
    let mut config = GatewayConfig::default();
    config.routes.push(proxy_route("items", backend));

    let breaker = CountingBreaker::shared();
    let routing = PassThroughRouting::new(&config.routes)
        .unwrap()
        .with_custom_breaker("items", breaker.clone());
    let gateway = start_gateway(config, routing).await;

    let response = client().get(gateway.url("/proxy/42")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let mut stream = response.bytes_stream();
    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame.unwrap());
    }
    let body: Vec<u8> = frames.concat();
    assert_eq!(body, b"c1c2c3");

    assert!(eventually(|| breaker.counts() == (1, 1, 0)).await, "{:?}", breaker.counts());
    let _ = gateway.shutdown.send(());
}

#[tokio::test]
async fn silent_downstream_times_out_and_trips_breaker_accounting() {
    let backend = start_silent_backend().await;
    let mut config = GatewayConfig::default();
    config.timeouts.active_call_idle_ms = 500;
    config.routes.push(proxy_route("items", backend));

    let breaker = CountingBreaker::shared();
    let routing = PassThroughRouting::new(&config.routes)
        .unwrap()
        .with_custom_breaker("items", breaker.clone());
    let gateway = start_gateway(config, routing).await;

    let started = std::time::Instant::now();
    let response = client().get(gateway.url("/proxy/7")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() >= Duration::from_millis(450));
    assert!(response.headers().get("error_uid").is_some());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "DOWNSTREAM_TIMEOUT");

    assert!(eventually(|| breaker.counts() == (1, 0, 1)).await, "{:?}", breaker.counts());
    let _ = gateway.shutdown.send(());
}

#[tokio::test]
async fn open_breaker_rejects_without_contacting_downstream() {
    let backend = start_silent_backend().await;
    let mut config = GatewayConfig::default();
    config.routes.push(proxy_route("items", backend));

    let breaker = CountingBreaker::shared();
    breaker.open.store(true, Ordering::SeqCst);
    let routing = PassThroughRouting::new(&config.routes)
        .unwrap()
        .with_custom_breaker("items", breaker.clone());
    let gateway = start_gateway(config, routing).await;

    let response = client().get(gateway.url("/proxy/1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "CIRCUIT_OPEN");
    assert_eq!(breaker.counts(), (1, 0, 0));
    let _ = gateway.shutdown.send(());
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let config = GatewayConfig::default();
    let routing = PassThroughRouting::new(&config.routes).unwrap();
    let gateway = start_gateway(config, routing).await;

    let response = client().get(gateway.url("/nowhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "NO_ROUTE");
    let _ = gateway.shutdown.send(());
}

#[tokio::test]
async fn route_reload_takes_effect() {
    let backend = start_chunked_backend(&["reloaded"]).await;
    let config = GatewayConfig::default();
    let routing = PassThroughRouting::new(&config.routes).unwrap();
    let gateway = start_gateway(config, routing).await;

    let response = client().get(gateway.url("/proxy/1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut updated = GatewayConfig::default();
    updated.routes.push(proxy_route("items", backend));
    gateway.config_updates.send(updated).unwrap();

    let client = client();
    let mut status = StatusCode::NOT_FOUND;
    for _ in 0..50 {
        status = client.get(gateway.url("/proxy/1")).send().await.unwrap().status();
        if status == StatusCode::OK {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, StatusCode::OK);
    let _ = gateway.shutdown.send(());
}
