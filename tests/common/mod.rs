//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use stream_gateway::config::{GatewayConfig, RouteConfig};
use stream_gateway::http::message::ResponseHead;
use stream_gateway::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerOpen};
use stream_gateway::routing::PassThroughRouting;
use stream_gateway::HttpServer;

/// Read until the end of a request head; request bodies are ignored.
async fn read_head(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    buf
}

/// Start a backend that answers every request with a chunked 200 made of
/// `chunks`, pausing between them so they arrive as separate frames.
pub async fn start_chunked_backend(chunks: &'static [&'static str]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                if head.is_empty() {
                    return;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
                    .await;
                for chunk in chunks {
                    let frame = format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
                    let _ = socket.write_all(frame.as_bytes()).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let _ = socket.write_all(b"0\r\n\r\n").await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a backend that accepts connections and reads requests but never
/// answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_head(&mut socket).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(socket);
            });
        }
    });
    addr
}

/// Route `/proxy/{id}` to `/backend/{id}` on `backend`.
pub fn proxy_route(name: &str, backend: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        host: None,
        path: "/proxy/{id}".into(),
        methods: vec![],
        downstream: format!("http://{backend}"),
        downstream_path: "/backend/{id}".into(),
        disable_breaker: false,
    }
}

/// A running gateway bound to an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: broadcast::Sender<()>,
    pub config_updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve `routing` with `config` until the returned handle's shutdown fires.
pub async fn start_gateway(config: GatewayConfig, routing: PassThroughRouting) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::with_routing(config, routing).unwrap();

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let (config_updates, updates_rx) = mpsc::unbounded_channel();
    tokio::spawn(server.run(listener, updates_rx, shutdown_rx));

    TestGateway {
        addr,
        shutdown,
        config_updates,
    }
}

/// Breaker that counts outcomes and can be forced open.
#[derive(Debug, Default)]
pub struct CountingBreaker {
    pub open: std::sync::atomic::AtomicBool,
    pub permissions: AtomicU32,
    pub successes: AtomicU32,
    pub failures: AtomicU32,
}

impl CountingBreaker {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        (
            self.permissions.load(Ordering::SeqCst),
            self.successes.load(Ordering::SeqCst),
            self.failures.load(Ordering::SeqCst),
        )
    }
}

impl CircuitBreaker for CountingBreaker {
    fn check_permission(&self) -> Result<(), CircuitBreakerOpen> {
        self.permissions.fetch_add(1, Ordering::SeqCst);
        if self.open.load(Ordering::SeqCst) {
            return Err(CircuitBreakerOpen { name: "counting".into() });
        }
        Ok(())
    }

    fn record_success(&self, _response: &ResponseHead) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, _error: &(dyn std::error::Error + Send + Sync)) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `check` until it holds or a second elapses.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
