//! Inbound TLS configuration.
//!
//! TLS connections are served by `axum-server`, which runs its own accept
//! loop. [`BoundedAcceptor`] wraps the rustls acceptor so those connections
//! count against the same `max_connections` limit as plain ones.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsConfig;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::config::TlsConfig;
use crate::net::listener::BoundedStream;

/// Load the listener's certificate chain and private key (PEM).
pub async fn load_tls_config(config: &TlsConfig) -> Result<RustlsConfig, io::Error> {
    let cert_path = Path::new(&config.cert_path);
    let key_path = Path::new(&config.key_path);
    for (what, path) in [("Certificate", cert_path), ("Private key", key_path)] {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{what} file not found: {}", path.display()),
            ));
        }
    }
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Acceptor that holds a connection slot for the lifetime of each accepted
/// stream. Connections beyond the limit wait for a slot before the inner
/// acceptor (the TLS handshake) runs.
#[derive(Debug, Clone)]
pub struct BoundedAcceptor<A> {
    inner: A,
    connection_limit: Arc<Semaphore>,
}

impl<A> BoundedAcceptor<A> {
    pub fn new(inner: A, max_connections: usize) -> Self {
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Current free connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

impl<A, I, S> Accept<I, S> for BoundedAcceptor<A>
where
    A: Accept<I, S> + Clone + Send + Sync + 'static,
    A::Future: Send + 'static,
    I: Send + 'static,
    S: Send + 'static,
{
    type Stream = BoundedStream<A::Stream>;
    type Service = A::Service;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.clone();
        let connection_limit = Arc::clone(&self.connection_limit);
        Box::pin(async move {
            let permit = connection_limit
                .acquire_owned()
                .await
                .map_err(|_| io::Error::other("connection limit semaphore closed"))?;
            let (stream, service) = inner.accept(stream, service).await?;
            Ok((BoundedStream::new(stream, permit), service))
        })
    }
}
