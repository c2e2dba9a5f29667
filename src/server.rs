//! HTTP server.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Result, TurnstileError};

/// HTTP server hosting a gated router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Fully assembled router
    router: Router,
}

impl HttpServer {
    /// Create a new server for `router`.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Bind and serve until `signal` resolves.
    ///
    /// Connections carry their peer address so the admission gate can
    /// identify callers.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(addr = %self.addr, "HTTP server listening");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let server = HttpServer::new(addr, router);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_with_shutdown(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_bind_failure_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap();

        let server = HttpServer::new(taken, Router::new());
        let result = server.serve_with_shutdown(std::future::ready(())).await;
        assert!(matches!(result, Err(TurnstileError::Io(_))));
    }
}
