//! Server lifecycle: owns the listening socket and its start/stop semantics.
//!
//! A `Server` moves Stopped → Running on `start()` and back on `stop()`.
//! `start()` fails with `Bind` when the endpoint is already in use and
//! with `AlreadyRunning` when called twice. `stop()` stops accepting new
//! connections, lets in-flight requests drain, releases the endpoint, and
//! is a no-op on an already-stopped server. The same value can be started
//! again after a stop.

use axum::Router;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind `{addr}`: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Server {
    router: Router,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(router: Router) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            router,
            shutdown,
            handle: None,
            local_addr: None,
        }
    }

    /// Bind `addr` and begin accepting connections on a background task.
    ///
    /// Returns the bound address, which differs from `addr` when port 0
    /// was requested.
    pub async fn start(&mut self, addr: &str) -> Result<SocketAddr, ServerError> {
        if self.handle.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        // Fresh channel per start so a stopped server can be started again.
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown = shutdown_tx;

        let app = self.router.clone();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                // Resolves on stop() or when the Server value is dropped.
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("server error: {}", err);
            }
        });

        self.handle = Some(handle);
        self.local_addr = Some(local_addr);
        info!("server listening on http://{}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests to
    /// drain. Calling this on an already-stopped server does nothing.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(err) = handle.await {
            error!("server task failed during shutdown: {}", err);
        }
        self.local_addr = None;
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
