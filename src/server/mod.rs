//! Bridge server: the network-facing surface paired applications call.

mod auth;
mod routes;

pub use routes::{AppState, PairingRequestBody, SignRequestBody, router};

use std::net::SocketAddr;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ServerError;

/// Configuration for the bridge server.
#[derive(Debug, Clone)]
pub struct BridgeServerConfig {
    /// Address to bind. Loopback by default; the bridge is a local
    /// companion, not a public service.
    pub addr: SocketAddr,
}

/// The HTTP server hosting the paired-application API.
///
/// Bind, serve, and shut down gracefully; route handlers live in
/// [`routes`].
pub struct BridgeServer {
    config: BridgeServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl BridgeServer {
    pub fn new(config: BridgeServerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            handle: None,
            local_addr: None,
        }
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(&mut self, state: AppState) -> Result<(), ServerError> {
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ServerError::StartupFailed {
                reason: format!("failed to bind to {}: {}", self.config.addr, e),
            })?;
        self.local_addr = listener.local_addr().ok();

        tracing::info!(addr = ?self.local_addr, "bridge server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("bridge server shutting down");
                })
                .await
            {
                tracing::error!("bridge server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
