//! Callback listener: the requester's `/response` endpoint
//!
//! Bound to an OS-assigned loopback port for the lifetime of the requester.
//! Every accepted response is handed to the correlation table; unknown or
//! already-resolved ids answer `404` so a late host can tell the ask expired.

use crate::correlation::{CorrelationTable, ResolveStatus};
use crate::protocol::{paths, AskResponse, LOOPBACK};
use crate::{BridgeError, Result};
use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Running callback endpoint owned by one requester
pub struct CallbackListener {
    port: u16,
    table: Arc<CorrelationTable>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn start(table: Arc<CorrelationTable>) -> Result<Self> {
        Self::bind(table, 0).await
    }

    /// Bind a specific port (`0` lets the OS choose).
    pub async fn bind(table: Arc<CorrelationTable>, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(LOOPBACK, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Bind(format!("{addr}: {e}")))?;
        let port = listener.local_addr()?.port();

        let app = router(table.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            debug!("Callback listener shutting down");
        });
        let server = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("Callback listener error: {}", e);
            }
        });

        info!("Callback listener on http://{}:{}", LOOPBACK, port);
        Ok(Self {
            port,
            table,
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving and release every pending wait.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        let dropped = self.table.clear();
        if dropped > 0 {
            warn!("Callback listener closed with {} pending waits", dropped);
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn router(table: Arc<CorrelationTable>) -> Router {
    Router::new()
        .route(paths::RESPONSE, post(handle_response))
        .with_state(table)
}

async fn handle_response(
    State(table): State<Arc<CorrelationTable>>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let response: AskResponse = match serde_json::from_slice(&body) {
        Ok(response) => response,
        Err(e) => {
            warn!("Rejected malformed response body: {}", e);
            return (StatusCode::BAD_REQUEST, "Error");
        }
    };

    match table.resolve(response) {
        ResolveStatus::Delivered => (StatusCode::OK, "OK"),
        ResolveStatus::NotFound => (StatusCode::NOT_FOUND, "Not Found"),
    }
}
