//! Ask dispatcher: the UI host's `/ask` endpoint
//!
//! Binds the configured base port, stepping up by one on conflict a bounded
//! number of times. Accepted asks are handed to the presenter and remembered
//! in the undelivered slot; if presentation fails the dispatcher cancels the
//! ask on the requester's behalf before answering `500`.

use super::presenter::Presenter;
use super::reply::ReplySender;
use super::session::{DialogSession, TerminalFlag};
use super::slot::{PendingSlot, SlotLookup};
use crate::config::BridgeConfig;
use crate::discovery::PortStore;
use crate::process::ProcessControl;
use crate::protocol::{
    paths, AskAck, AskParseError, AskRequest, AskResponse, ErrorBody, PortRecord, LOOPBACK,
};
use crate::sweeper::Sweeper;
use crate::{BridgeError, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Whether the ask endpoint is listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running { port: u16 },
    /// Not listening; `port` is the last port tried
    Stopped { port: u16 },
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running { .. })
    }

    pub fn port(&self) -> u16 {
        match self {
            ServiceState::Running { port } | ServiceState::Stopped { port } => *port,
        }
    }
}

/// Result of asking to show the last undelivered request again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReopenOutcome {
    Reopened { request_id: String },
    /// Held request was older than the re-open window and was dropped
    Expired,
    NoPending,
    PresentFailed(String),
}

/// State shared with the HTTP handlers
#[derive(Clone)]
struct HostShared {
    presenter: Arc<dyn Presenter>,
    slot: Arc<PendingSlot>,
    reply: ReplySender,
    default_callback_port: u16,
    presented: Arc<AtomicU64>,
}

impl HostShared {
    fn session(&self, request: AskRequest, flag: TerminalFlag) -> DialogSession {
        let reply_port = request.callback_port.unwrap_or(self.default_callback_port);
        self.slot.store(request.clone(), flag.clone());
        DialogSession::new(
            request,
            reply_port,
            flag,
            self.reply.clone(),
            self.slot.clone(),
        )
    }

    /// Present a new ask. On failure the requester is sent a cancellation.
    async fn present_new(&self, request: AskRequest) -> anyhow::Result<()> {
        let flag = TerminalFlag::new();
        let session = self.session(request.clone(), flag.clone());
        let reply_port = session.reply_port();

        if let Err(e) = self.presenter.present(session) {
            error!("Failed to present {}: {:#}", request.request_id, e);
            self.slot.clear_if(&request.request_id);
            if flag.claim() {
                let cancellation = AskResponse::cancelled(request.request_id.as_str());
                if let Err(send_err) = self.reply.send(reply_port, &cancellation).await {
                    warn!(
                        "Could not cancel {} on port {}: {}",
                        request.request_id, reply_port, send_err
                    );
                }
            }
            return Err(e);
        }

        self.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct RunningServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// The UI host's ask endpoint and its lifecycle
pub struct AskDispatcher {
    config: BridgeConfig,
    store: PortStore,
    shared: HostShared,
    state: ServiceState,
    server: Option<RunningServer>,
    pid: u32,
}

impl AskDispatcher {
    pub fn new(config: BridgeConfig, presenter: Arc<dyn Presenter>) -> Self {
        let store = PortStore::new(config.discovery_dir.clone());
        let shared = HostShared {
            presenter,
            slot: Arc::new(PendingSlot::default()),
            reply: ReplySender::new(config.reply_timeout),
            default_callback_port: config.default_callback_port,
            presented: Arc::new(AtomicU64::new(0)),
        };
        let state = ServiceState::Stopped {
            port: config.host_port,
        };
        Self {
            config,
            store,
            shared,
            state,
            server: None,
            pid: std::process::id(),
        }
    }

    /// Publish the discovery record under `pid` instead of this process,
    /// for a host run on behalf of another process (e.g. a launcher's child).
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn status(&self) -> ServiceState {
        self.state
    }

    /// Number of asks successfully presented since creation.
    pub fn presented_count(&self) -> u64 {
        self.shared.presented.load(Ordering::Relaxed)
    }

    /// The ask currently held for re-open, if any.
    pub fn pending_request(&self) -> Option<AskRequest> {
        self.shared.slot.current()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start on the configured base port. Returns the bound port.
    pub async fn start(&mut self) -> Result<u16> {
        let base = self.config.host_port;
        self.start_on(base).await
    }

    /// Start on `base`, trying `base + 1 ..= base + max_port_retries` on conflict.
    ///
    /// Failure leaves the dispatcher `Stopped`; it is never fatal to the host.
    pub async fn start_on(&mut self, base: u16) -> Result<u16> {
        if self.server.is_some() {
            self.stop().await;
        }

        let listener = match self.bind_with_retry(base).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = ServiceState::Stopped {
                    port: base.saturating_add(self.config.max_port_retries),
                };
                warn!("Ask service not started: {}", e);
                return Err(e);
            }
        };
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, router(self.shared.clone())).with_graceful_shutdown(
            async move {
                let _ = shutdown_rx.await;
                debug!("Ask service shutting down");
            },
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("Ask service error: {}", e);
            }
        });
        self.server = Some(RunningServer {
            shutdown_tx,
            handle,
        });
        self.state = ServiceState::Running { port };
        info!("Ask service listening on port {}", port);

        if let Err(e) = self.store.write(&PortRecord::new(port, self.pid)).await {
            warn!("Failed to write port file: {}", e);
        }
        Ok(port)
    }

    async fn bind_with_retry(&self, base: u16) -> Result<TcpListener> {
        let last = base.saturating_add(self.config.max_port_retries);
        let mut port = base;
        loop {
            let addr = SocketAddr::new(LOOPBACK, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse && port < last => {
                    warn!("Port {} in use, trying {}...", port, port + 1);
                    tokio::time::sleep(self.config.port_retry_delay).await;
                    port += 1;
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    return Err(BridgeError::PortConflict { first: base, last });
                }
                Err(e) => return Err(BridgeError::Bind(format!("{addr}: {e}"))),
            }
        }
    }

    /// Stop listening and remove this process's discovery record.
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            let _ = server.shutdown_tx.send(());
            let _ = server.handle.await;
        }
        if let Err(e) = self.store.remove(self.pid).await {
            warn!("Failed to remove port file: {}", e);
        }
        self.state = ServiceState::Stopped {
            port: self.state.port(),
        };
    }

    /// Stop, sweep stale processes, wait for ports to settle, start again.
    pub async fn restart<P: ProcessControl>(&mut self, sweeper: &Sweeper<P>) -> Result<u16> {
        info!("Restarting ask service");
        self.stop().await;
        sweeper.run().await;
        tokio::time::sleep(self.config.restart_settle).await;
        self.start().await
    }

    /// Show the last undelivered ask again, unless it has gone stale.
    pub async fn reopen(&self) -> ReopenOutcome {
        match self.shared.slot.lookup(self.config.reopen_window) {
            SlotLookup::Empty => ReopenOutcome::NoPending,
            SlotLookup::Expired => ReopenOutcome::Expired,
            SlotLookup::Fresh { request, flag } => {
                let request_id = request.request_id.clone();
                let session = self.shared.session(request, flag);
                match self.shared.presenter.present(session) {
                    Ok(()) => {
                        info!("Reopened dialog for {}", request_id);
                        ReopenOutcome::Reopened { request_id }
                    }
                    Err(e) => ReopenOutcome::PresentFailed(format!("{e:#}")),
                }
            }
        }
    }
}

impl Drop for AskDispatcher {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            let _ = server.shutdown_tx.send(());
        }
    }
}

fn router(shared: HostShared) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(paths::ASK, post(handle_ask).options(handle_options))
        .with_state(shared)
        .layer(cors)
}

async fn handle_options() -> StatusCode {
    StatusCode::OK
}

fn error_response(status: StatusCode, error: &str, details: Option<String>) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        details,
    };
    (status, Json(body)).into_response()
}

async fn handle_ask(State(shared): State<HostShared>, body: Bytes) -> Response {
    let request = match AskRequest::from_json(&body) {
        Ok(request) => request,
        Err(AskParseError::InvalidJson) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON", None);
        }
        Err(AskParseError::UnknownType(kind)) => {
            warn!("Rejected ask of unknown type {:?}", kind);
            return error_response(StatusCode::BAD_REQUEST, "Unknown request type", Some(kind));
        }
        Err(AskParseError::Malformed(details)) => {
            warn!("Rejected malformed ask: {}", details);
            return error_response(
                StatusCode::BAD_REQUEST,
                "Malformed ask request",
                Some(details),
            );
        }
    };

    debug!(
        "Ask {} ({}) from callback port {:?}",
        request.request_id, request.kind, request.callback_port
    );
    match shared.present_new(request).await {
        Ok(()) => (StatusCode::OK, Json(AskAck { success: true })).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to show dialog",
            Some(format!("{e:#}")),
        ),
    }
}
