//! Requester side of the bridge
//!
//! Owns the callback listener and the correlation table. Each ask is
//! registered before it is dispatched, so a cancellation the host delivers
//! while still handling `/ask` always finds its wait.

mod callback;
mod outcome;

pub use callback::CallbackListener;
pub use outcome::AskOutcome;

use crate::config::BridgeConfig;
use crate::correlation::CorrelationTable;
use crate::protocol::{
    loopback_url, paths, AskKind, AskPayload, AskRequest, ErrorBody, FilesPayload, ImagePayload,
};
use crate::{BridgeError, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The tool-execution side: sends asks and waits for answers
pub struct Requester {
    host_port: u16,
    ask_timeout: Duration,
    table: Arc<CorrelationTable>,
    listener: CallbackListener,
    client: Client,
}

impl Requester {
    /// Open the callback listener and target the configured host port.
    pub async fn start(config: &BridgeConfig) -> Result<Self> {
        let table = CorrelationTable::new();
        let listener = CallbackListener::start(table.clone()).await?;
        let client = Client::builder()
            .timeout(config.dispatch_timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            host_port: config.host_port,
            ask_timeout: config.ask_timeout,
            table,
            listener,
            client,
        })
    }

    /// Target a different host port (e.g. one found in the discovery store).
    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = port;
        self
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn callback_port(&self) -> u16 {
        self.listener.port()
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Ask the human whether (and how) to continue.
    pub async fn ask(&self, reason: impl Into<String>) -> AskOutcome {
        self.submit(AskKind::Ask, reason, None).await
    }

    pub async fn analyze_image(
        &self,
        reason: impl Into<String>,
        image: ImagePayload,
    ) -> AskOutcome {
        self.submit(AskKind::AnalyzeImage, reason, Some(AskPayload::Image(image)))
            .await
    }

    pub async fn analyze_files(
        &self,
        reason: impl Into<String>,
        files: FilesPayload,
    ) -> AskOutcome {
        self.submit(AskKind::AnalyzeFiles, reason, Some(AskPayload::Files(files)))
            .await
    }

    /// Build an ask with a fresh request id and wait for its outcome.
    pub async fn submit(
        &self,
        kind: AskKind,
        reason: impl Into<String>,
        payload: Option<AskPayload>,
    ) -> AskOutcome {
        let request = AskRequest {
            kind,
            request_id: Uuid::new_v4().to_string(),
            reason: reason.into(),
            callback_port: Some(self.callback_port()),
            payload,
        };
        self.send_and_wait(request).await
    }

    /// Register, dispatch and wait. Never fails: every error becomes an outcome.
    pub async fn send_and_wait(&self, request: AskRequest) -> AskOutcome {
        if let Err(details) = request.validate() {
            let e = BridgeError::MalformedPayload(details);
            warn!("Ask {} not sent: {}", request.request_id, e);
            return AskOutcome::Failed { reason: e.to_string() };
        }

        let handle = match self
            .table
            .register_wait(request.request_id.as_str(), self.ask_timeout)
        {
            Ok(handle) => handle,
            Err(e) => return AskOutcome::Failed { reason: e.to_string() },
        };

        match self.dispatch(&request).await {
            Ok(()) => debug!("Host accepted {}", request.request_id),
            Err(BridgeError::DispatchRejected { status, message }) if status >= 500 => {
                warn!(
                    "Host failed to present {} ({}): {}",
                    request.request_id, status, message
                );
                // A host that fails to present cancels before it answers 5xx.
                // If the wait is still registered, that cancellation is lost.
                if self.table.contains(&request.request_id) {
                    drop(handle);
                    info!("Ask {} cancelled by failed dispatch", request.request_id);
                    return AskOutcome::Cancelled;
                }
            }
            Err(e) => {
                warn!("Ask {} not dispatched: {}", request.request_id, e);
                drop(handle);
                return AskOutcome::Failed { reason: e.to_string() };
            }
        }

        let outcome = AskOutcome::from(handle.wait().await);
        info!("Ask {} finished: {:?}", request.request_id, outcome);
        outcome
    }

    async fn dispatch(&self, request: &AskRequest) -> Result<()> {
        let url = loopback_url(self.host_port, paths::ASK);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| BridgeError::ConnectionFailure(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(BridgeError::DispatchRejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Tear down the callback listener; pending waits resolve as closed.
    pub async fn shutdown(self) {
        self.listener.shutdown().await;
    }
}
