//! Delivery of answers from the UI host back to a requester's `/response`

use crate::protocol::{loopback_url, paths, AskResponse};
use crate::{BridgeError, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// How a reply attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The requester matched the reply to a live wait
    Delivered,
    /// The requester no longer waits for this id (`404`); not an error
    Expired,
    /// This request already had its terminal reply; nothing was sent
    AlreadyFinished,
}

/// HTTP client posting replies to requester callback ports
#[derive(Debug, Clone)]
pub struct ReplySender {
    client: Client,
}

impl ReplySender {
    pub fn new(timeout: Duration) -> Self {
        // Callback ports are ephemeral, so pooled connections are never reused.
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub async fn send(&self, port: u16, response: &AskResponse) -> Result<ReplyStatus> {
        let url = loopback_url(port, paths::RESPONSE);
        let result = self
            .client
            .post(&url)
            .json(response)
            .send()
            .await
            .map_err(|e| BridgeError::Callback(format!("{url}: {e}")))?;

        match result.status() {
            StatusCode::OK => {
                debug!("Reply for {} delivered to port {}", response.request_id, port);
                Ok(ReplyStatus::Delivered)
            }
            StatusCode::NOT_FOUND => {
                debug!("Reply for {} expired on port {}", response.request_id, port);
                Ok(ReplyStatus::Expired)
            }
            status => Err(BridgeError::Callback(format!(
                "requester returned status {status}"
            ))),
        }
    }
}
