//! One presentation of an ask and the actions a user can take on it

use super::reply::{ReplySender, ReplyStatus};
use super::slot::PendingSlot;
use crate::protocol::{AskRequest, AskResponse};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Set once the terminal reply for a request has been claimed.
///
/// Shared by every session presenting the same request, so a re-opened
/// dialog cannot answer twice.
#[derive(Debug, Clone, Default)]
pub struct TerminalFlag(Arc<AtomicBool>);

impl TerminalFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for exactly one caller until released.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a claim whose reply could not be sent, so the user can retry.
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle given to the presenter for one shown ask
#[derive(Debug, Clone)]
pub struct DialogSession {
    request: AskRequest,
    reply_port: u16,
    flag: TerminalFlag,
    reply: ReplySender,
    slot: Arc<PendingSlot>,
}

impl DialogSession {
    pub(crate) fn new(
        request: AskRequest,
        reply_port: u16,
        flag: TerminalFlag,
        reply: ReplySender,
        slot: Arc<PendingSlot>,
    ) -> Self {
        Self {
            request,
            reply_port,
            flag,
            reply,
            slot,
        }
    }

    pub fn request(&self) -> &AskRequest {
        &self.request
    }

    pub fn reply_port(&self) -> u16 {
        self.reply_port
    }

    /// Whether the terminal reply has already been sent.
    pub fn is_finished(&self) -> bool {
        self.flag.is_set()
    }

    /// The user answered with `text`.
    pub async fn submit(&self, text: impl Into<String>) -> Result<ReplyStatus> {
        self.respond(AskResponse::answered(self.request.request_id.as_str(), text))
            .await
    }

    /// The user chose to continue without input.
    pub async fn end(&self) -> Result<ReplyStatus> {
        self.submit(String::new()).await
    }

    async fn respond(&self, response: AskResponse) -> Result<ReplyStatus> {
        if !self.flag.claim() {
            debug!("Request {} already answered", self.request.request_id);
            return Ok(ReplyStatus::AlreadyFinished);
        }
        match self.reply.send(self.reply_port, &response).await {
            Ok(status) => {
                self.slot.clear_if(&self.request.request_id);
                Ok(status)
            }
            Err(e) => {
                self.flag.release();
                Err(e)
            }
        }
    }

    /// The user explicitly cancelled. Delivery errors are ignored.
    pub async fn cancel(&self) -> ReplyStatus {
        debug!("User cancelled {}", self.request.request_id);
        self.close().await
    }

    /// The surface was closed. Cancels unless an answer was already sent.
    pub async fn close(&self) -> ReplyStatus {
        self.slot.clear_if(&self.request.request_id);
        self.send_cancellation().await
    }

    /// The surface was hidden without acting; the ask stays re-openable.
    pub fn dismiss(self) {
        debug!(
            "Dialog for {} dismissed, kept for reopen",
            self.request.request_id
        );
    }

    async fn send_cancellation(&self) -> ReplyStatus {
        if !self.flag.claim() {
            return ReplyStatus::AlreadyFinished;
        }
        let response = AskResponse::cancelled(self.request.request_id.as_str());
        match self.reply.send(self.reply_port, &response).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "Cancellation for {} not delivered: {}",
                    self.request.request_id, e
                );
                ReplyStatus::Expired
            }
        }
    }
}
