//! Correlation table: request id -> pending wait
//!
//! Each outstanding ask owns exactly one entry. The entry is removed exactly
//! once, either by [`CorrelationTable::resolve`] when the host answers or by
//! the waiter itself when its deadline passes. Whoever removes the entry owns
//! the terminal transition; everyone else observes `NotFound`.

use crate::protocol::AskResponse;
use crate::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// `error` marker when the table is torn down under a live wait.
pub const CLOSED_ERROR: &str = "closed";

#[derive(Debug)]
struct PendingWait {
    tx: oneshot::Sender<AskResponse>,
    deadline: Instant,
}

/// Result of offering a response to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// Matched a live wait, which now resolves with the response
    Delivered,
    /// Unknown, already resolved, or expired request id
    NotFound,
}

/// Outstanding waits keyed by request id, owned by one requester
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingWait>>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingWait>> {
        // Critical sections never panic midway, so a poisoned map is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a wait for `request_id` that gives up after `timeout`.
    ///
    /// Fails if the id already has a live wait.
    pub fn register_wait(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        let request_id = request_id.into();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries();
        if entries.contains_key(&request_id) {
            return Err(BridgeError::DuplicateRequest(request_id));
        }
        entries.insert(request_id.clone(), PendingWait { tx, deadline });
        drop(entries);

        debug!("Registered wait for {} ({:?})", request_id, timeout);
        Ok(WaitHandle {
            table: Arc::clone(self),
            request_id,
            rx,
            deadline,
            settled: false,
        })
    }

    /// Hand a response to the matching wait, if it is still live.
    ///
    /// The deadline check and the send happen under the lock, so a waiter
    /// whose timer finds the entry gone knows the response is already queued.
    pub fn resolve(&self, response: AskResponse) -> ResolveStatus {
        let mut entries = self.entries();
        let Some(pending) = entries.get(&response.request_id) else {
            debug!("No pending wait for {}", response.request_id);
            return ResolveStatus::NotFound;
        };

        // Past the deadline the waiter's timer owns the outcome.
        if Instant::now() >= pending.deadline {
            debug!("Response for {} arrived after its deadline", response.request_id);
            return ResolveStatus::NotFound;
        }

        let Some(pending) = entries.remove(&response.request_id) else {
            return ResolveStatus::NotFound;
        };
        let request_id = response.request_id.clone();
        match pending.tx.send(response) {
            Ok(()) => {
                debug!("Resolved wait for {}", request_id);
                ResolveStatus::Delivered
            }
            Err(_) => ResolveStatus::NotFound,
        }
    }

    /// Remove a wait without resolving it. Returns whether it was present.
    fn expire(&self, request_id: &str) -> bool {
        self.entries().remove(request_id).is_some()
    }

    /// Drop every pending wait; their waiters resolve as closed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// The caller's side of a registered wait.
///
/// Dropping the handle without calling [`WaitHandle::wait`] removes the entry.
#[derive(Debug)]
pub struct WaitHandle {
    table: Arc<CorrelationTable>,
    request_id: String,
    rx: oneshot::Receiver<AskResponse>,
    deadline: Instant,
    settled: bool,
}

impl WaitHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the terminal response. Always returns a response:
    /// the host's answer, a synthesized timeout, or a closed marker.
    pub async fn wait(mut self) -> AskResponse {
        let received = tokio::select! {
            received = &mut self.rx => Some(received),
            _ = sleep_until(self.deadline) => None,
        };

        let response = match received {
            Some(Ok(response)) => response,
            Some(Err(_)) => closed(&self.request_id),
            None => {
                if self.table.expire(&self.request_id) {
                    debug!("Wait for {} timed out", self.request_id);
                    AskResponse::timed_out(self.request_id.as_str())
                } else {
                    // resolve() or clear() took the entry as the timer fired;
                    // the sender has already sent or been dropped.
                    match (&mut self.rx).await {
                        Ok(response) => response,
                        Err(_) => closed(&self.request_id),
                    }
                }
            }
        };

        self.settled = true;
        response
    }
}

fn closed(request_id: &str) -> AskResponse {
    AskResponse {
        error: Some(CLOSED_ERROR.to_string()),
        ..AskResponse::cancelled(request_id)
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if !self.settled && self.table.expire(&self.request_id) {
            debug!("Abandoned wait for {}", self.request_id);
        }
    }
}
