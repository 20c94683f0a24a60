//! The single "last undelivered request" slot
//!
//! A new ask always replaces whatever was held before.

use super::session::TerminalFlag;
use crate::protocol::AskRequest;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Undelivered {
    request: AskRequest,
    accepted_at: Instant,
    flag: TerminalFlag,
}

/// What a re-open attempt found in the slot
#[derive(Debug)]
pub enum SlotLookup {
    Fresh {
        request: AskRequest,
        flag: TerminalFlag,
    },
    /// Held request was older than the window and has been dropped
    Expired,
    Empty,
}

#[derive(Debug, Default)]
pub struct PendingSlot {
    inner: Mutex<Option<Undelivered>>,
}

impl PendingSlot {
    fn slot(&self) -> MutexGuard<'_, Option<Undelivered>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remember `request` as the one to re-open, stamped now.
    pub fn store(&self, request: AskRequest, flag: TerminalFlag) {
        let previous = self.slot().replace(Undelivered {
            request,
            accepted_at: Instant::now(),
            flag,
        });
        if let Some(previous) = previous {
            debug!(
                "Replaced undelivered request {}",
                previous.request.request_id
            );
        }
    }

    /// Clear the slot if it still holds `request_id`.
    pub fn clear_if(&self, request_id: &str) -> bool {
        let mut slot = self.slot();
        if slot
            .as_ref()
            .is_some_and(|held| held.request.request_id == request_id)
        {
            *slot = None;
            return true;
        }
        false
    }

    pub fn current(&self) -> Option<AskRequest> {
        self.slot().as_ref().map(|held| held.request.clone())
    }

    /// Look up the held request for re-open, dropping it if older than `window`.
    pub fn lookup(&self, window: Duration) -> SlotLookup {
        let mut slot = self.slot();
        match slot.as_ref() {
            None => SlotLookup::Empty,
            Some(held) if held.accepted_at.elapsed() > window => {
                debug!("Undelivered request {} expired", held.request.request_id);
                *slot = None;
                SlotLookup::Expired
            }
            Some(held) => SlotLookup::Fresh {
                request: held.request.clone(),
                flag: held.flag.clone(),
            },
        }
    }
}
