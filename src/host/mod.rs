//! UI host side of the bridge
//!
//! The [`AskDispatcher`] accepts asks over HTTP and hands each one to a
//! [`Presenter`]. The presenter gets a [`DialogSession`] through which the
//! user's answer, cancellation or dismissal travels back to the requester.

mod dispatcher;
mod presenter;
mod reply;
mod session;
mod slot;

pub use dispatcher::{AskDispatcher, ReopenOutcome, ServiceState};
pub use presenter::Presenter;
pub use reply::{ReplySender, ReplyStatus};
pub use session::{DialogSession, TerminalFlag};
pub use slot::{PendingSlot, SlotLookup};
