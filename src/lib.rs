//! Ask Continue - cross-process ask/answer bridge
//!
//! Lets a long-running tool process (the requester) pause and wait for a human
//! answer collected by a separately started UI host:
//! - The requester opens a callback listener on an ephemeral loopback port
//! - Each ask is posted to the host's `/ask` endpoint with its callback port
//! - The host posts the answer (or a cancellation) back to `/response`
//! - Waits resolve exactly once: answered, cancelled, or timed out

pub mod config;
pub mod console;
pub mod correlation;
pub mod discovery;
pub mod host;
pub mod process;
pub mod protocol;
pub mod requester;
pub mod sweeper;

pub use config::BridgeConfig;
pub use correlation::{CorrelationTable, ResolveStatus, WaitHandle};
pub use discovery::PortStore;
pub use host::{AskDispatcher, DialogSession, Presenter, ReopenOutcome, ServiceState};
pub use protocol::{AskKind, AskPayload, AskRequest, AskResponse, PortRecord};
pub use requester::{AskOutcome, CallbackListener, Requester};
pub use sweeper::{SweepReport, Sweeper};

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Cannot reach UI host: {0}")]
    ConnectionFailure(String),

    #[error("UI host rejected ask ({status}): {message}")]
    DispatchRejected { status: u16, message: String },

    #[error("Ports {first} - {last} are all in use, service not started")]
    PortConflict { first: u16, last: u16 },

    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Request {0} already has a pending wait")]
    DuplicateRequest(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to deliver response: {0}")]
    Callback(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
