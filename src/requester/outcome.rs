//! Terminal outcome of an ask, as seen by the requester's caller

use crate::protocol::{AskKind, AskResponse};

/// Exactly one of these is produced per ask
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskOutcome {
    /// The human answered (possibly with empty input, meaning "continue")
    Answered { user_input: String },
    /// The human dismissed the ask, or the host could not present it
    Cancelled,
    /// Nobody answered before the deadline
    TimedOut,
    /// The ask never reached a usable host, or the wait was torn down
    Failed { reason: String },
}

impl From<AskResponse> for AskOutcome {
    fn from(response: AskResponse) -> Self {
        if response.is_timeout() {
            return AskOutcome::TimedOut;
        }
        if let Some(error) = response.error {
            return AskOutcome::Failed { reason: error };
        }
        if response.cancelled {
            AskOutcome::Cancelled
        } else {
            AskOutcome::Answered {
                user_input: response.user_input,
            }
        }
    }
}

impl AskOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, AskOutcome::TimedOut | AskOutcome::Failed { .. })
    }

    /// Text a tool hands back to its caller for this outcome.
    pub fn tool_text(&self, kind: AskKind) -> String {
        match self {
            AskOutcome::Failed { reason } => format!("Ask failed: {reason}"),
            AskOutcome::TimedOut => "Wait failed: timeout".to_string(),
            AskOutcome::Cancelled => match kind {
                AskKind::Ask => "User cancelled the conversation".to_string(),
                AskKind::AnalyzeImage => "User cancelled the image analysis".to_string(),
                AskKind::AnalyzeFiles => "User cancelled the file analysis".to_string(),
            },
            AskOutcome::Answered { user_input } => match (kind, user_input.is_empty()) {
                (AskKind::Ask, true) => "User chose to continue".to_string(),
                (AskKind::Ask, false) => format!("User replied: {user_input}"),
                (AskKind::AnalyzeImage, true) => "Image received, awaiting analysis".to_string(),
                (AskKind::AnalyzeImage, false) => user_input.clone(),
                (AskKind::AnalyzeFiles, true) => "Files received".to_string(),
                (AskKind::AnalyzeFiles, false) => format!("Analysis result: {user_input}"),
            },
        }
    }
}
