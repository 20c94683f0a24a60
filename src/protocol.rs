//! Wire types shared by the requester and the UI host
//!
//! Everything travels as JSON over loopback HTTP. Field names are camelCase on
//! the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};

/// Endpoint paths
pub mod paths {
    pub const ASK: &str = "/ask";
    pub const RESPONSE: &str = "/response";
}

/// Both sides only ever bind or dial 127.0.0.1.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Well-known port the UI host tries first.
pub const DEFAULT_HOST_PORT: u16 = 23983;

/// Callback port assumed when an ask does not carry one.
pub const DEFAULT_CALLBACK_PORT: u16 = 23984;

/// `error` marker on a synthesized timeout response.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Build a loopback URL for `path` on `port`.
pub fn loopback_url(port: u16, path: &str) -> String {
    format!("http://{}:{}{}", LOOPBACK, port, path)
}

/// What the requester is asking the human to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AskKind {
    #[serde(rename = "ask", alias = "ask_continue")]
    Ask,
    #[serde(rename = "analyze-image", alias = "analyze_image")]
    AnalyzeImage,
    #[serde(rename = "analyze-files", alias = "analyze_files")]
    AnalyzeFiles,
}

impl AskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskKind::Ask => "ask",
            AskKind::AnalyzeImage => "analyze-image",
            AskKind::AnalyzeFiles => "analyze-files",
        }
    }

    /// Accepts both the canonical names and the underscore spellings older
    /// requesters send.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ask" | "ask_continue" => Some(AskKind::Ask),
            "analyze-image" | "analyze_image" => Some(AskKind::AnalyzeImage),
            "analyze-files" | "analyze_files" => Some(AskKind::AnalyzeFiles),
            _ => None,
        }
    }
}

impl std::fmt::Display for AskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ask posted to the host's `/ask` endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    #[serde(rename = "type")]
    pub kind: AskKind,
    pub request_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AskPayload>,
}

/// Kind-specific content carried by an ask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AskPayload {
    Image(ImagePayload),
    Files(FilesPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_uri: Option<String>,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesPayload {
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub question: String,
}

impl FilesPayload {
    /// Number of image entries and non-image entries.
    pub fn counts(&self) -> (usize, usize) {
        let images = self
            .files
            .iter()
            .filter(|f| f.kind == FileKind::Image)
            .count();
        (images, self.files.len() - images)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_name: String,
    pub file_path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Text,
    Document,
}

/// Why an `/ask` body was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AskParseError {
    InvalidJson,
    UnknownType(String),
    Malformed(String),
}

impl AskRequest {
    pub fn new(kind: AskKind, request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            reason: reason.into(),
            callback_port: None,
            payload: None,
        }
    }

    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = Some(port);
        self
    }

    pub fn with_payload(mut self, payload: AskPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parse and validate a raw `/ask` body.
    ///
    /// `{"type":"ask_continue","subType":"analyze_image",...}` is the legacy
    /// spelling of an image ask and resolves to [`AskKind::AnalyzeImage`].
    pub fn from_json(body: &[u8]) -> Result<Self, AskParseError> {
        let mut value: Value =
            serde_json::from_slice(body).map_err(|_| AskParseError::InvalidJson)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| AskParseError::Malformed("body must be a JSON object".to_string()))?;

        let type_name = object
            .get("subType")
            .and_then(|v| v.as_str())
            .or_else(|| object.get("type").and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string();
        let kind = AskKind::from_wire(&type_name)
            .ok_or_else(|| AskParseError::UnknownType(type_name.clone()))?;
        object.insert("type".to_string(), Value::String(kind.as_str().to_string()));

        let request: AskRequest = serde_json::from_value(value)
            .map_err(|e| AskParseError::Malformed(e.to_string()))?;
        request.validate().map_err(AskParseError::Malformed)?;
        Ok(request)
    }

    /// Check the id is usable and the payload matches the kind.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.request_id.trim().is_empty() {
            return Err("requestId must not be empty".to_string());
        }
        match (self.kind, &self.payload) {
            (AskKind::Ask, None) => Ok(()),
            (AskKind::Ask, Some(_)) => Err("ask requests carry no payload".to_string()),
            (AskKind::AnalyzeImage, Some(AskPayload::Image(_))) => Ok(()),
            (AskKind::AnalyzeImage, _) => {
                Err("analyze-image requires an image payload".to_string())
            }
            (AskKind::AnalyzeFiles, Some(AskPayload::Files(files))) if !files.files.is_empty() => {
                Ok(())
            }
            (AskKind::AnalyzeFiles, _) => {
                Err("analyze-files requires at least one file".to_string())
            }
        }
    }
}

/// A human answer (or cancellation) posted back to `/response`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub request_id: String,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AskResponse {
    pub fn answered(request_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_input: user_input.into(),
            cancelled: false,
            error: None,
        }
    }

    pub fn cancelled(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_input: String::new(),
            cancelled: true,
            error: None,
        }
    }

    /// Synthesized by the requester when nobody answered in time.
    pub fn timed_out(request_id: impl Into<String>) -> Self {
        Self {
            error: Some(TIMEOUT_ERROR.to_string()),
            ..Self::cancelled(request_id)
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }
}

/// Body of a `200` from `/ask`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskAck {
    pub success: bool,
}

/// Body of any non-`200` from `/ask`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// One discovery file per UI host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub pid: u32,
    /// Epoch milliseconds when the record was written
    pub time: i64,
}

impl PortRecord {
    pub fn new(port: u16, pid: u32) -> Self {
        Self {
            port,
            pid,
            time: chrono::Utc::now().timestamp_millis(),
        }
    }
}
