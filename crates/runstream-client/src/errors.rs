/// Errors raised by the stream transport and its HTTP backend.
///
/// Only `InvalidRequest` and `Config` are ever returned synchronously from
/// `StreamClient::open`; connection-level failures are reported as typed
/// error events on the stream instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Caller input could not be turned into a request (empty keys, bad URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Client configuration is missing or unusable.
    #[error("config error: {0}")]
    Config(String),
    /// Network or stream I/O failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Server answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

impl StreamError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns the HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure from a `MarkdownRenderer`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("markdown render failed: {0}")]
pub struct RenderError(pub String);

/// Failure from a `ReportFetcher`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("report fetch failed: {0}")]
pub struct ReportError(pub String);

/// Failure from a `RunHistory` recorder.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
