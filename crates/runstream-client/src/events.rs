//! Typed events delivered by stream handles.
//!
//! Every inbound wire event maps to exactly one variant; transport-level
//! notifications (errors, resumes, event ids) share the same channel so a
//! consumer handles the whole feed with one exhaustive `match`.

use serde::{Deserialize, Serialize};

/// Events of a run stream (`{base}/stream`).
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    /// Connection opened, or the server sent an explicit `hello`.
    Hello,
    /// Output text with line endings normalized to `\n`. Never empty.
    Token(String),
    /// Running cost reported by the server. Always finite.
    Cost(f64),
    Done,
    Cancelled,
    Limited,
    Aborted,
    /// Connection failure or server `error` frame. `will_retry` tells whether
    /// a resume follows.
    Error { will_retry: bool, message: String },
    /// First event received after a reconnect.
    Resumed,
    /// Server event id of the frame being dispatched.
    EventId(String),
}

impl RunEvent {
    /// Whether the server ended the run with this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Cancelled | Self::Limited | Self::Aborted
        )
    }
}

/// Progress payload of a job `progress` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    /// Parses either a bare number or an object with `percent`/`progress`
    /// and `message` fields. Returns `None` when nothing usable is present.
    pub fn parse(data: &str) -> Option<Self> {
        let trimmed = data.trim();
        if let Ok(value) = trimmed.parse::<f64>() {
            return value.is_finite().then_some(Self {
                percent: Some(value),
                message: None,
            });
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let percent = value
            .get("percent")
            .or_else(|| value.get("progress"))
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite());
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        if percent.is_none() && message.is_none() {
            return None;
        }
        Some(Self { percent, message })
    }
}

/// Events of a job-progress stream (`{base}/jobs/stream`).
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Queued,
    Running,
    Progress(JobProgress),
    /// Job failed; carries the server's reason when one was sent.
    Failed(Option<String>),
    Done,
    Cancelled,
    Error { will_retry: bool, message: String },
    Resumed,
    EventId(String),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed(_))
    }
}

/// Converts `\r\n` and lone `\r` to `\n`.
pub fn normalize_newlines(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

pub(crate) fn parse_cost(data: &str) -> Option<f64> {
    data.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
