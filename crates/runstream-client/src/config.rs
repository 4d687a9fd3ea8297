use std::time::Duration;

use reqwest::Url;
use tracing::warn;

use crate::errors::StreamError;

/// Pause between a dropped connection and the single resume attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(50);
/// Roughly one display refresh at 60 Hz.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Configuration for the stream client and its HTTP backend.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL that `stream`, `cancel`, `jobs/stream` and `jobs/cancel` are joined onto.
    pub base_url: String,
    /// Connect timeout for the long-lived event stream.
    ///
    /// The stream itself has no total timeout; it stays open until the server
    /// finishes the run.
    pub connect_timeout: Duration,
    /// Total timeout for short requests such as cancellation.
    pub request_timeout: Duration,
    /// Fixed delay before the resume attempt after a connection error.
    pub reconnect_delay: Duration,
    /// Bounded event buffer between the connection task and the handle.
    pub channel_capacity: usize,
}

impl ClientConfig {
    /// Creates a config with default timeouts for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            channel_capacity: 256,
        }
    }

    /// Builds a config from `RUNSTREAM_BASE_URL` plus optional timeout overrides.
    pub fn from_env() -> Result<Self, StreamError> {
        let base_url = std::env::var("RUNSTREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(StreamError::Config(
                "missing RUNSTREAM_BASE_URL for stream client".into(),
            ));
        }
        Ok(Self::new(base_url.trim()).apply_env())
    }

    /// Applies `RUNSTREAM_*_MS` overrides on top of the current values.
    ///
    /// - `RUNSTREAM_CONNECT_TIMEOUT_MS`
    /// - `RUNSTREAM_REQUEST_TIMEOUT_MS`
    /// - `RUNSTREAM_RECONNECT_DELAY_MS`
    pub fn apply_env(mut self) -> Self {
        if let Some(value) = env_millis("RUNSTREAM_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = value;
        }
        if let Some(value) = env_millis("RUNSTREAM_REQUEST_TIMEOUT_MS") {
            self.request_timeout = value;
        }
        if let Some(value) = env_millis("RUNSTREAM_RECONNECT_DELAY_MS") {
            self.reconnect_delay = value;
        }
        self
    }

    /// Overrides the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the stream connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the timeout for short requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Overrides the event channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, StreamError> {
        let raw = format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|e| {
            StreamError::invalid(format!("invalid base url `{}`: {e}", self.base_url))
        })
    }
}

/// Behavior flags for `SessionController`.
///
/// Each side effect is gated independently so callers can wire the controller
/// to whichever flag source they use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Coalesce token events into one state update per flush tick.
    pub buffer_tokens: bool,
    /// Caller prefers reduced motion; flushes fall back to the microtask tick.
    pub reduced_motion: bool,
    /// A frame clock is available to schedule flushes on.
    pub frame_clock: bool,
    /// Interval of the frame clock.
    pub frame_interval: Duration,
    /// Record a `RunSummary` into the run history on terminal transitions.
    pub record_history: bool,
    /// Fetch the post-run report on terminal transitions.
    pub fetch_report: bool,
    /// Include seed, budget and model in recorded summaries.
    pub report_params: bool,
    /// Re-render accumulated text as sanitized HTML on every applied chunk.
    pub render_markdown: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            buffer_tokens: true,
            reduced_motion: false,
            frame_clock: true,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            record_history: false,
            fetch_report: false,
            report_params: false,
            render_markdown: false,
        }
    }
}

impl ControllerConfig {
    /// Defaults overlaid with `RUNSTREAM_*` boolean flags.
    ///
    /// Recognised keys: `RUNSTREAM_BUFFER_TOKENS`, `RUNSTREAM_REDUCED_MOTION`,
    /// `RUNSTREAM_RECORD_HISTORY`, `RUNSTREAM_FETCH_REPORT`,
    /// `RUNSTREAM_REPORT_PARAMS`, `RUNSTREAM_RENDER_MARKDOWN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let flags: [(&str, &mut bool); 6] = [
            ("RUNSTREAM_BUFFER_TOKENS", &mut config.buffer_tokens),
            ("RUNSTREAM_REDUCED_MOTION", &mut config.reduced_motion),
            ("RUNSTREAM_RECORD_HISTORY", &mut config.record_history),
            ("RUNSTREAM_FETCH_REPORT", &mut config.fetch_report),
            ("RUNSTREAM_REPORT_PARAMS", &mut config.report_params),
            ("RUNSTREAM_RENDER_MARKDOWN", &mut config.render_markdown),
        ];
        for (key, slot) in flags {
            if let Some(value) = env_bool(key) {
                *slot = value;
            }
        }
        config
    }

    pub fn buffer_tokens(mut self, enabled: bool) -> Self {
        self.buffer_tokens = enabled;
        self
    }

    pub fn reduced_motion(mut self, enabled: bool) -> Self {
        self.reduced_motion = enabled;
        self
    }

    pub fn frame_clock(mut self, available: bool) -> Self {
        self.frame_clock = available;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn record_history(mut self, enabled: bool) -> Self {
        self.record_history = enabled;
        self
    }

    pub fn fetch_report(mut self, enabled: bool) -> Self {
        self.fetch_report = enabled;
        self
    }

    pub fn report_params(mut self, enabled: bool) -> Self {
        self.report_params = enabled;
        self
    }

    pub fn render_markdown(mut self, enabled: bool) -> Self {
        self.render_markdown = enabled;
        self
    }
}

pub(crate) fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse_bool_env(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring unrecognised boolean flag");
    }
    parsed
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric millisecond override");
            None
        }
    }
}
