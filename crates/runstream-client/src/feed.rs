//! Event vocabularies served over the shared connection driver.
//!
//! A `Feed` knows its endpoints, the identity parameters it sends, and how to
//! turn a decoded frame into its own event type. Dedup, resume and retry live
//! in the transport and are identical for every feed.

use reqwest::Url;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::events::{JobEvent, JobProgress, RunEvent, normalize_newlines, parse_cost};
use crate::model::{RunKey, Scenario};
use crate::sse::SseFrame;

/// Result of decoding one frame.
#[derive(Debug, PartialEq)]
pub enum Decoded<E> {
    Event(E),
    /// Deliver, then tear the connection down.
    Terminal(E),
    /// Server reported a failure; handled like a dropped connection.
    Failed(String),
    /// Nothing to deliver (empty token, unparseable payload, unknown name).
    Skip,
}

/// One event vocabulary and its endpoints.
pub trait Feed: Send + Sync + 'static {
    type Event: Clone + std::fmt::Debug + Send + 'static;

    /// Short name used in log fields.
    fn label(&self) -> &'static str;
    fn stream_path(&self) -> &'static str;
    fn cancel_path(&self) -> &'static str;
    /// Parameters identifying the stream; sent to both endpoints.
    fn identity(&self) -> Vec<(&'static str, String)>;
    /// Extra parameters sent only when opening the stream.
    fn stream_extras(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
    fn validate(&self) -> Result<(), StreamError>;

    /// Event emitted whenever a connection opens.
    fn on_open(&self) -> Option<Self::Event>;
    fn decode(&self, frame: &SseFrame) -> Decoded<Self::Event>;
    fn transport_error(&self, will_retry: bool, message: String) -> Self::Event;
    fn resumed(&self) -> Self::Event;
    fn event_id(&self, id: String) -> Self::Event;
}

pub(crate) fn stream_url<F: Feed>(
    config: &ClientConfig,
    feed: &F,
    last_event_id: Option<&str>,
) -> Result<Url, StreamError> {
    let mut url = config.endpoint(feed.stream_path())?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in feed.identity().into_iter().chain(feed.stream_extras()) {
            query.append_pair(key, &value);
        }
        if let Some(id) = last_event_id {
            query.append_pair("lastEventId", id);
        }
    }
    Ok(url)
}

pub(crate) fn cancel_url<F: Feed>(config: &ClientConfig, feed: &F) -> Result<Url, StreamError> {
    let mut url = config.endpoint(feed.cancel_path())?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in feed.identity() {
            query.append_pair(key, &value);
        }
    }
    Ok(url)
}

fn server_error(data: &str) -> String {
    let reason = normalize_newlines(data.trim());
    if reason.is_empty() {
        "server reported an error".to_string()
    } else {
        format!("server reported an error: {reason}")
    }
}

fn require(name: &str, value: &str) -> Result<(), StreamError> {
    if value.trim().is_empty() {
        return Err(StreamError::invalid(format!("{name} must not be empty")));
    }
    Ok(())
}

/// Token/cost feed of a single run.
#[derive(Clone, Debug)]
pub struct RunFeed {
    key: RunKey,
    scenario: Scenario,
}

impl RunFeed {
    pub fn new(key: RunKey, scenario: Scenario) -> Self {
        Self { key, scenario }
    }
}

impl Feed for RunFeed {
    type Event = RunEvent;

    fn label(&self) -> &'static str {
        "run"
    }

    fn stream_path(&self) -> &'static str {
        "stream"
    }

    fn cancel_path(&self) -> &'static str {
        "cancel"
    }

    fn identity(&self) -> Vec<(&'static str, String)> {
        vec![
            ("route", self.key.route.clone()),
            ("sessionId", self.key.session_id.clone()),
            ("org", self.key.org.clone()),
        ]
    }

    fn stream_extras(&self) -> Vec<(&'static str, String)> {
        let mut extras = Vec::new();
        if let Some(seed) = self.scenario.seed {
            extras.push(("seed", seed.to_string()));
        }
        if let Some(budget) = self.scenario.budget {
            extras.push(("budget", budget.to_string()));
        }
        if let Some(model) = self.scenario.model.as_ref().filter(|m| !m.trim().is_empty()) {
            extras.push(("model", model.clone()));
        }
        extras
    }

    fn validate(&self) -> Result<(), StreamError> {
        require("route", &self.key.route)?;
        require("sessionId", &self.key.session_id)?;
        require("org", &self.key.org)?;
        if let Some(budget) = self.scenario.budget
            && !budget.is_finite()
        {
            return Err(StreamError::invalid("budget must be a finite number"));
        }
        Ok(())
    }

    fn on_open(&self) -> Option<RunEvent> {
        Some(RunEvent::Hello)
    }

    fn decode(&self, frame: &SseFrame) -> Decoded<RunEvent> {
        match frame.event_name() {
            "hello" => Decoded::Event(RunEvent::Hello),
            // Servers that omit event names send plain tokens.
            "token" | "message" => {
                let text = normalize_newlines(&frame.data);
                if text.is_empty() {
                    Decoded::Skip
                } else {
                    Decoded::Event(RunEvent::Token(text))
                }
            }
            "cost" => match parse_cost(&frame.data) {
                Some(cost) => Decoded::Event(RunEvent::Cost(cost)),
                None => {
                    debug!(data = %frame.data, "skipping non-numeric cost");
                    Decoded::Skip
                }
            },
            "done" => Decoded::Terminal(RunEvent::Done),
            "cancelled" => Decoded::Terminal(RunEvent::Cancelled),
            "limited" => Decoded::Terminal(RunEvent::Limited),
            "aborted" => Decoded::Terminal(RunEvent::Aborted),
            "error" => Decoded::Failed(server_error(&frame.data)),
            other => {
                debug!(event = other, "ignoring unknown run event");
                Decoded::Skip
            }
        }
    }

    fn transport_error(&self, will_retry: bool, message: String) -> RunEvent {
        RunEvent::Error {
            will_retry,
            message,
        }
    }

    fn resumed(&self) -> RunEvent {
        RunEvent::Resumed
    }

    fn event_id(&self, id: String) -> RunEvent {
        RunEvent::EventId(id)
    }
}

/// Coarse progress feed of a background job.
#[derive(Clone, Debug)]
pub struct JobFeed {
    job_id: String,
    org: String,
}

impl JobFeed {
    pub fn new(job_id: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            org: org.into(),
        }
    }
}

impl Feed for JobFeed {
    type Event = JobEvent;

    fn label(&self) -> &'static str {
        "job"
    }

    fn stream_path(&self) -> &'static str {
        "jobs/stream"
    }

    fn cancel_path(&self) -> &'static str {
        "jobs/cancel"
    }

    fn identity(&self) -> Vec<(&'static str, String)> {
        vec![("jobId", self.job_id.clone()), ("org", self.org.clone())]
    }

    fn validate(&self) -> Result<(), StreamError> {
        require("jobId", &self.job_id)?;
        require("org", &self.org)
    }

    fn on_open(&self) -> Option<JobEvent> {
        None
    }

    fn decode(&self, frame: &SseFrame) -> Decoded<JobEvent> {
        match frame.event_name() {
            "queued" => Decoded::Event(JobEvent::Queued),
            "running" => Decoded::Event(JobEvent::Running),
            "progress" => match JobProgress::parse(&frame.data) {
                Some(progress) => Decoded::Event(JobEvent::Progress(progress)),
                None => {
                    debug!(data = %frame.data, "skipping unparseable job progress");
                    Decoded::Skip
                }
            },
            "failed" => {
                let reason = normalize_newlines(frame.data.trim());
                Decoded::Terminal(JobEvent::Failed((!reason.is_empty()).then_some(reason)))
            }
            "done" => Decoded::Terminal(JobEvent::Done),
            "cancelled" => Decoded::Terminal(JobEvent::Cancelled),
            "error" => Decoded::Failed(server_error(&frame.data)),
            other => {
                debug!(event = other, "ignoring unknown job event");
                Decoded::Skip
            }
        }
    }

    fn transport_error(&self, will_retry: bool, message: String) -> JobEvent {
        JobEvent::Error {
            will_retry,
            message,
        }
    }

    fn resumed(&self) -> JobEvent {
        JobEvent::Resumed
    }

    fn event_id(&self, id: String) -> JobEvent {
        JobEvent::EventId(id)
    }
}
