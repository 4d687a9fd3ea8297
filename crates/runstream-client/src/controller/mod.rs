//! Session controller: one run state and the actions that drive it.
//!
//! The controller consumes `RunEvent`s from a stream handle and folds them
//! into a single `RunState` published through a `watch` channel. Every
//! published change increments `RunState::revision`; buffered tokens are
//! coalesced so a burst of tokens costs one update per flush tick.
//!
//! ```text
//! idle --start--> streaming --done|cancelled|limited|aborted|error--> terminal
//! terminal --reset--> idle            terminal --start--> streaming
//! ```

mod schedule;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::errors::StreamError;
use crate::events::{RunEvent, normalize_newlines};
use crate::history::{RunHistory, RunSummary};
use crate::markdown::MarkdownRenderer;
use crate::model::{RetryPolicy, RunKey, Scenario, StreamOptions};
use crate::report::{ReportFetcher, RunReport};
use crate::session::{EnvSessionDefaults, SessionDefaults, SessionKeys};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use crate::transport::{StreamClient, StreamHandle};

pub use schedule::FlushSchedule;
use schedule::TokenBuffer;

/// Primary status of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Streaming,
    Done,
    Cancelled,
    Limited,
    Aborted,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Limited => "limited",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Streaming)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics collected during one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub cost: Option<f64>,
    pub token_count: u64,
    /// Milliseconds from `start` to the first token. Written once per run.
    pub ttfb_ms: Option<u64>,
    pub resume_count: u32,
    pub last_event_id: Option<String>,
}

/// Everything a caller renders about the current run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub status: RunStatus,
    pub text: String,
    /// Sanitized rendering of `text`, when markdown rendering is enabled.
    pub html: Option<String>,
    pub metrics: RunMetrics,
    pub reconnecting: bool,
    pub resumed_once: bool,
    /// True exactly while `status` is `Streaming`.
    pub started: bool,
    pub report: Option<RunReport>,
    pub error: Option<String>,
    /// Bumped by every `start` and `reset`.
    pub generation: u64,
    /// Bumped by every published update.
    pub revision: u64,
}

/// Parameters of one `start` call.
#[derive(Clone, Debug, PartialEq)]
pub struct RunRequest {
    pub route: String,
    pub scenario: Scenario,
    /// Explicit keys; the controller's `SessionDefaults` are used when absent.
    pub session: Option<SessionKeys>,
    pub retry: RetryPolicy,
}

impl RunRequest {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            scenario: Scenario::default(),
            session: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn session(mut self, keys: SessionKeys) -> Self {
        self.session = Some(keys);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Opens run streams for the controller.
pub trait StreamOpener: Send + Sync {
    fn open(&self, options: StreamOptions) -> Result<StreamHandle<RunEvent>, StreamError>;
}

impl StreamOpener for StreamClient {
    fn open(&self, options: StreamOptions) -> Result<StreamHandle<RunEvent>, StreamError> {
        StreamClient::open(self, options)
    }
}

/// External services the controller reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub session_defaults: Arc<dyn SessionDefaults>,
    pub history: Option<Arc<dyn RunHistory>>,
    pub reports: Option<Arc<dyn ReportFetcher>>,
    pub markdown: Option<Arc<dyn MarkdownRenderer>>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            session_defaults: Arc::new(EnvSessionDefaults::new()),
            history: None,
            reports: None,
            markdown: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }
}

impl Collaborators {
    pub fn with_session_defaults(mut self, defaults: Arc<dyn SessionDefaults>) -> Self {
        self.session_defaults = defaults;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportFetcher>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_markdown(mut self, renderer: Arc<dyn MarkdownRenderer>) -> Self {
        self.markdown = Some(renderer);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

struct ActiveRun {
    key: RunKey,
    scenario: Scenario,
    started: Instant,
    started_at: DateTime<Utc>,
}

enum Wake {
    Flush,
    Event(Option<RunEvent>),
}

/// Drives one run at a time and publishes its state.
///
/// Actions never fail: open errors, transport errors and collaborator
/// failures all end up in `RunState`.
pub struct SessionController {
    opener: Arc<dyn StreamOpener>,
    config: ControllerConfig,
    collaborators: Collaborators,
    schedule: FlushSchedule,
    state: Arc<watch::Sender<RunState>>,
    handle: Option<StreamHandle<RunEvent>>,
    buffer: TokenBuffer,
    flush_at: Option<Instant>,
    run: Option<ActiveRun>,
    closed: bool,
}

impl SessionController {
    pub fn new(opener: Arc<dyn StreamOpener>, config: ControllerConfig) -> Self {
        let schedule = FlushSchedule::select(
            config.frame_clock,
            config.reduced_motion,
            config.frame_interval,
        );
        let (state, _) = watch::channel(RunState::default());
        Self {
            opener,
            config,
            collaborators: Collaborators::default(),
            schedule,
            state: Arc::new(state),
            handle: None,
            buffer: TokenBuffer::default(),
            flush_at: None,
            run: None,
            closed: false,
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.borrow().status
    }

    /// Receiver notified on every published update.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn schedule(&self) -> FlushSchedule {
        self.schedule
    }

    /// Starts a run. Does nothing while a run is streaming.
    pub fn start(&mut self, request: RunRequest) {
        if self.closed {
            warn!(route = %request.route, "start ignored on closed controller");
            return;
        }
        if self.status() == RunStatus::Streaming {
            debug!(route = %request.route, "start ignored while streaming");
            return;
        }

        let keys = request
            .session
            .unwrap_or_else(|| self.collaborators.session_defaults.session_keys());
        let key = RunKey::new(request.route, keys.session_id, keys.org);
        self.discard_pending();
        self.state.send_modify(|state| {
            *state = RunState {
                status: RunStatus::Streaming,
                started: true,
                generation: state.generation + 1,
                revision: state.revision + 1,
                ..RunState::default()
            };
        });
        info!(
            route = %key.route,
            session_id = %key.session_id,
            org = %key.org,
            "run started"
        );
        self.collaborators
            .telemetry
            .track("stream_started", key_props(&key));
        self.run = Some(ActiveRun {
            key: key.clone(),
            scenario: request.scenario.clone(),
            started: Instant::now(),
            started_at: Utc::now(),
        });

        let options = StreamOptions {
            key,
            scenario: request.scenario,
            retry: request.retry,
        };
        match self.opener.open(options) {
            Ok(handle) => self.handle = Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to open run stream");
                self.finish(RunStatus::Error, Some(err.to_string()));
            }
        }
    }

    /// Cancels the streaming run. Does nothing otherwise.
    ///
    /// Buffered text is applied before the state turns `Cancelled`. The
    /// server is notified in the background and the outcome is only logged.
    pub fn stop(&mut self) {
        if self.status() != RunStatus::Streaming {
            debug!("stop ignored while not streaming");
            return;
        }
        if let Some(handle) = self.handle.take() {
            let request = handle.cancel();
            let spawned = spawn_detached(async move {
                match request.await {
                    Ok(outcome) => debug!(?outcome, "cancel request finished"),
                    Err(err) => debug!(error = %err, "cancel request failed"),
                }
            });
            if !spawned {
                debug!("no runtime for cancel request; server not notified");
            }
        }
        self.finish(RunStatus::Cancelled, None);
    }

    /// Returns to the idle state. Does nothing while streaming.
    pub fn reset(&mut self) {
        if self.status() == RunStatus::Streaming {
            debug!("reset ignored while streaming");
            return;
        }
        self.discard_pending();
        self.run = None;
        self.state.send_modify(|state| {
            *state = RunState {
                generation: state.generation + 1,
                revision: state.revision + 1,
                ..RunState::default()
            };
        });
    }

    /// Applies one transport event. Ignored unless streaming.
    pub fn handle_event(&mut self, event: RunEvent) {
        if self.status() != RunStatus::Streaming {
            debug!(?event, "event ignored while not streaming");
            return;
        }
        match event {
            RunEvent::Hello => {
                if self.state.borrow().reconnecting {
                    self.publish(|state| state.reconnecting = false);
                }
            }
            RunEvent::Token(text) => self.on_token(&text),
            RunEvent::Cost(cost) => {
                if cost.is_finite() {
                    self.publish(|state| state.metrics.cost = Some(cost));
                }
            }
            RunEvent::Done => self.finish(RunStatus::Done, None),
            RunEvent::Cancelled => self.finish(RunStatus::Cancelled, None),
            RunEvent::Limited => self.finish(RunStatus::Limited, None),
            RunEvent::Aborted => self.finish(RunStatus::Aborted, None),
            RunEvent::Error {
                will_retry: true,
                message,
            } => {
                debug!(error = %message, "stream reconnecting");
                self.publish(|state| state.reconnecting = true);
            }
            RunEvent::Error {
                will_retry: false,
                message,
            } => self.finish(RunStatus::Error, Some(message)),
            RunEvent::Resumed => self.publish(|state| {
                state.reconnecting = false;
                state.resumed_once = true;
                state.metrics.resume_count += 1;
            }),
            RunEvent::EventId(id) => {
                self.state.send_if_modified(|state| {
                    state.metrics.last_event_id = Some(id);
                    false
                });
            }
        }
    }

    /// Waits for the next transport event or pending flush and applies it.
    ///
    /// Events already queued behind the first one are applied in the same
    /// call. Returns `false` when there is nothing left to wait for.
    pub async fn pump(&mut self) -> bool {
        let deadline = self.flush_at;
        let wake = match self.handle.as_mut() {
            Some(handle) => tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Flush,
                event = handle.next_event() => Wake::Event(event),
            },
            None => match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                    Wake::Flush
                }
                None => return false,
            },
        };

        match wake {
            Wake::Flush => {
                self.flush();
            }
            Wake::Event(Some(event)) => {
                self.handle_event(event);
                while self.status() == RunStatus::Streaming
                    && let Some(event) = self.handle.as_mut().and_then(|h| h.try_next_event())
                {
                    self.handle_event(event);
                }
            }
            Wake::Event(None) => {
                self.handle = None;
                if self.status() == RunStatus::Streaming {
                    self.finish(
                        RunStatus::Error,
                        Some("event stream closed unexpectedly".into()),
                    );
                }
            }
        }
        true
    }

    /// Pumps until the run leaves `Streaming` and returns the final state.
    pub async fn drive(&mut self) -> RunState {
        while self.status() == RunStatus::Streaming {
            if !self.pump().await {
                break;
            }
        }
        self.state()
    }

    /// Closes the transport handle and drops any pending flush. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        self.discard_pending();
        debug!("controller closed");
    }

    fn on_token(&mut self, text: &str) {
        let text = normalize_newlines(text);
        if text.is_empty() {
            return;
        }
        let elapsed = self.ttfb_candidate();
        self.buffer.push(&text, elapsed);
        if !self.config.buffer_tokens {
            self.flush();
            return;
        }
        if self.flush_at.is_none() {
            self.flush_at = Some(self.schedule.deadline(Instant::now()));
        }
    }

    fn ttfb_candidate(&self) -> Option<u64> {
        if self.state.borrow().metrics.ttfb_ms.is_some() {
            return None;
        }
        let run = self.run.as_ref()?;
        Some(u64::try_from(run.started.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    /// Applies buffered tokens in one update. Returns whether anything was applied.
    fn flush(&mut self) -> bool {
        self.flush_at = None;
        if self.buffer.is_empty() {
            return false;
        }
        let pending = self.buffer.take();
        let renderer = self.markdown_renderer();
        self.publish(|state| {
            state.text.push_str(&pending.text);
            state.metrics.token_count += pending.tokens;
            if state.metrics.ttfb_ms.is_none() {
                state.metrics.ttfb_ms = pending.first_token_ms;
            }
            if let Some(renderer) = renderer {
                render_into(renderer.as_ref(), state);
            }
        });
        true
    }

    fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.flush();
        self.handle = None;
        let renderer = self.markdown_renderer();
        self.publish(|state| {
            state.status = status;
            state.started = false;
            state.reconnecting = false;
            state.error = error;
            if let Some(renderer) = renderer {
                render_into(renderer.as_ref(), state);
            }
        });

        let Some(run) = self.run.take() else {
            return;
        };
        let snapshot = self.state();
        let summary = self.summarize(&run, &snapshot);
        info!(
            route = %run.key.route,
            session_id = %run.key.session_id,
            org = %run.key.org,
            status = %status,
            tokens = snapshot.metrics.token_count,
            duration_ms = summary.duration_ms,
            "run finished"
        );

        let mut props = key_props(&run.key);
        props.insert("status".into(), json!(status.as_str()));
        props.insert("tokenCount".into(), json!(snapshot.metrics.token_count));
        props.insert("durationMs".into(), json!(summary.duration_ms));
        if let Some(cost) = snapshot.metrics.cost {
            props.insert("cost".into(), json!(cost));
        }
        self.collaborators.telemetry.track("stream_finished", props);

        if self.config.record_history
            && let Some(history) = &self.collaborators.history
            && let Err(err) = history.record(summary)
        {
            warn!(error = %err, "failed to record run history");
        }
        if self.config.fetch_report
            && let Some(reports) = &self.collaborators.reports
        {
            self.spawn_report_fetch(reports.clone(), run.key, snapshot.generation);
        }
    }

    fn summarize(&self, run: &ActiveRun, state: &RunState) -> RunSummary {
        let params = self.config.report_params;
        RunSummary {
            status: state.status,
            started_at: run.started_at,
            ended_at: Utc::now(),
            duration_ms: u64::try_from(run.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cost: state.metrics.cost,
            token_count: state.metrics.token_count,
            route: run.key.route.clone(),
            session_id: run.key.session_id.clone(),
            org: run.key.org.clone(),
            seed: run.scenario.seed.filter(|_| params),
            budget: run.scenario.budget.filter(|_| params),
            model: run.scenario.model.clone().filter(|_| params),
        }
    }

    fn spawn_report_fetch(&self, reports: Arc<dyn ReportFetcher>, key: RunKey, generation: u64) {
        let state = self.state.clone();
        let spawned = spawn_detached(async move {
            match reports.fetch(&key).await {
                Ok(report) => {
                    let applied = state.send_if_modified(|current| {
                        if current.generation != generation {
                            return false;
                        }
                        current.report = Some(report);
                        current.revision += 1;
                        true
                    });
                    if !applied {
                        debug!(route = %key.route, "discarding report of a previous run");
                    }
                }
                Err(err) => debug!(route = %key.route, error = %err, "report fetch failed"),
            }
        });
        if !spawned {
            debug!("no runtime for report fetch");
        }
    }

    fn markdown_renderer(&self) -> Option<Arc<dyn MarkdownRenderer>> {
        if !self.config.render_markdown {
            return None;
        }
        self.collaborators.markdown.clone()
    }

    fn discard_pending(&mut self) {
        self.buffer = TokenBuffer::default();
        self.flush_at = None;
    }

    fn publish(&self, update: impl FnOnce(&mut RunState)) {
        self.state.send_modify(|state| {
            update(state);
            state.revision += 1;
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close();
    }
}

fn render_into(renderer: &dyn MarkdownRenderer, state: &mut RunState) {
    match renderer.render(&state.text) {
        Ok(html) => state.html = Some(html),
        Err(err) => debug!(error = %err, "markdown render failed; keeping previous html"),
    }
}

fn key_props(key: &RunKey) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("route".into(), json!(key.route));
    props.insert("sessionId".into(), json!(key.session_id));
    props.insert("org".into(), json!(key.org));
    props
}

fn spawn_detached<F>(future: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::config::ClientConfig;
    use crate::errors::{RenderError, ReportError};
    use crate::history::MemoryRunHistory;
    use crate::markdown::SanitizingMarkdownRenderer;
    use crate::session::StaticSessionDefaults;
    use crate::sse::SseFrame;
    use crate::testing::{Connect, ScriptedBackend, token};

    fn client(backend: &Arc<ScriptedBackend>) -> Arc<StreamClient> {
        Arc::new(StreamClient::with_backend(
            ClientConfig::new("http://runs.test/api").reconnect_delay(Duration::from_millis(1)),
            backend.clone(),
        ))
    }

    fn controller_with(config: ControllerConfig, connects: Vec<Connect>) -> SessionController {
        let backend = Arc::new(ScriptedBackend::with_connects(connects));
        SessionController::new(client(&backend), config).with_collaborators(
            Collaborators::default()
                .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme"))),
        )
    }

    fn idle_transport(config: ControllerConfig) -> SessionController {
        controller_with(config, vec![Connect::Hang])
    }

    fn unbuffered() -> ControllerConfig {
        ControllerConfig::default().buffer_tokens(false)
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<String>>,
    }

    impl TelemetrySink for RecordingTelemetry {
        fn track(&self, event: &str, _props: Map<String, Value>) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    struct GatedReports {
        gate: Arc<Notify>,
        result: Result<RunReport, ReportError>,
    }

    #[async_trait::async_trait]
    impl ReportFetcher for GatedReports {
        async fn fetch(&self, _key: &RunKey) -> Result<RunReport, ReportError> {
            self.gate.notified().await;
            self.result.clone()
        }
    }

    struct BrokenRenderer;

    impl MarkdownRenderer for BrokenRenderer {
        fn render(&self, _markdown: &str) -> Result<String, RenderError> {
            Err(RenderError("boom".into()))
        }
    }

    #[test]
    fn only_finished_statuses_are_terminal() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Streaming.is_terminal());
        for status in [
            RunStatus::Done,
            RunStatus::Cancelled,
            RunStatus::Limited,
            RunStatus::Aborted,
            RunStatus::Error,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[tokio::test]
    async fn unbuffered_tokens_apply_immediately_then_done() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        assert_eq!(controller.status(), RunStatus::Streaming);
        assert!(controller.state().started);

        controller.handle_event(RunEvent::Token("Hello ".into()));
        controller.handle_event(RunEvent::Token("World".into()));
        let state = controller.state();
        assert_eq!(state.text, "Hello World");
        assert_eq!(state.metrics.token_count, 2);

        controller.handle_event(RunEvent::Done);
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Done);
        assert!(!state.started);
    }

    #[tokio::test]
    async fn retry_then_resume_updates_flags() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));

        controller.handle_event(RunEvent::Error {
            will_retry: true,
            message: "reset".into(),
        });
        let state = controller.state();
        assert!(state.reconnecting);
        assert_eq!(state.status, RunStatus::Streaming);

        controller.handle_event(RunEvent::Resumed);
        let state = controller.state();
        assert!(!state.reconnecting);
        assert!(state.resumed_once);
        assert_eq!(state.metrics.resume_count, 1);
    }

    #[tokio::test]
    async fn hello_clears_reconnecting() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Error {
            will_retry: true,
            message: "reset".into(),
        });
        controller.handle_event(RunEvent::Hello);
        assert!(!controller.state().reconnecting);
        assert_eq!(controller.state().metrics.resume_count, 0);
    }

    #[tokio::test]
    async fn open_failure_is_terminal_and_restartable() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new(""));
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Error);
        assert!(!state.started);
        assert!(state.error.as_deref().is_some_and(|e| e.contains("route")));

        controller.start(RunRequest::new("triage"));
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Streaming);
        assert!(state.started);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn final_error_is_terminal() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Error {
            will_retry: false,
            message: "gone".into(),
        });
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.error.as_deref(), Some("gone"));
        assert!(!state.reconnecting);
    }

    #[tokio::test]
    async fn illegal_actions_are_noops() {
        let mut controller = idle_transport(unbuffered());
        let before = controller.state();
        controller.stop();
        controller.handle_event(RunEvent::Done);
        assert_eq!(controller.state(), before);

        controller.start(RunRequest::new("triage"));
        let streaming = controller.state();
        controller.start(RunRequest::new("other"));
        controller.reset();
        assert_eq!(controller.state(), streaming);
    }

    #[tokio::test]
    async fn events_after_terminal_are_ignored() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("a".into()));
        controller.handle_event(RunEvent::Limited);
        let finished = controller.state();
        controller.handle_event(RunEvent::Token("b".into()));
        controller.handle_event(RunEvent::Done);
        assert_eq!(controller.state(), finished);
        assert_eq!(finished.status, RunStatus::Limited);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_under_new_generation() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("a".into()));
        controller.handle_event(RunEvent::Cost(0.25));
        controller.handle_event(RunEvent::Aborted);
        let generation = controller.state().generation;

        controller.reset();
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Idle);
        assert!(state.text.is_empty());
        assert_eq!(state.metrics, RunMetrics::default());
        assert_eq!(state.generation, generation + 1);
    }

    #[tokio::test]
    async fn event_ids_are_tracked_without_publishing() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        let revision = controller.state().revision;
        controller.handle_event(RunEvent::EventId("41".into()));
        let state = controller.state();
        assert_eq!(state.revision, revision);
        assert_eq!(state.metrics.last_event_id.as_deref(), Some("41"));
    }

    #[tokio::test]
    async fn token_text_is_normalized() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("a\r\nb\rc".into()));
        assert_eq!(controller.state().text, "a\nb\nc");
    }

    #[tokio::test]
    async fn non_finite_cost_is_skipped() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Cost(1.5));
        controller.handle_event(RunEvent::Cost(f64::NAN));
        assert_eq!(controller.state().metrics.cost, Some(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_tokens_coalesce_into_one_update_per_frame() {
        let mut controller = idle_transport(ControllerConfig::default());
        assert_eq!(
            controller.schedule(),
            FlushSchedule::Frame(Duration::from_millis(16))
        );
        controller.start(RunRequest::new("triage"));
        let revision = controller.state().revision;

        for word in ["one ", "two ", "three ", "four ", "five"] {
            controller.handle_event(RunEvent::Token(word.into()));
        }
        assert_eq!(controller.state().revision, revision);
        assert!(controller.state().text.is_empty());

        assert!(controller.pump().await);
        let state = controller.state();
        assert_eq!(state.revision, revision + 1);
        assert_eq!(state.text, "one two three four five");
        assert_eq!(state.metrics.token_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ttfb_is_written_once_per_run() {
        let mut controller = idle_transport(unbuffered());
        controller.start(RunRequest::new("triage"));
        tokio::time::advance(Duration::from_millis(40)).await;
        controller.handle_event(RunEvent::Token("a".into()));
        tokio::time::advance(Duration::from_millis(100)).await;
        controller.handle_event(RunEvent::Token("b".into()));
        assert_eq!(controller.state().metrics.ttfb_ms, Some(40));

        controller.handle_event(RunEvent::Done);
        controller.start(RunRequest::new("triage"));
        assert_eq!(controller.state().metrics.ttfb_ms, None);
        tokio::time::advance(Duration::from_millis(7)).await;
        controller.handle_event(RunEvent::Token("c".into()));
        assert_eq!(controller.state().metrics.ttfb_ms, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_ttfb_uses_arrival_time_not_flush_time() {
        let mut controller = idle_transport(ControllerConfig::default());
        controller.start(RunRequest::new("triage"));
        tokio::time::advance(Duration::from_millis(25)).await;
        controller.handle_event(RunEvent::Token("a".into()));
        assert!(controller.pump().await);
        assert_eq!(controller.state().metrics.ttfb_ms, Some(25));
    }

    #[tokio::test]
    async fn terminal_event_flushes_buffer_first() {
        let mut controller = idle_transport(ControllerConfig::default());
        controller.start(RunRequest::new("triage"));
        let mut rx = controller.subscribe();
        controller.handle_event(RunEvent::Token("kept ".into()));
        controller.handle_event(RunEvent::Token("text".into()));
        controller.handle_event(RunEvent::Done);

        let state = rx.borrow_and_update().clone();
        assert_eq!(state.status, RunStatus::Done);
        assert_eq!(state.text, "kept text");
        assert_eq!(state.metrics.token_count, 2);
    }

    #[tokio::test]
    async fn microtask_schedule_flushes_on_next_pump() {
        let config = ControllerConfig::default().reduced_motion(true);
        let mut controller = idle_transport(config);
        assert_eq!(controller.schedule(), FlushSchedule::Microtask);
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("a".into()));
        controller.handle_event(RunEvent::Token("b".into()));
        let revision = controller.state().revision;
        assert!(controller.pump().await);
        assert_eq!(controller.state().text, "ab");
        assert_eq!(controller.state().revision, revision + 1);
    }

    #[tokio::test]
    async fn stop_flushes_cancels_and_notifies_server() {
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        backend.push_post_result(Ok(200));
        let mut controller = SessionController::new(client(&backend), ControllerConfig::default())
            .with_collaborators(
                Collaborators::default()
                    .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme"))),
            );
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("partial".into()));

        controller.stop();
        let stopped = controller.state();
        assert_eq!(stopped.status, RunStatus::Cancelled);
        assert_eq!(stopped.text, "partial");
        assert!(!stopped.started);

        controller.stop();
        assert_eq!(controller.state(), stopped);

        for _ in 0..100 {
            if !backend.posts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let posts = backend.posts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].as_str().contains("/cancel?route=triage&sessionId=s-1&org=acme"));
    }

    #[tokio::test]
    async fn stop_survives_failed_cancel_request() {
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        backend.push_post_result(Err(StreamError::transport("offline")));
        let mut controller = SessionController::new(client(&backend), unbuffered());
        controller.start(RunRequest::new("triage").session(SessionKeys::new("s-2", "acme")));
        controller.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.status(), RunStatus::Cancelled);
        controller.start(RunRequest::new("triage").session(SessionKeys::new("s-2", "acme")));
        assert_eq!(controller.status(), RunStatus::Streaming);
    }

    #[tokio::test]
    async fn drive_runs_a_scripted_stream_to_completion() {
        let mut controller = controller_with(
            ControllerConfig::default(),
            vec![Connect::Frames(vec![
                token("Hello ").with_id("1"),
                token("Hello ").with_id("1"),
                SseFrame::new("cost", "0.02").with_id("2"),
                token("World").with_id("3"),
                SseFrame::new("done", "").with_id("4"),
            ])],
        );
        controller.start(RunRequest::new("triage"));
        let state = controller.drive().await;
        assert_eq!(state.status, RunStatus::Done);
        assert_eq!(state.text, "Hello World");
        assert_eq!(state.metrics.token_count, 2);
        assert_eq!(state.metrics.cost, Some(0.02));
        assert_eq!(state.metrics.last_event_id.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn drive_resumes_once_then_fails_on_second_error() {
        let mut controller = controller_with(
            unbuffered(),
            vec![
                Connect::FramesThenError(vec![token("a").with_id("1")], "reset".into()),
                Connect::FramesThenError(vec![token("b").with_id("2")], "reset again".into()),
            ],
        );
        controller.start(RunRequest::new("triage"));
        let state = controller.drive().await;
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.text, "ab");
        assert!(state.resumed_once);
        assert_eq!(state.metrics.resume_count, 1);
        assert!(state.error.as_deref().is_some_and(|e| e.contains("reset again")));
    }

    #[tokio::test]
    async fn server_error_event_ends_the_run_with_its_reason() {
        let mut controller = controller_with(
            unbuffered(),
            vec![Connect::FramesThenHang(vec![
                token("partial").with_id("1"),
                SseFrame::new("error", "upstream failed").with_id("2"),
            ])],
        );
        controller.start(RunRequest::new("triage").retry(RetryPolicy {
            auto_reconnect: false,
            ..RetryPolicy::default()
        }));
        let state = tokio::time::timeout(Duration::from_secs(2), controller.drive())
            .await
            .expect("run should end on the server error");
        assert_eq!(state.status, RunStatus::Error);
        assert!(!state.started);
        assert_eq!(state.text, "partial");
        assert_eq!(
            state.error.as_deref(),
            Some("server reported an error: upstream failed")
        );
    }

    #[tokio::test]
    async fn terminal_side_effects_record_history_report_and_telemetry() {
        let history = Arc::new(MemoryRunHistory::new());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let gate = Arc::new(Notify::new());
        gate.notify_one();
        let reports = Arc::new(GatedReports {
            gate: gate.clone(),
            result: Ok(RunReport::with_summary("all good")),
        });
        let config = unbuffered()
            .record_history(true)
            .fetch_report(true)
            .report_params(true);
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller = SessionController::new(client(&backend), config).with_collaborators(
            Collaborators::default()
                .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme")))
                .with_history(history.clone())
                .with_reports(reports)
                .with_telemetry(telemetry.clone()),
        );
        let mut rx = controller.subscribe();

        controller.start(
            RunRequest::new("triage").scenario(Scenario::default().seed(7).model("small")),
        );
        controller.handle_event(RunEvent::Token("x".into()));
        controller.handle_event(RunEvent::Cost(0.5));
        controller.handle_event(RunEvent::Done);

        let runs = history.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Done);
        assert_eq!(runs[0].cost, Some(0.5));
        assert_eq!(runs[0].seed, Some(7));
        assert_eq!(runs[0].model.as_deref(), Some("small"));
        assert_eq!(runs[0].route, "triage");

        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|state| state.report.is_some()),
        )
        .await
        .expect("report arrives")
        .expect("controller alive")
        .clone();
        assert_eq!(
            state.report.and_then(|r| r.summary).as_deref(),
            Some("all good")
        );
        assert_eq!(
            *telemetry.events.lock().unwrap(),
            vec!["stream_started".to_string(), "stream_finished".to_string()]
        );
    }

    #[tokio::test]
    async fn history_omits_params_unless_enabled() {
        let history = Arc::new(MemoryRunHistory::new());
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller = SessionController::new(client(&backend), unbuffered().record_history(true))
            .with_collaborators(
                Collaborators::default()
                    .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme")))
                    .with_history(history.clone()),
            );
        controller.start(RunRequest::new("triage").scenario(Scenario::default().seed(7)));
        controller.stop();
        let runs = history.runs();
        assert_eq!(runs[0].status, RunStatus::Cancelled);
        assert_eq!(runs[0].seed, None);
    }

    #[tokio::test]
    async fn stale_report_is_discarded_after_reset() {
        let gate = Arc::new(Notify::new());
        let reports = Arc::new(GatedReports {
            gate: gate.clone(),
            result: Ok(RunReport::with_summary("late")),
        });
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller = SessionController::new(client(&backend), unbuffered().fetch_report(true))
            .with_collaborators(
                Collaborators::default()
                    .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme")))
                    .with_reports(reports),
            );
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Done);
        controller.reset();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.state().report, None);
        assert_eq!(controller.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn failed_report_is_ignored() {
        let gate = Arc::new(Notify::new());
        gate.notify_one();
        let reports = Arc::new(GatedReports {
            gate,
            result: Err(ReportError("unavailable".into())),
        });
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller = SessionController::new(client(&backend), unbuffered().fetch_report(true))
            .with_collaborators(Collaborators::default().with_reports(reports));
        controller.start(RunRequest::new("triage").session(SessionKeys::new("s-1", "acme")));
        controller.handle_event(RunEvent::Done);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = controller.state();
        assert_eq!(state.status, RunStatus::Done);
        assert_eq!(state.report, None);
    }

    #[tokio::test]
    async fn markdown_is_rendered_on_every_applied_chunk() {
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller =
            SessionController::new(client(&backend), unbuffered().render_markdown(true))
                .with_collaborators(
                    Collaborators::default()
                        .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme")))
                        .with_markdown(Arc::new(SanitizingMarkdownRenderer)),
                );
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("**bo".into()));
        controller.handle_event(RunEvent::Token("ld**".into()));
        let html = controller.state().html.unwrap_or_default();
        assert!(html.contains("<strong>bold</strong>"));

        controller.handle_event(RunEvent::Token(" <script>".into()));
        controller.handle_event(RunEvent::Done);
        let html = controller.state().html.unwrap_or_default();
        assert!(html.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn render_failure_keeps_previous_html() {
        let backend = Arc::new(ScriptedBackend::with_connects(vec![Connect::Hang]));
        let mut controller =
            SessionController::new(client(&backend), unbuffered().render_markdown(true))
                .with_collaborators(
                    Collaborators::default()
                        .with_session_defaults(Arc::new(StaticSessionDefaults::new("s-1", "acme")))
                        .with_markdown(Arc::new(BrokenRenderer)),
                );
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("text".into()));
        let state = controller.state();
        assert_eq!(state.text, "text");
        assert_eq!(state.html, None);
    }

    #[tokio::test]
    async fn close_drops_pending_flush_and_is_idempotent() {
        let mut controller = idle_transport(ControllerConfig::default());
        controller.start(RunRequest::new("triage"));
        controller.handle_event(RunEvent::Token("never shown".into()));
        controller.close();
        controller.close();
        assert!(!controller.pump().await);
        assert!(controller.state().text.is_empty());
    }
}
