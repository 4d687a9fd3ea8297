//! Resumable event-stream transport.
//!
//! `StreamClient::open` validates its input, spawns one connection task per
//! handle and returns immediately. The task owns the connection, the last
//! processed event id and the retry counter; the handle owns the receiving
//! side of the event channel and the lifecycle switch.
//!
//! Protocol per connection:
//! - frames whose id equals the last processed id are dropped;
//! - the first frame after a reconnect is preceded by one `Resumed` event;
//! - a terminal frame is delivered and the connection is torn down;
//! - a server `error` frame ends the connection like a transport failure;
//! - on a connection error an error event with `will_retry` is always sent,
//!   and at most `max_retries` resumes are attempted over the handle's life,
//!   each after the fixed reconnect delay and carrying `lastEventId`.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::backend::{HttpBackend, StreamBackend};
use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::events::{JobEvent, RunEvent};
use crate::feed::{Decoded, Feed, JobFeed, RunFeed, cancel_url, stream_url};
use crate::model::{JobStreamOptions, RetryPolicy, RunKey, StreamOptions};
use crate::sse::SseFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
    Cancelled,
}

/// Server answer to a cancel request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The server accepted the cancellation.
    Acknowledged,
    /// The run had already finished or was cancelled earlier.
    AlreadyFinished,
}

impl CancelOutcome {
    fn from_status(status: u16) -> Result<Self, StreamError> {
        match status {
            200..=299 => Ok(Self::Acknowledged),
            404 | 409 | 410 => Ok(Self::AlreadyFinished),
            status => Err(StreamError::Status {
                status,
                body: String::new(),
            }),
        }
    }
}

/// Opens run and job streams against one server.
#[derive(Clone)]
pub struct StreamClient {
    backend: Arc<dyn StreamBackend>,
    config: Arc<ClientConfig>,
}

impl StreamClient {
    /// Creates a client backed by `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self, StreamError> {
        let backend = HttpBackend::new(&config)?;
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Creates a client from `RUNSTREAM_*` environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Creates a client over a custom backend.
    pub fn with_backend(config: ClientConfig, backend: Arc<dyn StreamBackend>) -> Self {
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a run stream.
    ///
    /// Only malformed input fails here; connection problems arrive as
    /// `RunEvent::Error` on the returned handle. Must be called inside a
    /// tokio runtime.
    pub fn open(&self, options: StreamOptions) -> Result<StreamHandle<RunEvent>, StreamError> {
        self.open_feed(RunFeed::new(options.key, options.scenario), options.retry)
    }

    /// Opens a job-progress stream.
    pub fn open_jobs(
        &self,
        options: JobStreamOptions,
    ) -> Result<StreamHandle<JobEvent>, StreamError> {
        self.open_feed(JobFeed::new(options.job_id, options.org), options.retry)
    }

    /// Sends a cancel request for a run without holding its stream handle.
    pub async fn cancel_run(&self, key: RunKey) -> Result<CancelOutcome, StreamError> {
        let feed = RunFeed::new(key, Default::default());
        feed.validate()?;
        let url = cancel_url(&self.config, &feed)?;
        send_cancel(self.backend.clone(), url).await
    }

    /// Sends a cancel request for a job without holding its stream handle.
    pub async fn cancel_job(
        &self,
        job_id: &str,
        org: &str,
    ) -> Result<CancelOutcome, StreamError> {
        let feed = JobFeed::new(job_id, org);
        feed.validate()?;
        let url = cancel_url(&self.config, &feed)?;
        send_cancel(self.backend.clone(), url).await
    }

    fn open_feed<F: Feed>(
        &self,
        feed: F,
        policy: RetryPolicy,
    ) -> Result<StreamHandle<F::Event>, StreamError> {
        feed.validate()?;
        let first_url = stream_url(&self.config, &feed, None)?;
        let cancel_url = cancel_url(&self.config, &feed)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StreamError::Config("stream handles must be opened inside a tokio runtime".into())
        })?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Open);
        info!(feed = feed.label(), url = %first_url, "opening stream");

        let driver = Driver {
            feed,
            backend: self.backend.clone(),
            reconnect_delay: self.config.reconnect_delay,
            policy,
            tx,
            lifecycle: lifecycle_rx,
            cursor: EventCursor::default(),
            retries: 0,
        };
        let config = self.config.clone();
        runtime.spawn(driver.run(config, first_url));

        Ok(StreamHandle {
            rx,
            lifecycle: lifecycle_tx,
            backend: self.backend.clone(),
            cancel_url,
        })
    }
}

/// Receiving end of one logical stream.
///
/// Dropping the handle closes it.
pub struct StreamHandle<E> {
    rx: mpsc::Receiver<E>,
    lifecycle: watch::Sender<Lifecycle>,
    backend: Arc<dyn StreamBackend>,
    cancel_url: Url,
}

impl<E> StreamHandle<E> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the stream finished or the handle was closed or
    /// cancelled; events still queued at that point are never delivered.
    pub async fn next_event(&mut self) -> Option<E> {
        if self.is_closed() {
            return None;
        }
        self.rx.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_next_event(&mut self) -> Option<E> {
        if self.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Whether `close` or `cancel` has been called.
    pub fn is_closed(&self) -> bool {
        *self.lifecycle.borrow() != Lifecycle::Open
    }

    /// Tears the stream down locally without telling the server.
    pub fn close(&self) {
        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Open {
                *state = Lifecycle::Closed;
                return true;
            }
            false
        });
    }

    /// Tears the stream down locally, suppresses any pending resume, and
    /// returns the request that tells the server to stop the run.
    ///
    /// The local teardown happens before this returns. The returned future
    /// may be awaited, spawned, or dropped; its error only describes the
    /// advisory network request and never affects the handle.
    pub fn cancel(&self) -> BoxFuture<'static, Result<CancelOutcome, StreamError>> {
        let first = self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Cancelled {
                return false;
            }
            *state = Lifecycle::Cancelled;
            true
        });
        debug!(url = %self.cancel_url, first, "cancelling stream");
        send_cancel(self.backend.clone(), self.cancel_url.clone()).boxed()
    }
}

impl<E> Drop for StreamHandle<E> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_cancel(
    backend: Arc<dyn StreamBackend>,
    url: Url,
) -> Result<CancelOutcome, StreamError> {
    let status = backend.post(url).await?;
    CancelOutcome::from_status(status)
}

/// Frames accepted from one connection, in delivery order.
#[derive(Debug, PartialEq)]
struct Dispatch<E> {
    events: Vec<E>,
    terminal: bool,
    failure: Option<String>,
}

/// Resume and dedup bookkeeping of one logical stream.
#[derive(Debug, Default)]
struct EventCursor {
    last_event_id: Option<String>,
    resume_pending: bool,
}

impl EventCursor {
    fn accept<F: Feed>(&mut self, feed: &F, frame: SseFrame) -> Dispatch<F::Event> {
        if let Some(id) = frame.id.as_deref()
            && self.last_event_id.as_deref() == Some(id)
        {
            trace!(feed = feed.label(), event_id = id, "dropping duplicate frame");
            return Dispatch {
                events: Vec::new(),
                terminal: false,
                failure: None,
            };
        }

        let mut events = Vec::with_capacity(3);
        if self.resume_pending {
            self.resume_pending = false;
            events.push(feed.resumed());
        }
        if let Some(id) = frame.id.clone() {
            self.last_event_id = Some(id.clone());
            events.push(feed.event_id(id));
        }
        let mut dispatch = Dispatch {
            events,
            terminal: false,
            failure: None,
        };
        match feed.decode(&frame) {
            Decoded::Event(event) => dispatch.events.push(event),
            Decoded::Terminal(event) => {
                dispatch.events.push(event);
                dispatch.terminal = true;
            }
            Decoded::Failed(message) => dispatch.failure = Some(message),
            Decoded::Skip => {}
        }
        dispatch
    }
}

enum ConnectionEnd {
    /// Terminal event delivered, or the handle went away.
    Finished,
    Failed(String),
}

struct Driver<F: Feed> {
    feed: F,
    backend: Arc<dyn StreamBackend>,
    reconnect_delay: Duration,
    policy: RetryPolicy,
    tx: mpsc::Sender<F::Event>,
    lifecycle: watch::Receiver<Lifecycle>,
    cursor: EventCursor,
    retries: u32,
}

impl<F: Feed> Driver<F> {
    async fn run(mut self, config: Arc<ClientConfig>, first_url: Url) {
        let mut url = first_url;
        loop {
            let message = match self.run_connection(url).await {
                ConnectionEnd::Finished => break,
                ConnectionEnd::Failed(message) => message,
            };
            if self.lifecycle_state() == Lifecycle::Closed {
                break;
            }

            let will_retry = self.policy.auto_reconnect
                && self.lifecycle_state() != Lifecycle::Cancelled
                && self.retries < self.policy.max_retries;
            warn!(
                feed = self.feed.label(),
                retries = self.retries,
                will_retry,
                error = %message,
                "stream connection failed"
            );
            let event = self.feed.transport_error(will_retry, message);
            if !self.emit(event).await || !will_retry {
                break;
            }

            self.retries += 1;
            self.cursor.resume_pending = true;
            if !self.pause(self.reconnect_delay).await {
                break;
            }
            url = match stream_url(&config, &self.feed, self.cursor.last_event_id.as_deref()) {
                Ok(url) => url,
                Err(err) => {
                    let event = self.feed.transport_error(false, err.to_string());
                    let _ = self.emit(event).await;
                    break;
                }
            };
            info!(
                feed = self.feed.label(),
                event_id = ?self.cursor.last_event_id,
                retries = self.retries,
                "resuming stream"
            );
        }
        debug!(feed = self.feed.label(), "stream task finished");
    }

    async fn run_connection(&mut self, url: Url) -> ConnectionEnd {
        let backend = self.backend.clone();
        let connected = tokio::select! {
            biased;
            _ = wait_closed(&mut self.lifecycle) => return ConnectionEnd::Finished,
            connected = backend.connect(url) => connected,
        };
        let mut frames = match connected {
            Ok(frames) => frames,
            Err(err) => return ConnectionEnd::Failed(err.to_string()),
        };

        if let Some(event) = self.feed.on_open()
            && !self.emit(event).await
        {
            return ConnectionEnd::Finished;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_closed(&mut self.lifecycle) => return ConnectionEnd::Finished,
                next = frames.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return ConnectionEnd::Failed(err.to_string()),
                None => {
                    return ConnectionEnd::Failed(
                        "event stream ended before a terminal event".into(),
                    );
                }
            };

            let dispatch = self.cursor.accept(&self.feed, frame);
            for event in dispatch.events {
                if !self.emit(event).await {
                    return ConnectionEnd::Finished;
                }
            }
            if let Some(message) = dispatch.failure {
                return ConnectionEnd::Failed(message);
            }
            if dispatch.terminal {
                debug!(feed = self.feed.label(), "terminal event received");
                return ConnectionEnd::Finished;
            }
        }
    }

    fn lifecycle_state(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    async fn emit(&self, event: F::Event) -> bool {
        if self.lifecycle_state() != Lifecycle::Open {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.lifecycle) => false,
            _ = tokio::time::sleep(delay) => self.lifecycle_state() == Lifecycle::Open,
        }
    }
}

/// Resolves once the handle leaves `Open` or is dropped.
async fn wait_closed(lifecycle: &mut watch::Receiver<Lifecycle>) {
    let _ = lifecycle.wait_for(|state| *state != Lifecycle::Open).await;
}
