//! Resumable Server-Sent Events client for streamed runs, plus a session
//! controller that folds the stream into one observable run state.
//!
//! The transport opens `{base}/stream` (or `{base}/jobs/stream`), suppresses
//! duplicate event ids, resumes once from the last processed id after a
//! connection error, and cancels through the companion `cancel` endpoint.
//! The controller buffers tokens into frame-sized updates and applies the
//! run's side effects (history, report, telemetry, markdown).
//!
//! # Driving a run
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runstream_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let client = Arc::new(StreamClient::new(ClientConfig::new("http://localhost:8787/api"))?);
//! let mut controller = SessionController::new(client, ControllerConfig::default());
//!
//! controller.start(RunRequest::new("triage").scenario(Scenario::default().seed(42)));
//! let state = controller.drive().await;
//!
//! println!("{} ({} tokens): {}", state.status, state.metrics.token_count, state.text);
//! # Ok(())
//! # }
//! ```

/// Incremental HTTP backend and the backend seam used by the transport.
pub mod backend;
/// Client and controller configuration.
pub mod config;
/// Session controller, run state and flush scheduling.
pub mod controller;
/// Public error types.
pub mod errors;
/// Typed run and job events.
pub mod events;
/// Event vocabularies and their endpoints.
pub mod feed;
/// Run history recorders.
pub mod history;
/// Sanitizing markdown rendering.
pub mod markdown;
/// Run keys, scenario parameters and stream options.
pub mod model;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Post-run reports.
pub mod report;
/// Session key defaults.
pub mod session;
/// Server-Sent Events decoding.
pub mod sse;
/// Telemetry sinks.
pub mod telemetry;
/// Stream client, handles and cancellation.
pub mod transport;

#[cfg(test)]
mod testing;

pub use backend::{FrameStream, HttpBackend, StreamBackend};
pub use config::{ClientConfig, ControllerConfig};
pub use controller::{
    Collaborators, FlushSchedule, RunMetrics, RunRequest, RunState, RunStatus, SessionController,
    StreamOpener,
};
pub use errors::{HistoryError, RenderError, ReportError, StreamError};
pub use events::{JobEvent, JobProgress, RunEvent};
pub use feed::{Feed, JobFeed, RunFeed};
pub use history::{JsonlRunHistory, MemoryRunHistory, RunHistory, RunSummary};
pub use markdown::{MarkdownRenderer, SanitizingMarkdownRenderer};
pub use model::{JobStreamOptions, RetryPolicy, RunKey, Scenario, StreamOptions};
pub use observability::init_observability;
pub use report::{ReportFetcher, RunReport};
pub use session::{EnvSessionDefaults, SessionDefaults, SessionKeys, StaticSessionDefaults};
pub use sse::{SseDecoder, SseFrame};
pub use telemetry::{NoopTelemetry, TelemetrySink, TracingTelemetry};
pub use transport::{CancelOutcome, StreamClient, StreamHandle};
