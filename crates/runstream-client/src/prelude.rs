//! Common imports for typical usage.
pub use crate::{
    CancelOutcome, ClientConfig, Collaborators, ControllerConfig, JobEvent, JobStreamOptions,
    RunEvent, RunKey, RunRequest, RunState, RunStatus, Scenario, SessionController, SessionKeys,
    StreamClient, StreamError, StreamHandle, StreamOptions,
};
