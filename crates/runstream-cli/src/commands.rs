use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use runstream_client::prelude::*;
use runstream_client::{
    EnvSessionDefaults, JobProgress, JsonlRunHistory, RetryPolicy, SanitizingMarkdownRenderer,
    SessionDefaults as _, TracingTelemetry,
};
use tracing::{debug, info};

use crate::{CancelArgs, CancelJobArgs, JobArgs, RunArgs};

/// Failure of one CLI command.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The final run state could not be printed as JSON.
    #[error("failed to encode run state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) fn client(base_url: Option<&str>) -> Result<StreamClient, StreamError> {
    match base_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => StreamClient::new(ClientConfig::new(url).apply_env()),
        None => StreamClient::from_env(),
    }
}

/// Exit code for a finished run.
fn run_exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Done | RunStatus::Cancelled => ExitCode::SUCCESS,
        RunStatus::Limited => ExitCode::from(2),
        RunStatus::Aborted => ExitCode::from(3),
        RunStatus::Error | RunStatus::Idle | RunStatus::Streaming => ExitCode::FAILURE,
    }
}

fn session_keys(args: &RunArgs) -> SessionKeys {
    let defaults = EnvSessionDefaults::new().session_keys();
    SessionKeys::new(
        args.session_id.clone().unwrap_or(defaults.session_id),
        args.org.clone().unwrap_or(defaults.org),
    )
}

fn scenario(args: &RunArgs) -> Scenario {
    Scenario {
        seed: args.seed,
        budget: args.budget,
        model: args.model.clone(),
    }
}

fn retry(no_reconnect: bool) -> RetryPolicy {
    RetryPolicy {
        auto_reconnect: !no_reconnect,
        ..RetryPolicy::default()
    }
}

pub(crate) async fn run(client: StreamClient, args: RunArgs) -> Result<ExitCode, CliError> {
    let mut config = ControllerConfig::from_env();
    if args.no_buffer {
        config = config.buffer_tokens(false);
    }
    let mut collaborators =
        Collaborators::default().with_telemetry(Arc::new(TracingTelemetry));
    if args.markdown {
        config = config.render_markdown(true);
        collaborators = collaborators.with_markdown(Arc::new(SanitizingMarkdownRenderer));
    }
    if let Some(path) = &args.history {
        config = config.record_history(true).report_params(true);
        collaborators = collaborators.with_history(Arc::new(JsonlRunHistory::new(path)));
    }

    let keys = session_keys(&args);
    info!(route = %args.route, session_id = %keys.session_id, org = %keys.org, "starting run");
    let mut controller =
        SessionController::new(Arc::new(client), config).with_collaborators(collaborators);
    controller.start(
        RunRequest::new(args.route.clone())
            .scenario(scenario(&args))
            .session(keys)
            .retry(retry(args.no_reconnect)),
    );

    let stream_text = !args.json && !args.markdown;
    let mut printed = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut stdout = std::io::stdout();

    while !controller.status().is_terminal() {
        let progressed = tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                None
            }
            progressed = controller.pump() => Some(progressed),
        };
        match progressed {
            None => {
                eprintln!("\ninterrupted; cancelling run");
                controller.stop();
            }
            Some(false) => break,
            Some(true) => {}
        }

        if stream_text {
            let state = controller.state();
            if state.text.len() > printed {
                let _ = write!(stdout, "{}", &state.text[printed..]);
                let _ = stdout.flush();
                printed = state.text.len();
            }
        }
    }

    let state = controller.state();
    controller.close();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        if args.markdown {
            println!("{}", state.html.as_deref().unwrap_or(&state.text));
        } else if !state.text.ends_with('\n') {
            println!();
        }
        eprintln!(
            "status={} tokens={} ttfb_ms={} cost={} resumes={}",
            state.status,
            state.metrics.token_count,
            state
                .metrics
                .ttfb_ms
                .map_or_else(|| "-".to_string(), |ms| ms.to_string()),
            state
                .metrics
                .cost
                .map_or_else(|| "-".to_string(), |cost| format!("{cost:.4}")),
            state.metrics.resume_count,
        );
        if let Some(error) = &state.error {
            eprintln!("error: {error}");
        }
    }
    Ok(run_exit_code(state.status))
}

fn describe_progress(progress: &JobProgress) -> String {
    match (progress.percent, progress.message.as_deref()) {
        (Some(percent), Some(message)) => format!("progress {percent:.0}%: {message}"),
        (Some(percent), None) => format!("progress {percent:.0}%"),
        (None, Some(message)) => format!("progress: {message}"),
        (None, None) => "progress".to_string(),
    }
}

pub(crate) async fn jobs(client: &StreamClient, args: JobArgs) -> Result<ExitCode, CliError> {
    let mut options = JobStreamOptions::new(args.job_id, args.org);
    options.retry = retry(args.no_reconnect);
    let mut handle = client.open_jobs(options)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut code = ExitCode::FAILURE;
    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("interrupted; cancelling job");
                match handle.cancel().await {
                    Ok(outcome) => debug!(?outcome, "job cancel request finished"),
                    Err(e) => eprintln!("cancel request failed: {e}"),
                }
                break;
            }
            event = handle.next_event() => event,
        };
        let Some(event) = event else {
            break;
        };
        let terminal = event.is_terminal();
        match event {
            JobEvent::Queued => println!("queued"),
            JobEvent::Running => println!("running"),
            JobEvent::Progress(progress) => println!("{}", describe_progress(&progress)),
            JobEvent::Failed(reason) => {
                println!("failed: {}", reason.as_deref().unwrap_or("no reason given"));
                code = ExitCode::FAILURE;
            }
            JobEvent::Done => {
                println!("done");
                code = ExitCode::SUCCESS;
            }
            JobEvent::Cancelled => {
                println!("cancelled");
                code = ExitCode::SUCCESS;
            }
            JobEvent::Error {
                will_retry,
                message,
            } => eprintln!("stream error (retrying: {will_retry}): {message}"),
            JobEvent::Resumed => eprintln!("resumed"),
            JobEvent::EventId(id) => debug!(event_id = %id, "job event id"),
        }
        if terminal {
            break;
        }
    }
    Ok(code)
}

fn describe_outcome(outcome: CancelOutcome) -> &'static str {
    match outcome {
        CancelOutcome::Acknowledged => "acknowledged",
        CancelOutcome::AlreadyFinished => "already finished",
    }
}

pub(crate) async fn cancel(
    client: &StreamClient,
    args: CancelArgs,
) -> Result<ExitCode, CliError> {
    let outcome = client
        .cancel_run(RunKey::new(args.route, args.session_id, args.org))
        .await?;
    println!("{}", describe_outcome(outcome));
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn cancel_job(
    client: &StreamClient,
    args: CancelJobArgs,
) -> Result<ExitCode, CliError> {
    let outcome = client.cancel_job(&args.job_id, &args.org).await?;
    println!("{}", describe_outcome(outcome));
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_descriptions_cover_partial_payloads() {
        let both = JobProgress {
            percent: Some(42.4),
            message: Some("indexing".into()),
        };
        assert_eq!(describe_progress(&both), "progress 42%: indexing");
        assert_eq!(describe_progress(&JobProgress::default()), "progress");
    }

    #[test]
    fn exit_codes_flag_caller_actionable_states() {
        assert_eq!(run_exit_code(RunStatus::Done), ExitCode::SUCCESS);
        assert_eq!(run_exit_code(RunStatus::Cancelled), ExitCode::SUCCESS);
        assert_eq!(run_exit_code(RunStatus::Limited), ExitCode::from(2));
        assert_eq!(run_exit_code(RunStatus::Error), ExitCode::FAILURE);
    }

    #[test]
    fn encode_failures_are_reported_as_cli_errors() {
        let err = CliError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert!(matches!(err, CliError::Encode(_)));
        assert!(err.to_string().starts_with("failed to encode run state"));

        let err = CliError::from(StreamError::Config("missing base url".into()));
        assert_eq!(err.to_string(), "config error: missing base url");
    }

    #[test]
    fn retry_flag_disables_reconnect_only() {
        let policy = retry(true);
        assert!(!policy.auto_reconnect);
        assert_eq!(policy.max_retries, 1);
    }
}
