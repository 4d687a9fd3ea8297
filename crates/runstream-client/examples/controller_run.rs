use std::sync::Arc;

use runstream_client::prelude::*;
use runstream_client::{SanitizingMarkdownRenderer, TracingTelemetry, init_observability};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    init_observability();
    let client = Arc::new(StreamClient::from_env()?);

    let mut controller = SessionController::new(
        client,
        ControllerConfig::from_env().render_markdown(true),
    )
    .with_collaborators(
        Collaborators::default()
            .with_markdown(Arc::new(SanitizingMarkdownRenderer))
            .with_telemetry(Arc::new(TracingTelemetry)),
    );

    controller.start(RunRequest::new("demo"));
    let state = controller.drive().await;

    println!("{}", state.html.unwrap_or(state.text));
    eprintln!(
        "status={} tokens={} ttfb_ms={:?} resumes={}",
        state.status, state.metrics.token_count, state.metrics.ttfb_ms, state.metrics.resume_count
    );
    Ok(())
}
