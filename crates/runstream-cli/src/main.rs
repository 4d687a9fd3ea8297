//! runstream CLI
//!
//! Streams a run to the terminal, tails a job feed, or cancels a run from the
//! command line. Settings not given as flags are read from the environment
//! (and from `.env` when present).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use runstream_client::init_observability;

mod commands;

/// Terminal client for resumable run and job event streams.
#[derive(Parser, Debug)]
#[command(name = "runstream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL the stream and cancel endpoints are joined onto
    #[arg(long, env = "RUNSTREAM_BASE_URL", global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a run and stream its output to stdout
    Run(RunArgs),
    /// Follow a background job until it finishes
    Jobs(JobArgs),
    /// Ask the server to cancel a run
    Cancel(CancelArgs),
    /// Ask the server to cancel a job
    CancelJob(CancelJobArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    route: String,

    /// Session id; a random one is used when absent
    #[arg(long, env = "RUNSTREAM_SESSION_ID")]
    session_id: Option<String>,

    #[arg(long, env = "RUNSTREAM_ORG")]
    org: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    budget: Option<f64>,

    #[arg(long)]
    model: Option<String>,

    /// Apply every token immediately instead of once per frame
    #[arg(long)]
    no_buffer: bool,

    /// Do not resume after a dropped connection
    #[arg(long)]
    no_reconnect: bool,

    /// Print sanitized HTML of the final output instead of streaming text
    #[arg(long)]
    markdown: bool,

    /// Append a summary of the run to this JSON-lines file
    #[arg(long)]
    history: Option<PathBuf>,

    /// Print the final run state as JSON instead of streaming text
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct JobArgs {
    #[arg(long)]
    job_id: String,

    #[arg(long, env = "RUNSTREAM_ORG", default_value = "demo")]
    org: String,

    /// Do not resume after a dropped connection
    #[arg(long)]
    no_reconnect: bool,
}

#[derive(Args, Debug)]
struct CancelArgs {
    #[arg(long)]
    route: String,

    #[arg(long, env = "RUNSTREAM_SESSION_ID")]
    session_id: String,

    #[arg(long, env = "RUNSTREAM_ORG", default_value = "demo")]
    org: String,
}

#[derive(Args, Debug)]
struct CancelJobArgs {
    #[arg(long)]
    job_id: String,

    #[arg(long, env = "RUNSTREAM_ORG", default_value = "demo")]
    org: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();

    let cli = Cli::parse();
    let client = match commands::client(cli.base_url.as_deref()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run(args) => commands::run(client, args).await,
        Command::Jobs(args) => commands::jobs(&client, args).await,
        Command::Cancel(args) => commands::cancel(&client, args).await,
        Command::CancelJob(args) => commands::cancel_job(&client, args).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
