//! `weft` runs a workflow graph document from the command line.
//!
//! The final run report is printed to stdout as JSON; with `--events`
//! every execution event is printed first, one envelope per line. Logs go
//! to stderr and follow `RUST_LOG`. Ctrl-C cancels the run and still
//! prints its report.

mod config;

use clap::Parser;
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use weft_workflow::{
    EchoHandler, Engine, Envelope, ExecutionEvent, ExecutionState, ExecutorGateway, RunReport,
};

use crate::config::RunnerConfig;

/// Run a weft workflow graph.
#[derive(Debug, Parser)]
#[command(name = "weft", version, about)]
struct Args {
    /// Path to the graph document (JSON).
    graph: PathBuf,

    /// Run input as a JSON value.
    #[arg(long, default_value = "{}")]
    input: String,

    /// Optional configuration file.
    #[arg(long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Cancel the run after this many milliseconds.
    #[arg(long, value_name = "MS")]
    cancel_after_ms: Option<u64>,

    /// Print execution events as JSON lines before the report.
    #[arg(long)]
    events: bool,
}

#[derive(Debug)]
enum RunnerError {
    Config { message: String },
    Document { message: String },
    Input { message: String },
    Engine { message: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => write!(f, "configuration error: {message}"),
            Self::Document { message } => write!(f, "graph document error: {message}"),
            Self::Input { message } => write!(f, "invalid input: {message}"),
            Self::Engine { message } => write!(f, "engine error: {message}"),
        }
    }
}

impl std::error::Error for RunnerError {}

#[tokio::main]
async fn main() -> ExitCode {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,weft_workflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(error) => warn!(%error, "failed to serialize run report"),
            }
            if report.state == ExecutionState::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<RunReport, Report<RunnerError>> {
    let config = RunnerConfig::load(args.config.as_deref()).map_err(|e| RunnerError::Config {
        message: e.to_string(),
    })?;
    info!("Loaded configuration");

    let document = std::fs::read_to_string(&args.graph).map_err(|e| RunnerError::Document {
        message: format!("{}: {e}", args.graph.display()),
    })?;
    let graph = weft_workflow::parse(&document).map_err(|e| RunnerError::Document {
        message: e.to_string(),
    })?;
    let input: JsonValue = serde_json::from_str(&args.input).map_err(|e| RunnerError::Input {
        message: e.to_string(),
    })?;

    let mut gateway = ExecutorGateway::new().with_fallback(EchoHandler);
    if config.engine.circuit_failure_threshold > 0 {
        gateway = gateway.with_circuit_breaker(
            config.engine.circuit_failure_threshold,
            config.engine.circuit_recovery(),
        );
    }
    let engine = Engine::new(config.engine, gateway);

    let (run_id, receiver) = engine
        .start_with_events(&graph, input)
        .map_err(|e| RunnerError::Engine {
            message: e.to_string(),
        })?;
    info!(%run_id, nodes = graph.node_count(), "run started");

    let printer = args.events.then(|| tokio::spawn(print_events(receiver)));

    let cancel_after = async {
        match args.cancel_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    let wait = engine.wait(run_id);
    tokio::pin!(wait);
    let finished = tokio::select! {
        report = &mut wait => Some(report),
        () = cancel_after => {
            info!(%run_id, "cancel deadline reached");
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!(%run_id, "interrupted");
            None
        }
    };
    let report = match finished {
        Some(report) => report,
        None => {
            if let Err(error) = engine.cancel(run_id) {
                warn!(%error, "cancel was not applied");
            }
            wait.await
        }
    }
    .map_err(|e| RunnerError::Engine {
        message: e.to_string(),
    })?;

    if let Some(printer) = printer
        && let Err(error) = printer.await
    {
        warn!(%error, "event printer stopped abnormally");
    }
    Ok(report)
}

/// Prints envelopes until the run's terminal event.
async fn print_events(mut receiver: broadcast::Receiver<Envelope<ExecutionEvent>>) {
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                match envelope.to_json_line() {
                    Ok(line) => println!("{line}"),
                    Err(error) => warn!(%error, "failed to serialize event"),
                }
                if is_run_end(envelope.payload()) {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event printer lagged behind the run");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn is_run_end(event: &ExecutionEvent) -> bool {
    matches!(
        event,
        ExecutionEvent::RunCompleted { .. }
            | ExecutionEvent::RunFailed { .. }
            | ExecutionEvent::RunCancelled { .. }
    )
}
