//! The worker subprocess launched by the effect runner.
//!
//! One protocol stream per process: framed commands on stdin, framed
//! events on stdout, human-readable diagnostics on stderr. The verb names
//! the task the worker is willing to start; the single positional argument
//! carries the serialized options list.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use hercules_effects_core::StartingVerb;
use hercules_effects_runner::worker::{serve, WorkerOptions};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Store worker for the effect runner.
#[derive(Parser, Debug)]
#[command(name = "hercules-effects-worker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Task this worker will accept: `build` or `nix-daemon`.
    verb: StartingVerbArg,

    /// JSON list of `[key, value]` option pairs.
    options: String,

    /// Log level for stderr diagnostics (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Verbs this binary serves.
///
/// Evaluation needs a walker linked by the embedding agent; it has no CLI
/// surface here.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StartingVerbArg {
    /// Realise derivations.
    Build,
    /// Serve a store-daemon proxy socket.
    NixDaemon,
}

impl From<StartingVerbArg> for StartingVerb {
    fn from(verb: StartingVerbArg) -> Self {
        match verb {
            StartingVerbArg::Build => Self::Build,
            StartingVerbArg::NixDaemon => Self::NixDaemon,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // stdout belongs to the protocol; all diagnostics go to stderr.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker failed");
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let options =
        WorkerOptions::from_json_arg(&args.options).context("malformed options argument")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(serve(
        args.verb.into(),
        &options,
        tokio::io::stdin(),
        tokio::io::stdout(),
    ))?;
    Ok(())
}
