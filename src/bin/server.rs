use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sws::policy::Quanta;
use sws::Policy;

#[derive(Debug, Parser)]
#[command(name = "server", version)]
#[command(about = "Serve files to many clients at once under a chosen scheduling policy", long_about = None)]
struct Args {
    /// TCP port to listen on.
    port: u16,
    /// Scheduling policy: RR, SJF or MLFB.
    #[arg(value_parser = parse_policy)]
    policy: Policy,
    /// Directory to serve files from.
    #[arg(long, value_name = "DIR", default_value = ".")]
    root: PathBuf,
    /// Maximum number of requests in flight.
    #[arg(long = "max-requests", default_value_t = 64)]
    max_requests: usize,
    /// Round robin quantum, and the level 0 feedback quantum, in bytes.
    #[arg(long, value_name = "BYTES")]
    quantum: Option<u64>,
}

fn parse_policy(s: &str) -> Result<Policy, String> {
    s.parse().map_err(|err: sws::Error| err.to_string())
}

fn config_from_args(args: &Args) -> sws::Config {
    let mut quanta = Quanta::default();

    if let Some(quantum) = args.quantum {
        quanta.round_robin = quantum;
        // Keep the levels non-decreasing
        quanta.feedback_levels[0] = quantum.min(quanta.feedback_levels[1]);
    }

    sws::Config {
        policy: args.policy,
        quanta,
        root: args.root.clone(),
        rcb_count_max: args.max_requests,
        ..Default::default()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config_from_args(&args);

    let mut server = match sws::Server::bind(("0.0.0.0", args.port), config) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(addr = %server.local_addr(), "listening");

    // Runs until the process is killed
    let shutdown = AtomicBool::new(false);

    match server.run(&shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server loop terminated");
            ExitCode::FAILURE
        }
    }
}
