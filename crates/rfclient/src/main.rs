//! Entry point: parses the CLI surface (spec section 6), bootstraps the
//! agent (interface enumeration, IPC connect, port registration), then
//! runs it until a fatal error or an unexpected task exit brings it down.

use clap::Parser;
use rfclient::agent::Agent;
use rfclient::config::Config;
use rfclient::error::Disposition;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = Config::parse();

    let agent = match Agent::bootstrap(&config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    match agent.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.disposition() == Disposition::Fatal {
                error!(error = %e, "agent exiting on fatal error");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}
