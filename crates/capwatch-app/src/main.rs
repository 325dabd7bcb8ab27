#![warn(missing_docs)]
//! # capwatch binary
//!
//! Background entry point for the monitored-capture agent.

use std::process::ExitCode;
use std::time::Duration;

use capwatch_app::{AgentConfig, AppError, app_version, init_logging, run_agent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// CLI entry point.
fn main() -> ExitCode {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("capwatch {}: {error}", app_version());
            return ExitCode::FAILURE;
        }
    };

    let _logging = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("capwatch {}: {error}", app_version());
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(stage = "agent", action = "startup_failed", %error);
            ExitCode::FAILURE
        }
    }
}

fn run(config: AgentConfig) -> Result<(), AppError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let cancel = CancellationToken::new();
    let result = runtime.block_on(async {
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!(stage = "agent", action = "shutdown_requested");
                    signal_cancel.cancel();
                }
                Err(error) => warn!(stage = "agent", action = "signal_unavailable", %error),
            }
        });
        run_agent(config, cancel).await
    });

    // A pending consent prompt sits on the blocking pool and must not hold the exit.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
