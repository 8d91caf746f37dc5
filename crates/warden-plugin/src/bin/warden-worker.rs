//! Worker process for plugins loaded at sandbox level `process` or `full`.
//!
//! Reads requests from stdin and answers on stdout; logs go to stderr.

use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match warden_plugin::process::serve(std::io::stdin().lock(), std::io::stdout().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
