//! keel language server binary.
//!
//! This binary serves the Language Server Protocol over stdio. Logs go to
//! stderr since stdout carries the protocol stream.

use clap::Parser;
use keel::SessionConfig;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "keel=info,keel_files=info,keel_lsp=info";

/// Language server for keel workspaces.
#[derive(Debug, Parser)]
#[command(name = "keel-lsp", version, about)]
struct Args {
    /// Number of full diagnostics passes that may run at once.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    diagnostics_concurrency: u16,

    /// Seconds shutdown waits for in-flight work to release its snapshots.
    #[arg(long, default_value_t = 5)]
    drain_timeout: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            diagnostics_concurrency: usize::from(self.diagnostics_concurrency),
            drain_timeout: Duration::from_secs(self.drain_timeout),
            ..SessionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting keel-lsp");

    keel_lsp::serve(tokio::io::stdin(), tokio::io::stdout(), args.session_config()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_session_defaults() {
        let args = Args::parse_from(["keel-lsp"]);
        assert_eq!(args.session_config(), SessionConfig::default());
    }

    #[test]
    fn concurrency_is_configurable() {
        let args = Args::parse_from(["keel-lsp", "--diagnostics-concurrency", "4"]);
        assert_eq!(args.session_config().diagnostics_concurrency, 4);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(Args::try_parse_from(["keel-lsp", "--diagnostics-concurrency", "0"]).is_err());
    }
}
