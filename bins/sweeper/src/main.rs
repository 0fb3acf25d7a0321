//! Transfer storage sweeper
//!
//! Constructs the configured storage backend once and purges uploads older
//! than the retention period on a fixed interval. Pass `--once` to run a
//! single sweep and exit.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transfer_core::storage::{
    AuthorizationPrompt, BackendOptions, Storage, StorageError, StorageResult, from_settings,
};
use transfer_shared::AppConfig;

/// Purge expired uploads from the configured storage backend.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

/// Reads the Google Drive authorization code from the terminal.
struct TerminalPrompt;

#[async_trait]
impl AuthorizationPrompt for TerminalPrompt {
    async fn authorization_code(&self, consent_url: &str) -> StorageResult<String> {
        println!("Go to the following link in your browser, then type the authorization code:\n{consent_url}");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        let code = line.trim();
        if code.is_empty() {
            return Err(StorageError::Unauthorized("no authorization code entered".into()));
        }
        Ok(code.to_string())
    }
}

async fn sweep(storage: &dyn Storage, max_age: std::time::Duration) {
    let started = std::time::Instant::now();
    match storage.purge(max_age).await {
        Ok(()) => info!(
            backend = %storage.kind(),
            elapsed_ms = started.elapsed().as_millis(),
            "Sweep complete"
        ),
        Err(err) => error!(backend = %storage.kind(), error = %err, "Sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transfer_core=debug,transfer_sweeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = AppConfig::load()?;
    let Some(max_age) = config.purge.max_age() else {
        warn!("Purging disabled (purge.days = 0), nothing to do");
        return Ok(());
    };

    // Construct the backend once
    let options = BackendOptions::default()
        .with_retention(Some(max_age))
        .with_authorizer(Arc::new(TerminalPrompt));
    let storage = from_settings(&config.storage, options).await?;
    info!(
        provider = config.storage.name(),
        days = config.purge.days,
        interval_hours = config.purge.interval_hours,
        "Sweeper started"
    );

    if args.once {
        sweep(storage.as_ref(), max_age).await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(config.purge.interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(storage.as_ref(), max_age).await,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received, stopping sweeper");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["transfer-sweeper"], false)]
    #[case(&["transfer-sweeper", "--once"], true)]
    fn test_args(#[case] argv: &[&str], #[case] once: bool) {
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.once, once);
    }

    #[rstest]
    #[case(&["transfer-sweeper", "--onc"])]
    #[case(&["transfer-sweeper", "once"])]
    #[case(&["transfer-sweeper", "--once=yes"])]
    fn test_rejects_unknown_args(#[case] argv: &[&str]) {
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_args_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
