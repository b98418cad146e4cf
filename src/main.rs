mod autocomplete;
mod build;
mod cli;
mod codesystem;
mod error;
mod icd;
mod index;
mod matcher;
mod namaste;
mod server;
mod services;
mod storage;
mod token;

#[cfg(test)]
mod testutil;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before the subscriber so RUST_LOG can come from .env.
    let dotenv = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match dotenv {
        Ok(path) => tracing::info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {
            tracing::info!("No .env file found, using process environment")
        }
        Err(e) => tracing::warn!("Ignoring .env: {}", e),
    }

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Build(cmd) => build::run(cmd).await.context("build failed"),
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
        cli::Command::Match(cmd) => run_match(cmd).await.context("match failed"),
    }
}

async fn run_match(opts: cli::MatchArgs) -> anyhow::Result<()> {
    let services = services::Services::from_args(&opts.storage, &opts.remote)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let matches = services.autocomplete.find(&cancel, &opts.query).await?;
    println!("{}", serde_json::to_string_pretty(&matches)?);
    Ok(())
}
