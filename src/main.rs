//! API gateway data plane.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ http (axum front) ──▶ proxy engine ──▶ route chain ──▶ client pool ──▶ Backend
//!                                        ▲              (auth, bbr,      (discovery,
//!                                        │               breaker, ...)    balancing)
//!                                   atomic swap
//!                                        │
//!   config file ──▶ watcher (digest) ──▶ snapshot compiler
//! ```

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "api-gateway")]
#[command(about = "Hot-reloading API gateway data plane", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Validate and compile the configuration, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.check {
        let config = api_gateway::lifecycle::startup::check(&cli.config).await?;
        println!(
            "{}: ok ({} routes, {} services)",
            cli.config.display(),
            config.routes.len(),
            config.services.len()
        );
        return Ok(());
    }

    api_gateway::lifecycle::run(&cli.config).await?;
    Ok(())
}
