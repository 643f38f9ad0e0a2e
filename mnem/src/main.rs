//! mnem - memory lifecycle CLI
//!
//! Thin command surface over `mnem-core`: every command builds the context
//! once, runs, and shuts background tasks down before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use mnem_core::{MnemConfig, MnemContext};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("mnem=info".parse()?);
    let (json_layer, text_layer) = if cli.log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    if let Commands::Version = cli.command {
        println!("mnem {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => MnemConfig::load_from(path),
        None => MnemConfig::load(),
    }
    .context("Failed to load configuration")?;

    let ctx = MnemContext::from_config(&config).context("Failed to initialize mnem")?;

    // Execute command
    let result = match cli.command {
        Commands::Auth(cmd) => commands::auth::execute(cmd, &ctx).await,
        Commands::Connect { remote, json } => commands::connect::execute(remote, json, &ctx).await,
        Commands::Memory(cmd) => commands::memory::execute(cmd, &ctx).await,
        Commands::Version => Ok(()),
    };

    ctx.shutdown().await;
    result
}
