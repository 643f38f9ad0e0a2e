//! Protocol endpoint connection.

use anyhow::Result;
use colored::Colorize;
use mnem_core::MnemContext;
use mnem_core::transport::ConnectOptions;

/// Connect and report which route requests will take.
pub async fn execute(remote: bool, json: bool, ctx: &MnemContext) -> Result<()> {
    if !json {
        let preference = if remote { "remote" } else { "local" };
        println!("{} Connecting (preferring {} endpoints)...", "→".cyan(), preference);
    }

    let outcome = ctx
        .connect(ConnectOptions {
            prefer_remote: remote,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.transport_active {
        println!(
            "{} Connected to {} ({})",
            "✓".green(),
            outcome.endpoint.as_deref().unwrap_or("endpoint").cyan(),
            outcome.mode
        );
    } else {
        println!(
            "{} No protocol endpoint reachable; requests will use the direct API.",
            "⚠".yellow()
        );
        if let Some(error) = ctx.connection().status().last_error {
            println!("  Last error: {}", error.dimmed());
        }
    }

    Ok(())
}
