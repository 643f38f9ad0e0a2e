//! Credential commands.

use anyhow::{bail, Result};
use colored::Colorize;
use mnem_core::MnemContext;
use mnem_core::session::{AuthState, AuthStatus, VerificationOutcome};

use crate::cli::{AuthAction, AuthCommand};

/// Execute auth command.
pub async fn execute(cmd: AuthCommand, ctx: &MnemContext) -> Result<()> {
    match cmd.action {
        AuthAction::Login { key } => login(&key, ctx).await,
        AuthAction::Logout => logout(ctx),
        AuthAction::Status { refresh, json } => status(refresh, json, ctx).await,
    }
}

/// Verify the key remotely and store it only if accepted.
async fn login(key: &str, ctx: &MnemContext) -> Result<()> {
    println!("{} Verifying credential...", "→".cyan());
    let result = ctx.session().login(key).await?;

    if result.valid {
        println!("{} Login successful!", "✓".green());
        println!("  Method:   {}", result.method);
        println!("  Verified: {}", result.endpoint.cyan());
        return Ok(());
    }

    let reason = result.reason.unwrap_or_default();
    match result.outcome {
        VerificationOutcome::Rejected => {
            println!("{} Credential rejected: {}", "✗".red(), reason);
            bail!("Login failed");
        }
        _ => {
            println!("{} Could not verify credential: {}", "⚠".yellow(), reason);
            println!("  Nothing was stored. Try again once the service is reachable.");
            bail!("Login not completed");
        }
    }
}

fn logout(ctx: &MnemContext) -> Result<()> {
    ctx.session().logout()?;
    println!("{} Logged out. Stored credential removed.", "✓".green());
    Ok(())
}

async fn status(refresh: bool, json: bool, ctx: &MnemContext) -> Result<()> {
    let status = if refresh {
        ctx.session().refresh().await
    } else {
        ctx.is_authenticated().await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&status);

    let snapshot = ctx.session().snapshot();
    if snapshot.failure_count > 0 {
        println!(
            "  Consecutive failures: {} (backoff {}s)",
            snapshot.failure_count.to_string().yellow(),
            ctx.session().current_delay().as_secs()
        );
    }
    if let Some(cached) = snapshot.cached {
        println!(
            "  Last verified: {} via {}",
            cached.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            cached.endpoint
        );
    }
    if status.needs_login() {
        println!("  Run {} to authenticate.", "mnem auth login <KEY>".cyan());
    }

    Ok(())
}

fn print_status(status: &AuthStatus) {
    let (icon, label) = match status.state {
        AuthState::Authenticated => ("✓".green(), "Authenticated".green()),
        AuthState::Offline => ("⚠".yellow(), "Authenticated (offline)".yellow()),
        AuthState::Unknown => ("?".yellow(), "Unknown".yellow()),
        AuthState::Unauthenticated => ("✗".red(), "Not authenticated".red()),
    };
    println!("{} {}", icon, label);
    if let Some(reason) = &status.reason {
        println!("  {}", reason.dimmed());
    }
}
