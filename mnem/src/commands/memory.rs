//! Memory lifecycle commands.
//!
//! Bulk commands always print a per-id ledger; a failing id never hides the
//! outcome of the others.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use colored::Colorize;
use mnem_core::MnemContext;
use mnem_core::types::{BulkOperation, BulkOperationResult, MemoryState, StateTransition};

use crate::cli::{MemoryAction, MemoryCommand};

/// Execute memory command.
pub async fn execute(cmd: MemoryCommand, ctx: &MnemContext) -> Result<()> {
    match cmd.action {
        MemoryAction::SetState { id, state, reason } => {
            set_state(&id, &state, reason.as_deref(), ctx).await
        }
        MemoryAction::Bulk {
            operation,
            ids,
            json,
        } => bulk(&operation, &ids, json, ctx).await,
        MemoryAction::ArchiveBefore { date, json } => archive_before(&date, json, ctx).await,
        MemoryAction::Restore { ids, json } => restore(&ids, json, ctx).await,
        MemoryAction::History { id, json } => history(&id, json, ctx),
    }
}

fn parse_state(state: &str) -> Result<MemoryState> {
    MemoryState::from_str(state).ok_or_else(|| {
        anyhow!(
            "Invalid state: {}. Use: active, paused, archived, or deleted",
            state
        )
    })
}

/// Accept a full RFC 3339 timestamp or a bare date (midnight UTC).
fn parse_cutoff(date: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(date) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| anyhow!("Invalid date: {}. Use YYYY-MM-DD or RFC 3339", date))?;
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("Invalid date: {}", date))
}

async fn set_state(id: &str, state: &str, reason: Option<&str>, ctx: &MnemContext) -> Result<()> {
    let target = parse_state(state)?;
    let transition = ctx.update_memory_state(id, target, reason).await?;

    println!(
        "{} {}: {} → {}",
        "✓".green(),
        id.bold(),
        transition.from_state,
        transition.to_state.to_string().cyan()
    );
    if let Some(reason) = &transition.reason {
        println!("  Reason: {}", reason);
    }
    Ok(())
}

async fn bulk(operation: &str, ids: &[String], json: bool, ctx: &MnemContext) -> Result<()> {
    let operation: BulkOperation = operation.parse().map_err(|e: String| anyhow!(e))?;
    let results = ctx.bulk_update_state(ids, operation).await;
    report(operation.as_str(), &results, json)
}

async fn archive_before(date: &str, json: bool, ctx: &MnemContext) -> Result<()> {
    let cutoff = parse_cutoff(date)?;
    let results = ctx.lifecycle().archive_older_than(cutoff).await?;

    if results.is_empty() && !json {
        println!(
            "{} No active memories created before {}",
            "⚠".yellow(),
            cutoff.format("%Y-%m-%d %H:%M:%S UTC")
        );
        return Ok(());
    }
    report("archive", &results, json)
}

async fn restore(ids: &[String], json: bool, ctx: &MnemContext) -> Result<()> {
    let results = ctx.lifecycle().restore(ids).await;
    report("restore", &results, json)
}

fn history(id: &str, json: bool, ctx: &MnemContext) -> Result<()> {
    let transitions = ctx.get_history(id);

    if json {
        println!("{}", serde_json::to_string_pretty(&transitions)?);
        return Ok(());
    }

    if transitions.is_empty() {
        println!("{} No recorded transitions for {}", "⚠".yellow(), id);
        return Ok(());
    }

    println!("{} {} transitions for {}:", "✓".green(), transitions.len(), id.bold());
    println!();
    for transition in &transitions {
        print_transition(transition);
    }
    Ok(())
}

/// Print the per-id ledger, then fail the command if any id failed.
fn report(operation: &str, results: &[BulkOperationResult], json: bool) -> Result<()> {
    let failed = results.iter().filter(|r| !r.success).count();

    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        for result in results {
            print_result(result);
        }
        println!();
        println!(
            "{} {}: {} succeeded, {} failed",
            if failed == 0 { "✓".green() } else { "⚠".yellow() },
            operation,
            (results.len() - failed).to_string().green(),
            failed.to_string().red()
        );
    }

    if failed > 0 {
        bail!("{} of {} memories failed to {}", failed, results.len(), operation);
    }
    Ok(())
}

fn state_label(state: Option<MemoryState>) -> String {
    state.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_result(result: &BulkOperationResult) {
    if result.is_noop() {
        println!(
            "  {} {}  already {}",
            "·".dimmed(),
            result.memory_id,
            state_label(result.new_state).dimmed()
        );
    } else if result.success {
        println!(
            "  {} {}  {} → {}",
            "✓".green(),
            result.memory_id,
            state_label(result.previous_state),
            state_label(result.new_state).cyan()
        );
    } else {
        println!(
            "  {} {}  {}",
            "✗".red(),
            result.memory_id,
            result.error.as_deref().unwrap_or("failed").red()
        );
    }
}

fn print_transition(transition: &StateTransition) {
    println!(
        "  {} {} → {}  by {}",
        transition.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        transition.from_state,
        transition.to_state.to_string().cyan(),
        transition.actor_id
    );
    if let Some(reason) = &transition.reason {
        println!("     {}", reason);
    }
}
