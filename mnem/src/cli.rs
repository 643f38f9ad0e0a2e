//! CLI argument definitions using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// mnem - memory lifecycle CLI
///
/// Authenticates against the memory service, keeps a protocol transport
/// healthy and drives memory state transitions.
#[derive(Parser, Debug)]
#[command(name = "mnem")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to <data_dir>/config.toml)
    #[arg(long, global = true, env = "MNEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "MNEM_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Credential management
    Auth(AuthCommand),

    /// Connect to a protocol endpoint (falls back to the direct API)
    Connect {
        /// Try remote endpoints before local ones
        #[arg(short, long)]
        remote: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Memory lifecycle operations
    Memory(MemoryCommand),

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct AuthCommand {
    #[command(subcommand)]
    pub action: AuthAction,
}

#[derive(Subcommand, Debug)]
pub enum AuthAction {
    /// Verify and store an API key
    Login {
        /// API key
        #[arg(env = "MNEM_API_KEY", hide_env_values = true)]
        key: String,
    },

    /// Remove the stored credential
    Logout,

    /// Show authentication status
    Status {
        /// Ignore the cached validation and verify now
        #[arg(short, long)]
        refresh: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct MemoryCommand {
    #[command(subcommand)]
    pub action: MemoryAction,
}

#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Move one memory to a new state
    SetState {
        /// Memory ID
        id: String,

        /// Target state: active, paused, archived, or deleted
        state: String,

        /// Reason recorded in the history
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Apply pause, archive, or delete to several memories
    Bulk {
        /// Operation: pause, archive, or delete
        operation: String,

        /// Memory IDs
        #[arg(required = true)]
        ids: Vec<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Archive active memories created before a date
    ArchiveBefore {
        /// RFC 3339 timestamp or YYYY-MM-DD
        date: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Restore paused or archived memories to active
    Restore {
        /// Memory IDs
        #[arg(required = true)]
        ids: Vec<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show state transitions for a memory, most recent first
    History {
        /// Memory ID
        id: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bulk() {
        let cli = Cli::parse_from(["mnem", "memory", "bulk", "archive", "m1", "m2"]);
        match cli.command {
            Commands::Memory(MemoryCommand {
                action: MemoryAction::Bulk { operation, ids, json },
            }) => {
                assert_eq!(operation, "archive");
                assert_eq!(ids, vec!["m1", "m2"]);
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bulk_requires_ids() {
        assert!(Cli::try_parse_from(["mnem", "memory", "bulk", "pause"]).is_err());
    }

    #[test]
    fn test_parse_connect_remote() {
        let cli = Cli::parse_from(["mnem", "connect", "--remote"]);
        assert!(matches!(cli.command, Commands::Connect { remote: true, json: false }));
    }
}
