use clap::{Parser, Subcommand};
use uuid::Uuid;

/// registry-authz: permission and access-token authorization service
#[derive(Parser)]
#[command(name = "registry-authz", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to AUTHZ_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Issue session credentials
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Operate on access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Print a signed session token for a user
    Issue {
        #[arg(long)]
        user_id: Uuid,
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Drop the cached permissions of a token
    Purge {
        #[arg(long)]
        id: Uuid,
    },
    /// Delete a token and its cached permissions
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

// ── Tests ───────────────────────────────────────────────────────
