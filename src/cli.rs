//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Sentinel - policy-enforcing gateway between callers and the cloud STS.
#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML).
    #[arg(short, long, env = "SENTINEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SENTINEL_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (pretty, json).
    #[arg(long, env = "SENTINEL_LOG_FORMAT")]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the local credential server (C12) until a shutdown signal.
    ///
    /// Performs one orchestrator request up front to obtain the initial
    /// session, then mints the bearer token the server hands back to the
    /// caller alongside its bind address; local tools read that token to
    /// authenticate subsequent `/role-arn/<arn>` calls.
    Serve {
        #[arg(long)]
        user: String,
        #[arg(long)]
        profile: String,
        #[arg(long)]
        role_arn: String,
        #[arg(long)]
        device_id: Option<String>,
        /// Where to write the minted bearer token, for the local tool that
        /// spawned this server to read.
        #[arg(long)]
        token_out: Option<PathBuf>,
    },

    /// One-shot credential request (spec §6 CLI invocation).
    Request {
        /// The requesting user's identifier.
        #[arg(long)]
        user: String,
        /// The profile being requested.
        #[arg(long)]
        profile: String,
        /// The role ARN to assume.
        #[arg(long)]
        role_arn: String,
        /// Stable device identifier, for device-bound session tracking.
        #[arg(long)]
        device_id: Option<String>,
    },

    /// Activate break-glass emergency access (spec §4.4, §4.12).
    BreakGlass {
        #[arg(long)]
        invoker: String,
        #[arg(long)]
        profile: String,
        #[arg(long)]
        role_arn: String,
        /// One of: incident, maintenance, security, recovery, other.
        #[arg(long)]
        reason_code: String,
        #[arg(long)]
        justification: String,
        /// Requested duration, in minutes (capped at 4h per spec §3).
        #[arg(long)]
        duration_minutes: i64,
        #[arg(long)]
        mfa_challenge_id: String,
        #[arg(long)]
        mfa_code: String,
    },
}
