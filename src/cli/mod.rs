use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "opsguard")]
#[command(author = "Opsguard Team")]
#[command(version)]
#[command(about = "Rate limits and tamper-evident audit logging for privileged commands", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output; with `audit verify`, list each failing line
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory for config, state and audit log
    #[arg(long, global = true, env = "OPSGUARD_HOME")]
    pub home: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rate limit commands
    Limits {
        #[command(subcommand)]
        command: LimitCommands,
    },

    /// Audit log commands
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
pub enum LimitCommands {
    /// Show usage for every configured command
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whether a command may run now
    Check {
        /// Command name
        command: String,

        /// Look without recording the call
        #[arg(long)]
        no_increment: bool,
    },

    /// Record a call, failing with exit code 2 when over the limit
    Enforce {
        /// Command name
        command: String,
    },

    /// Clear recorded calls
    Reset {
        /// Only this command (default: all)
        #[arg(short, long)]
        command: Option<String>,

        /// Required; resets are refused without it
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify every signature in the audit log
    Verify {
        /// Only entries from the last N hours
        #[arg(long)]
        hours: Option<u64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Append a signed event
    Log {
        /// Event type, e.g. DEPLOY_STARTED
        event_type: String,

        /// Event details as a JSON object
        #[arg(short, long)]
        details: Option<String>,

        /// Severity (info, warning, error, critical)
        #[arg(short, long, default_value = "info")]
        severity: String,
    },

    /// Show the most recent entries
    Tail {
        /// Number of entries
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
    },

    /// Replace the signing key, keeping the old one for verification
    RotateKey,
}
