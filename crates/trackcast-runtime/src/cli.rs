//! CLI definition using clap derive.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trackcast", about = "media session arbitration and presence sync")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the arbitration daemon (candidate ingest + polling loop)
    Arbiter(ArbiterOpts),
    /// Run the presence companion (push server + reconcile loop)
    Companion(CompanionOpts),
    /// Show arbiter and companion health
    Status(StatusOpts),
    /// Print the played-track history (newest last)
    History(HistoryOpts),
}

#[derive(clap::Args)]
pub struct ArbiterOpts {
    /// Ingest/status socket path (default: per-user runtime dir)
    #[arg(long)]
    pub socket: Option<String>,

    /// Companion socket to push synchronized state to
    #[arg(long)]
    pub companion_socket: Option<String>,

    /// Arbitration poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Liveness probe timeout in milliseconds
    #[arg(long, default_value = "800")]
    pub probe_timeout_ms: u64,

    /// Debounce window before an update fires, in milliseconds
    #[arg(long, default_value = "500")]
    pub debounce_ms: u64,

    /// Consecutive failed probes before a session is treated as absent
    #[arg(long, default_value = "3")]
    pub stuck_threshold: u32,

    /// Sessions unobserved for this many seconds are deleted
    #[arg(long, default_value = "60")]
    pub stale_after_secs: u64,

    /// JSON file with the enabled pattern rules; without it a single
    /// match-everything rule is used
    #[arg(long)]
    pub rules_file: Option<String>,
}

#[derive(clap::Args)]
pub struct CompanionOpts {
    /// Push/health socket path (default: per-user runtime dir)
    #[arg(long)]
    pub socket: Option<String>,

    /// Socket of the remote presence endpoint; without it activity updates
    /// are logged instead of sent
    #[arg(long)]
    pub presence_socket: Option<String>,

    /// Reconcile tick interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub tick_interval_ms: u64,

    /// Minimum continuous play time before a track enters history, seconds
    #[arg(long, default_value = "25")]
    pub dwell_secs: u64,

    /// Clear presence after this many seconds without an incoming signal
    #[arg(long, default_value = "60")]
    pub auto_clear_secs: u64,

    /// Minimum seconds between pushes of an identical payload
    #[arg(long, default_value = "15")]
    pub min_update_secs: u64,

    /// Delay between presence connect attempts, milliseconds
    #[arg(long, default_value = "2000")]
    pub retry_delay_ms: u64,

    /// Bound on a single presence connect attempt, milliseconds
    #[arg(long, default_value = "10000")]
    pub connect_timeout_ms: u64,

    /// History log path (default: per-user data dir)
    #[arg(long)]
    pub history_file: Option<String>,
}

#[derive(clap::Args)]
pub struct StatusOpts {
    #[arg(long)]
    pub socket: Option<String>,
    #[arg(long)]
    pub companion_socket: Option<String>,
}

#[derive(clap::Args)]
pub struct HistoryOpts {
    #[arg(long)]
    pub companion_socket: Option<String>,
}

/// Per-user runtime directory for sockets.
fn runtime_dir() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/trackcast");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/trackcast-{user}")
}

pub fn default_arbiter_socket() -> String {
    format!("{}/arbiterd.sock", runtime_dir())
}

pub fn default_companion_socket() -> String {
    format!("{}/companiond.sock", runtime_dir())
}

/// Default history log location under the user's data dir.
pub fn default_history_path() -> String {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return format!("{dir}/trackcast/history.jsonl");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.local/share/trackcast/history.jsonl");
    }
    format!("{}/history.jsonl", runtime_dir())
}
