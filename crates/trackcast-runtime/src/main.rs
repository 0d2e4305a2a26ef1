//! trackcast: media-session arbitration + presence synchronization.
//! Two cooperating daemons (arbiter, companion) plus one-shot CLI
//! commands, all in a single binary.

use clap::Parser;

mod arbiter;
mod cli;
mod client;
mod companion;
mod server;
mod transport;

fn init_tracing() {
    let filter = std::env::var("TRACKCAST_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    match args.command {
        cli::Command::Arbiter(opts) => {
            init_tracing();
            tracing::info!("trackcast arbiter starting");
            arbiter::run_arbiter(opts).await?;
        }
        cli::Command::Companion(opts) => {
            init_tracing();
            tracing::info!("trackcast companion starting");
            companion::run_companion(opts).await?;
        }
        cli::Command::Status(opts) => {
            let arbiter_socket = opts.socket.unwrap_or_else(cli::default_arbiter_socket);
            let companion_socket = opts
                .companion_socket
                .unwrap_or_else(cli::default_companion_socket);
            client::cmd_status(&arbiter_socket, &companion_socket).await?;
        }
        cli::Command::History(opts) => {
            let companion_socket = opts
                .companion_socket
                .unwrap_or_else(cli::default_companion_socket);
            client::cmd_history(&companion_socket).await?;
        }
    }

    Ok(())
}
