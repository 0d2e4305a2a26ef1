//! Companion process: push/health server + reconcile loop.
//!
//! The UDS server forwards requests into the reconcile loop over a channel;
//! the loop owns the connection manager, the reconciler, and the history
//! recorder outright, so `ActivityState` and `ConnectionState` are mutated
//! from exactly one place.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, interval};

use chrono::{TimeDelta, Utc};

use trackcast_core::retry::ReconnectPolicy;
use trackcast_core::types::{ClearRequest, HistoryEntry, PushRequest};
use trackcast_presence::connection::ConnectionManager;
use trackcast_presence::history::{HistoryLog, HistoryRecorder, JsonlHistoryLog};
use trackcast_presence::reconcile::{ActivityReconciler, ReconcilerConfig};
use trackcast_presence::transport::TransportFactory;

use crate::cli::{CompanionOpts, default_companion_socket, default_history_path};
use crate::server;
use crate::transport::RuntimeTransportFactory;

/// Requests forwarded from the UDS server into the reconcile loop.
pub enum CompanionCommand {
    Push(PushRequest),
    Clear(ClearRequest),
    Health(oneshot::Sender<bool>),
    History(oneshot::Sender<Vec<HistoryEntry>>),
}

/// Run the companion: starts the push server and the reconcile loop, waits
/// for a shutdown signal.
pub async fn run_companion(opts: CompanionOpts) -> anyhow::Result<()> {
    let socket_path = opts
        .socket
        .clone()
        .unwrap_or_else(default_companion_socket);
    let history_path = opts
        .history_file
        .clone()
        .unwrap_or_else(default_history_path);

    let recorder = HistoryRecorder::new(JsonlHistoryLog::new(&history_path), opts.dwell_secs);
    let reconciler = ActivityReconciler::new(
        ReconcilerConfig {
            min_update_interval: TimeDelta::seconds(opts.min_update_secs as i64),
            auto_clear_after: TimeDelta::seconds(opts.auto_clear_secs as i64),
            ..ReconcilerConfig::default()
        },
        recorder,
    );
    let conn = ConnectionManager::new(
        RuntimeTransportFactory::new(opts.presence_socket.clone()),
        ReconnectPolicy {
            connect_timeout_ms: opts.connect_timeout_ms,
            retry_delay_ms: opts.retry_delay_ms,
            ..ReconnectPolicy::default()
        },
    );

    let (tx, rx) = mpsc::channel::<CompanionCommand>(64);

    let server_socket = socket_path.clone();
    let server_tx = tx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_companion_server(&server_socket, server_tx).await {
            tracing::error!("companion server error: {e}");
        }
    });

    let tick = Duration::from_millis(opts.tick_interval_ms);
    let loop_handle = tokio::spawn(companion_loop(reconciler, conn, rx, tick));

    tokio::select! {
        () = shutdown_signal() => {}
        _ = server_handle => {
            tracing::warn!("companion server exited unexpectedly");
        }
        _ = loop_handle => {
            tracing::warn!("reconcile loop exited unexpectedly");
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("companion stopped");
    Ok(())
}

/// The reconcile loop: single owner of all companion-side state.
pub(crate) async fn companion_loop<L, F>(
    mut reconciler: ActivityReconciler<L>,
    mut conn: ConnectionManager<F>,
    mut rx: mpsc::Receiver<CompanionCommand>,
    tick_interval: Duration,
) where
    L: HistoryLog,
    F: TransportFactory,
{
    let mut ticker = interval(tick_interval);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    tracing::info!("command channel closed, stopping reconcile loop");
                    return;
                };
                let now = Utc::now();
                match command {
                    CompanionCommand::Push(request) => {
                        reconciler.handle_push(request, &mut conn, now).await;
                    }
                    CompanionCommand::Clear(request) => {
                        reconciler
                            .handle_clear(&request.session_id, &mut conn, now)
                            .await;
                    }
                    CompanionCommand::Health(reply) => {
                        let _ = reply.send(conn.is_ready());
                    }
                    CompanionCommand::History(reply) => {
                        let entries = reconciler
                            .recorder()
                            .log()
                            .read_all()
                            .unwrap_or_else(|e| {
                                tracing::warn!("history read failed: {e}");
                                Vec::new()
                            });
                        let _ = reply.send(entries);
                    }
                }
            }
            _ = ticker.tick() => {
                reconciler.tick(&mut conn, Utc::now()).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}

// ─── Tests ────────────────────────────────────────────────────────
