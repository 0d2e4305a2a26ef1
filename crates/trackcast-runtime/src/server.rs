//! UDS JSON-RPC servers: minimal hand-rolled implementation.
//! Connection-per-request, newline-delimited JSON.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use chrono::Utc;

use trackcast_core::types::{CandidateDescriptor, ClearRequest, NormalizedRecord, PatternRule, PushRequest};

use crate::arbiter::ArbiterShared;
use crate::companion::CompanionCommand;

/// Bind a listener, evicting a stale socket left by a dead process.
/// Socket directory is 0700, the socket itself 0600.
async fn bind_socket(socket_path: &str) -> anyhow::Result<UnixListener> {
    let socket_dir = std::path::Path::new(socket_path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;

    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if std::path::Path::new(socket_path).exists() {
        if UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale socket at {socket_path}");
        } else {
            anyhow::bail!("another daemon is already running at {socket_path}");
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

async fn read_request(stream: &mut UnixStream) -> anyhow::Result<serde_json::Value> {
    let (reader, _) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
}

async fn write_response(
    stream: &mut UnixStream,
    id: serde_json::Value,
    result: Result<serde_json::Value, String>,
) -> anyhow::Result<()> {
    let response = match result {
        Ok(result) => serde_json::json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": id,
        }),
        Err(message) => serde_json::json!({
            "jsonrpc": "2.0",
            "error": {"code": -32600, "message": message},
            "id": id,
        }),
    };
    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    stream.write_all(out.as_bytes()).await?;
    Ok(())
}

// ─── Companion Server ─────────────────────────────────────────────

/// Push/clear/health/history endpoint for the companion process.
pub async fn run_companion_server(
    socket_path: &str,
    tx: mpsc::Sender<CompanionCommand>,
) -> anyhow::Result<()> {
    let listener = bind_socket(socket_path).await?;
    tracing::info!("companion server listening on {socket_path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_companion_connection(stream, tx).await {
                tracing::debug!("connection error: {e}");
            }
        });
    }
}

async fn handle_companion_connection(
    mut stream: UnixStream,
    tx: mpsc::Sender<CompanionCommand>,
) -> anyhow::Result<()> {
    let request = read_request(&mut stream).await?;
    let method = request["method"].as_str().unwrap_or("");
    let id = request["id"].clone();

    let result = match method {
        "push" => match serde_json::from_value::<PushRequest>(request["params"].clone()) {
            Ok(push) => {
                tx.send(CompanionCommand::Push(push)).await?;
                Ok(serde_json::json!({"ok": true}))
            }
            Err(e) => Err(format!("invalid push request: {e}")),
        },
        "clear" => match serde_json::from_value::<ClearRequest>(request["params"].clone()) {
            Ok(clear) => {
                tx.send(CompanionCommand::Clear(clear)).await?;
                Ok(serde_json::json!({"ok": true}))
            }
            Err(e) => Err(format!("invalid clear request: {e}")),
        },
        "health" => {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(CompanionCommand::Health(reply_tx)).await?;
            let ready = reply_rx.await.unwrap_or(false);
            Ok(serde_json::json!({"ready": ready}))
        }
        "history" => {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(CompanionCommand::History(reply_tx)).await?;
            let entries = reply_rx.await.unwrap_or_default();
            Ok(serde_json::to_value(entries)?)
        }
        _ => Err(format!("method not found: {method}")),
    };

    write_response(&mut stream, id, result).await
}

// ─── Arbiter Server ───────────────────────────────────────────────

/// Ingest/status endpoint for the arbiter process. The external parser
/// layer reports candidate snapshots and per-session records here.
pub async fn run_arbiter_server(
    socket_path: &str,
    shared: Arc<ArbiterShared>,
) -> anyhow::Result<()> {
    let listener = bind_socket(socket_path).await?;
    tracing::info!("arbiter server listening on {socket_path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = handle_arbiter_connection(stream, shared).await {
                tracing::debug!("connection error: {e}");
            }
        });
    }
}

async fn handle_arbiter_connection(
    mut stream: UnixStream,
    shared: Arc<ArbiterShared>,
) -> anyhow::Result<()> {
    let request = read_request(&mut stream).await?;
    let method = request["method"].as_str().unwrap_or("");
    let id = request["id"].clone();

    let result = match method {
        "report_candidates" => {
            match serde_json::from_value::<Vec<CandidateDescriptor>>(
                request["params"]["candidates"].clone(),
            ) {
                Ok(candidates) => {
                    shared.ingest.report_candidates(candidates);
                    Ok(serde_json::json!({"ok": true}))
                }
                Err(e) => Err(format!("invalid candidates: {e}")),
            }
        }
        "report_record" => {
            let session_id = request["params"]["session_id"].as_str().unwrap_or("");
            if session_id.is_empty() {
                Err("missing session_id".to_string())
            } else {
                match serde_json::from_value::<NormalizedRecord>(
                    request["params"]["record"].clone(),
                ) {
                    Ok(record) => {
                        shared.ingest.report_record(session_id, record, Utc::now());
                        Ok(serde_json::json!({"ok": true}))
                    }
                    Err(e) => Err(format!("invalid record: {e}")),
                }
            }
        }
        "set_rules" => {
            match serde_json::from_value::<Vec<PatternRule>>(request["params"]["rules"].clone()) {
                Ok(rules) => {
                    tracing::info!("rule set replaced ({} rules)", rules.len());
                    shared.rules.update(rules);
                    Ok(serde_json::json!({"ok": true}))
                }
                Err(e) => Err(format!("invalid rules: {e}")),
            }
        }
        "status" => {
            let canonical = shared.store.canonical_id().await;
            let tracked = shared.store.len().await;
            Ok(serde_json::json!({
                "ready": true,
                "canonical": canonical,
                "tracked_sessions": tracked,
                "candidates": shared.ingest.candidate_count(),
                "rules": shared.rules.current().len(),
            }))
        }
        _ => Err(format!("method not found: {method}")),
    };

    write_response(&mut stream, id, result).await
}

// ─── Tests ────────────────────────────────────────────────────────
