//! UDS JSON-RPC client for CLI subcommands and the arbiter's push sink.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use trackcast_arbiter::dispatcher::{PushSink, SinkError};
use trackcast_core::types::{ClearRequest, HistoryEntry, PushRequest};

pub(crate) async fn rpc_call(
    socket_path: &str,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: serde_json::Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        anyhow::bail!("RPC error: {error}");
    }

    Ok(response["result"].clone())
}

// ─── Push Sink ────────────────────────────────────────────────────

/// The dispatcher's sink: one RPC connection per request against the
/// companion's push socket.
#[derive(Debug, Clone)]
pub struct CompanionClient {
    socket_path: String,
}

impl CompanionClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }
}

impl PushSink for CompanionClient {
    async fn push(&self, request: PushRequest) -> Result<(), SinkError> {
        let params =
            serde_json::to_value(&request).map_err(|e| SinkError::Rejected(e.to_string()))?;
        rpc_call(&self.socket_path, "push", params)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Unreachable(e.to_string()))
    }

    async fn clear(&self, request: ClearRequest) -> Result<(), SinkError> {
        let params =
            serde_json::to_value(&request).map_err(|e| SinkError::Rejected(e.to_string()))?;
        rpc_call(&self.socket_path, "clear", params)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Unreachable(e.to_string()))
    }
}

// ─── CLI Commands ─────────────────────────────────────────────────

/// `trackcast status` — print arbiter and companion health side by side.
pub async fn cmd_status(arbiter_socket: &str, companion_socket: &str) -> anyhow::Result<()> {
    match rpc_call(arbiter_socket, "status", serde_json::json!({})).await {
        Ok(status) => {
            let canonical = status["canonical"].as_str().unwrap_or("-");
            println!(
                "arbiter: up  canonical={canonical} tracked={} candidates={}",
                status["tracked_sessions"], status["candidates"],
            );
        }
        Err(_) => println!("arbiter: down"),
    }

    match rpc_call(companion_socket, "health", serde_json::json!({})).await {
        Ok(health) => {
            let ready = health["ready"].as_bool().unwrap_or(false);
            println!(
                "companion: up  presence={}",
                if ready { "ready" } else { "not ready" }
            );
        }
        Err(_) => println!("companion: down"),
    }

    Ok(())
}

/// `trackcast history` — print the played-track log, newest last.
pub async fn cmd_history(companion_socket: &str) -> anyhow::Result<()> {
    let result = rpc_call(companion_socket, "history", serde_json::json!({})).await?;
    let entries: Vec<HistoryEntry> = serde_json::from_value(result)?;

    if entries.is_empty() {
        println!("no history yet");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {} — {}  [{}]  {}s",
            entry.played_at.format("%Y-%m-%d %H:%M"),
            entry.artist,
            entry.title,
            entry.source,
            entry.total_listened_ms / 1_000,
        );
    }
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────
