//! Concrete presence transports for the companion process.
//!
//! `UdsPresenceTransport` speaks newline-delimited JSON-RPC to a presence
//! endpoint over a persistent unix socket; any IO failure marks the handle
//! disconnected so the connection manager re-enters its retry loop. With no
//! endpoint configured, `LogTransport` renders activity into the log — a
//! dry-run mode that keeps the whole pipeline observable.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use trackcast_core::types::NormalizedRecord;
use trackcast_presence::transport::{PresenceTransport, TransportError, TransportFactory};

// ─── UDS Transport ────────────────────────────────────────────────

pub struct UdsPresenceTransport {
    socket_path: String,
    stream: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
    next_id: u64,
    disconnected: bool,
}

impl UdsPresenceTransport {
    fn new(socket_path: String) -> Self {
        Self {
            socket_path,
            stream: None,
            next_id: 1,
            disconnected: false,
        }
    }

    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let Some((reader, writer)) = self.stream.as_mut() else {
            return Err(TransportError::Closed);
        };
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        let mut line = request.to_string();
        line.push('\n');

        let io_result = async {
            writer.write_all(line.as_bytes()).await?;
            let mut response = String::new();
            let n = reader.read_line(&mut response).await?;
            Ok::<_, std::io::Error>((n, response))
        }
        .await;

        let (n, response) = match io_result {
            Ok(ok) => ok,
            Err(e) => {
                self.drop_stream();
                return Err(TransportError::SendFailed(e.to_string()));
            }
        };
        if n == 0 {
            self.drop_stream();
            return Err(TransportError::Closed);
        }

        let response: serde_json::Value = serde_json::from_str(response.trim())
            .map_err(|e| TransportError::SendFailed(format!("bad response: {e}")))?;
        if let Some(error) = response.get("error") {
            return Err(TransportError::SendFailed(error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.disconnected = true;
    }
}

impl PresenceTransport for UdsPresenceTransport {
    async fn login(&mut self) -> Result<(), TransportError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let (read, write) = stream.into_split();
        self.stream = Some((BufReader::new(read), write));
        self.disconnected = false;

        match self.call("login", serde_json::json!({})).await {
            Ok(_) => Ok(()),
            Err(TransportError::SendFailed(e)) => Err(TransportError::LoginRejected(e)),
            Err(e) => Err(e),
        }
    }

    async fn set_activity(&mut self, record: &NormalizedRecord) -> Result<(), TransportError> {
        let params = serde_json::json!({ "record": record });
        self.call("set_activity", params).await.map(|_| ())
    }

    async fn clear_activity(&mut self) -> Result<(), TransportError> {
        self.call("clear_activity", serde_json::json!({})).await.map(|_| ())
    }

    fn take_disconnect(&mut self) -> bool {
        std::mem::take(&mut self.disconnected)
    }
}

// ─── Log Transport (dry run) ──────────────────────────────────────

/// Renders presence updates into the tracing log instead of a remote
/// endpoint. Always connected.
#[derive(Debug, Default)]
pub struct LogTransport;

impl PresenceTransport for LogTransport {
    async fn login(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_activity(&mut self, record: &NormalizedRecord) -> Result<(), TransportError> {
        tracing::info!(
            "now playing: {} — {} [{}]",
            record.artist,
            record.title,
            record.source_label()
        );
        Ok(())
    }

    async fn clear_activity(&mut self) -> Result<(), TransportError> {
        tracing::info!("presence cleared");
        Ok(())
    }

    fn take_disconnect(&mut self) -> bool {
        false
    }
}

// ─── Runtime Selection ────────────────────────────────────────────

pub enum RuntimeTransport {
    Uds(UdsPresenceTransport),
    Log(LogTransport),
}

impl PresenceTransport for RuntimeTransport {
    async fn login(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Uds(t) => t.login().await,
            Self::Log(t) => t.login().await,
        }
    }

    async fn set_activity(&mut self, record: &NormalizedRecord) -> Result<(), TransportError> {
        match self {
            Self::Uds(t) => t.set_activity(record).await,
            Self::Log(t) => t.set_activity(record).await,
        }
    }

    async fn clear_activity(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Uds(t) => t.clear_activity().await,
            Self::Log(t) => t.clear_activity().await,
        }
    }

    fn take_disconnect(&mut self) -> bool {
        match self {
            Self::Uds(t) => t.take_disconnect(),
            Self::Log(t) => t.take_disconnect(),
        }
    }
}

/// Creates fresh handles; a recreated handle starts from a clean socket.
pub struct RuntimeTransportFactory {
    presence_socket: Option<String>,
}

impl RuntimeTransportFactory {
    pub fn new(presence_socket: Option<String>) -> Self {
        Self { presence_socket }
    }
}

impl TransportFactory for RuntimeTransportFactory {
    type Transport = RuntimeTransport;

    fn create(&self) -> RuntimeTransport {
        match &self.presence_socket {
            Some(path) => RuntimeTransport::Uds(UdsPresenceTransport::new(path.clone())),
            None => RuntimeTransport::Log(LogTransport),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
