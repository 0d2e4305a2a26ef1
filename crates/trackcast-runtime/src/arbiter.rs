//! Arbiter process: ingest server + arbitration loop.
//!
//! Candidate descriptors and normalized records arrive from the external
//! parser layer over the ingest socket. The liveness probe is answered
//! from ingest freshness: a session whose last report is older than the
//! probe window counts as a failed probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use trackcast_arbiter::arbitrator::{
    ArbitratorConfig, CandidateSource, SessionArbitrator, SourceError,
};
use trackcast_arbiter::dispatcher::UpdateDispatcher;
use trackcast_arbiter::rules::RuleCache;
use trackcast_arbiter::store::SessionStore;
use trackcast_core::types::{CandidateDescriptor, NormalizedRecord, PatternRule};

use crate::cli::{ArbiterOpts, default_arbiter_socket, default_companion_socket};
use crate::client::CompanionClient;
use crate::server;

// ─── Ingest Buffer ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct IngestInner {
    candidates: Vec<CandidateDescriptor>,
    records: HashMap<String, (NormalizedRecord, DateTime<Utc>)>,
}

/// Latest state reported by the parser layer. The server writes, the
/// arbitration loop reads.
#[derive(Debug, Default)]
pub struct IngestState {
    inner: StdMutex<IngestInner>,
}

impl IngestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full candidate list (the parser reports snapshots, not
    /// deltas). Records of vanished sessions are dropped with them.
    pub fn report_candidates(&self, candidates: Vec<CandidateDescriptor>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .records
            .retain(|id, _| candidates.iter().any(|c| &c.session_id == id));
        inner.candidates = candidates;
    }

    pub fn report_record(&self, session_id: &str, record: NormalizedRecord, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.insert(session_id.to_string(), (record, now));
    }

    pub fn candidate_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .candidates
            .len()
    }
}

/// [`CandidateSource`] view over the ingest buffer.
pub struct IngestSource {
    state: Arc<IngestState>,
    /// A record older than this fails the liveness probe.
    probe_window: TimeDelta,
}

impl IngestSource {
    pub fn new(state: Arc<IngestState>, probe_window: TimeDelta) -> Self {
        Self {
            state,
            probe_window,
        }
    }
}

impl CandidateSource for IngestSource {
    async fn list_candidates(&self) -> Result<Vec<CandidateDescriptor>, SourceError> {
        let inner = self
            .state
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(inner.candidates.clone())
    }

    async fn probe(&self, session_id: &str, _timeout: Duration) -> Option<NormalizedRecord> {
        let now = Utc::now();
        let inner = self
            .state
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let (record, reported_at) = inner.records.get(session_id)?;
        if now.signed_duration_since(*reported_at) > self.probe_window {
            return None;
        }
        Some(record.clone())
    }
}

// ─── Shared Server State ──────────────────────────────────────────

/// State exposed to the ingest/status server.
pub struct ArbiterShared {
    pub ingest: Arc<IngestState>,
    pub store: SessionStore,
    pub rules: RuleCache,
}

// ─── Daemon ───────────────────────────────────────────────────────

fn load_rules(rules_file: Option<&str>) -> anyhow::Result<Vec<PatternRule>> {
    match rules_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let rules: Vec<PatternRule> = serde_json::from_str(&raw)?;
            tracing::info!("loaded {} rules from {path}", rules.len());
            Ok(rules)
        }
        None => Ok(vec![PatternRule::match_all("default")]),
    }
}

/// Run the arbiter: ingest server + arbitration loop until shutdown.
pub async fn run_arbiter(opts: ArbiterOpts) -> anyhow::Result<()> {
    let socket_path = opts.socket.clone().unwrap_or_else(default_arbiter_socket);
    let companion_socket = opts
        .companion_socket
        .clone()
        .unwrap_or_else(default_companion_socket);

    let rules = load_rules(opts.rules_file.as_deref())?;
    let (rule_cache, rule_feed) = RuleCache::new(rules);

    let ingest = Arc::new(IngestState::new());
    let store = SessionStore::new();
    let dispatcher = UpdateDispatcher::new(
        CompanionClient::new(companion_socket),
        Duration::from_millis(opts.debounce_ms),
    );

    // Probe freshness window: a couple of poll intervals, floored so a slow
    // reporter is not declared dead by an aggressive poll rate.
    let probe_window = TimeDelta::milliseconds((opts.poll_interval_ms.max(1_000) * 3) as i64);
    let source = Arc::new(IngestSource::new(Arc::clone(&ingest), probe_window));

    let config = ArbitratorConfig {
        poll_interval: Duration::from_millis(opts.poll_interval_ms),
        probe_timeout: Duration::from_millis(opts.probe_timeout_ms),
        stuck_threshold: opts.stuck_threshold,
        stale_after: TimeDelta::seconds(opts.stale_after_secs as i64),
    };
    let arbitrator = SessionArbitrator::new(source, store.clone(), dispatcher, rule_feed, config);

    let shared = Arc::new(ArbiterShared {
        ingest,
        store,
        rules: rule_cache,
    });

    let server_socket = socket_path.clone();
    let server_shared = Arc::clone(&shared);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_arbiter_server(&server_socket, server_shared).await {
            tracing::error!("arbiter server error: {e}");
        }
    });

    let loop_handle = tokio::spawn(arbitrator.run());

    tokio::select! {
        () = shutdown_signal() => {}
        _ = server_handle => {
            tracing::warn!("arbiter server exited unexpectedly");
        }
        _ = loop_handle => {
            tracing::warn!("arbitration loop exited unexpectedly");
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("arbiter stopped");
    Ok(())
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
