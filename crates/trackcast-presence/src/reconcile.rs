//! Reconciles incoming records against the last state believed pushed.
//!
//! The reconciler never queues: it tracks the desired state (latest valid
//! incoming record) and the pushed state (what the endpoint last accepted),
//! and converges the two whenever the connection is ready. Redundant pushes
//! are suppressed by fingerprint within a minimum update interval; pauses,
//! silence, and stale clients all collapse to an idempotent clear.

use chrono::{DateTime, TimeDelta, Utc};

use trackcast_core::fingerprint::{dwell_key, presence_fingerprint};
use trackcast_core::types::{ActivitySnapshot, PushRequest};

use crate::connection::{ConnectionManager, SendOutcome};
use crate::history::{HistoryLog, HistoryRecorder};
use crate::transport::TransportFactory;

/// Timing knobs for the reconcile loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Identical fingerprints within this window are not re-pushed.
    pub min_update_interval: TimeDelta,
    /// With no incoming signal for this long, the activity is cleared.
    pub auto_clear_after: TimeDelta,
    /// Incoming requests stamped older than this are from a client that is
    /// no longer live; they are dropped and the activity cleared.
    pub client_inactive_after: TimeDelta,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_update_interval: TimeDelta::seconds(15),
            auto_clear_after: TimeDelta::seconds(60),
            client_inactive_after: TimeDelta::seconds(45),
        }
    }
}

/// Companion-side reconciler. Owns the desired/pushed state pair and the
/// history recorder; drives the connection manager but never blocks on it.
pub struct ActivityReconciler<L> {
    config: ReconcilerConfig,
    /// Latest valid incoming state (fingerprint + record).
    desired: Option<ActivitySnapshot>,
    /// Last state believed to be reflected in the remote endpoint.
    pushed: Option<ActivitySnapshot>,
    last_incoming_at: Option<DateTime<Utc>>,
    recorder: HistoryRecorder<L>,
}

impl<L: HistoryLog> ActivityReconciler<L> {
    pub fn new(config: ReconcilerConfig, recorder: HistoryRecorder<L>) -> Self {
        Self {
            config,
            desired: None,
            pushed: None,
            last_incoming_at: None,
            recorder,
        }
    }

    /// Current pushed snapshot (None when cleared).
    pub fn pushed(&self) -> Option<&ActivitySnapshot> {
        self.pushed.as_ref()
    }

    pub fn recorder(&self) -> &HistoryRecorder<L> {
        &self.recorder
    }

    /// Handle one incoming push from the arbiter.
    pub async fn handle_push<F: TransportFactory>(
        &mut self,
        request: PushRequest,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = request.record.validate() {
            tracing::warn!(
                "dropping malformed record from {}: {e}",
                request.session_id
            );
            return;
        }
        if now.signed_duration_since(request.timestamp) > self.config.client_inactive_after {
            tracing::warn!(
                "dropping push from inactive client {} (stamped {})",
                request.session_id,
                request.timestamp
            );
            self.clear(conn, now).await;
            return;
        }

        self.last_incoming_at = Some(now);

        if !request.record.is_playing {
            self.clear(conn, now).await;
            return;
        }

        let record = request.record;
        self.recorder.observe(
            &dwell_key(&record),
            &record.title,
            &record.artist,
            record.source_label(),
            now,
        );

        let fingerprint = presence_fingerprint(&record);
        self.desired = Some(ActivitySnapshot {
            fingerprint,
            payload: record,
            set_at: now,
        });
        self.flush(conn, now).await;
    }

    /// Handle an explicit clear from the arbiter.
    pub async fn handle_clear<F: TransportFactory>(
        &mut self,
        session_id: &str,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        tracing::debug!("clear requested for session {session_id}");
        self.last_incoming_at = Some(now);
        self.clear(conn, now).await;
    }

    /// Periodic tick: drive the connection state machine, expire silent
    /// activity, converge desired vs pushed, and commit due history.
    pub async fn tick<F: TransportFactory>(
        &mut self,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        conn.ensure_ready(now).await;

        let silent = self
            .last_incoming_at
            .is_some_and(|at| now.signed_duration_since(at) > self.config.auto_clear_after);
        if silent && (self.desired.is_some() || self.pushed.is_some()) {
            tracing::info!("no incoming signal, clearing presence");
            self.clear(conn, now).await;
        } else if self.desired.is_none() {
            // A clear that could not reach the endpoint earlier retries here.
            self.retry_pending_clear(conn, now).await;
        } else {
            self.flush(conn, now).await;
        }

        if let Some(outcome) = self.recorder.poll_due(now) {
            tracing::debug!("history commit: {outcome:?}");
        }
    }

    /// Converge the endpoint toward the desired state: push when the
    /// fingerprint differs from what was last pushed, or as a keep-alive
    /// once the minimum update interval has elapsed.
    async fn flush<F: TransportFactory>(
        &mut self,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        let Some(desired) = &self.desired else { return };

        let should_push = match &self.pushed {
            None => true,
            Some(pushed) => {
                pushed.fingerprint != desired.fingerprint
                    || now.signed_duration_since(pushed.set_at) >= self.config.min_update_interval
            }
        };
        if !should_push || !conn.is_ready() {
            return;
        }

        if conn.push_activity(&desired.payload, now).await == SendOutcome::Sent {
            self.pushed = Some(ActivitySnapshot {
                fingerprint: desired.fingerprint.clone(),
                payload: desired.payload.clone(),
                set_at: now,
            });
        }
    }

    /// Idempotent clear: drop desired state and pending history, and clear
    /// the endpoint if it still shows something. When the endpoint is
    /// unreachable the pushed snapshot is kept so the clear retries on the
    /// next tick.
    async fn clear<F: TransportFactory>(
        &mut self,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        self.desired = None;
        self.recorder.discard_pending();
        self.retry_pending_clear(conn, now).await;
    }

    async fn retry_pending_clear<F: TransportFactory>(
        &mut self,
        conn: &mut ConnectionManager<F>,
        now: DateTime<Utc>,
    ) {
        if self.pushed.is_none() {
            return;
        }
        if conn.clear_activity(now).await == SendOutcome::Sent {
            self.pushed = None;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
