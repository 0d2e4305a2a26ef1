//! The polling control loop that keeps exactly one session canonical.
//!
//! Each pass: list candidates, match them against the enabled rules, run
//! the arbitration transition under the store's gate, probe the canonical
//! session for a fresh record, and execute deferred cleanup outside the
//! gate. A pass that fails is logged and the next tick proceeds — the loop
//! never stops rescheduling. Ticks that would overlap a running pass are
//! skipped, not queued.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::time::{Duration, MissedTickBehavior, interval};

use trackcast_core::fingerprint::presence_fingerprint;
use trackcast_core::matcher::match_candidates;
use trackcast_core::types::{CandidateDescriptor, NormalizedRecord};

use crate::dispatcher::{PushSink, UpdateDispatcher};
use crate::rules::RuleFeed;
use crate::store::SessionStore;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("candidate source unavailable: {0}")]
    Unavailable(String),
}

/// Where candidate descriptors and playback records come from. The parser
/// layer behind this trait is external; only freshness semantics matter
/// here.
pub trait CandidateSource: Send + Sync + 'static {
    fn list_candidates(
        &self,
    ) -> impl Future<Output = Result<Vec<CandidateDescriptor>, SourceError>> + Send;

    /// Liveness probe: return the current record for a session, or `None`
    /// when the session fails to answer within `timeout`.
    fn probe(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Option<NormalizedRecord>> + Send;
}

/// Timing and thresholds for the arbitration loop.
#[derive(Debug, Clone)]
pub struct ArbitratorConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a session is treated as absent.
    pub stuck_threshold: u32,
    /// Sessions unobserved for longer than this are deleted.
    pub stale_after: TimeDelta,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            probe_timeout: Duration::from_millis(800),
            stuck_threshold: 3,
            stale_after: TimeDelta::seconds(60),
        }
    }
}

/// The arbitration control loop.
pub struct SessionArbitrator<C, S> {
    source: Arc<C>,
    store: SessionStore,
    dispatcher: UpdateDispatcher<S>,
    rules: RuleFeed,
    config: ArbitratorConfig,
}

impl<C: CandidateSource, S: PushSink> SessionArbitrator<C, S> {
    pub fn new(
        source: Arc<C>,
        store: SessionStore,
        dispatcher: UpdateDispatcher<S>,
        rules: RuleFeed,
        config: ArbitratorConfig,
    ) -> Self {
        Self {
            source,
            store,
            dispatcher,
            rules,
            config,
        }
    }

    /// Run forever. One arbitration pass at a time: a tick that fires while
    /// a pass is still running is skipped. Rescheduling is unconditional —
    /// a failed pass logs and the loop continues.
    pub async fn run(self) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if let Err(e) = self.tick().await {
                tracing::warn!("arbitration pass failed: {e}");
            }
        }
    }

    /// One arbitration pass.
    pub async fn tick(&self) -> Result<(), SourceError> {
        let now = Utc::now();

        let candidates = self.source.list_candidates().await?;
        let rules = self.rules.borrow().clone();
        let matched = match_candidates(&candidates, &rules);

        tracing::debug!(
            "candidates: {}, matched: {}",
            candidates.len(),
            matched.len()
        );

        let outcome = self.store.arbitrate(&matched, now).await;

        // Network effects of the transition happen outside the gate.
        if let Some(demoted) = &outcome.demoted {
            tracing::info!("canonical session {demoted} superseded");
            self.dispatcher.cancel(demoted);
            self.dispatcher.send_clear(demoted);
        }
        if let Some(promoted) = &outcome.promoted {
            tracing::info!("canonical session now {promoted}");
        }

        if let Some(canonical) = &outcome.canonical {
            self.probe_canonical(canonical, now).await;
        }

        // Deferred cleanup: batch taken under the gate, cleared out here.
        let batch = self.store.drain_cleanup().await;
        for id in &batch {
            self.dispatcher.cancel(id);
            self.dispatcher.send_clear(id);
        }

        // Sessions unobserved past the stale threshold are deleted outright.
        let removed = self
            .store
            .remove_stale(now, self.config.stale_after)
            .await;
        for id in &removed {
            tracing::debug!("removed stale session {id}");
            self.dispatcher.cancel(id);
        }

        Ok(())
    }

    async fn probe_canonical(&self, canonical: &str, now: DateTime<Utc>) {
        match self.source.probe(canonical, self.config.probe_timeout).await {
            Some(record) => {
                if let Err(e) = record.validate() {
                    tracing::warn!("dropping record from {canonical}: {e}");
                    return;
                }
                self.store.observe(canonical, record.clone(), now).await;
                self.store.reset_probe_failures(canonical).await;

                // Arbiter-side dedup: skip scheduling when the fingerprint
                // matches the last payload already handed to the dispatcher.
                let fingerprint = presence_fingerprint(&record);
                let last_key = self
                    .store
                    .get(canonical)
                    .await
                    .and_then(|s| s.last_sync_key);
                if last_key.as_deref() != Some(fingerprint.as_str()) {
                    self.dispatcher.schedule(canonical, record);
                    self.store.set_sync_key(canonical, fingerprint).await;
                }
            }
            None => {
                let streak = self.store.record_probe_failure(canonical).await;
                if streak >= self.config.stuck_threshold {
                    tracing::info!(
                        "session {canonical} unresponsive after {streak} probes, clearing"
                    );
                    self.store.clear_canonical(canonical).await;
                    self.store.mark_for_cleanup([canonical]).await;
                } else {
                    tracing::debug!("probe failed for {canonical} ({streak} consecutive)");
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
