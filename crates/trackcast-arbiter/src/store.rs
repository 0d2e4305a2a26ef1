//! Shared session state for the arbitration side.
//!
//! Owns the map of tracked sessions, the canonical pointer, the deferred
//! cleanup queue, and per-session probe-failure streaks. Every mutating
//! entry point goes through the [`SerialGate`]; no field is touched outside
//! the store's own methods. Snapshots are clones and may be slightly stale
//! by the time the caller looks at them.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};

use trackcast_core::matcher::{MatchedCandidate, select_candidate};
use trackcast_core::types::{NormalizedRecord, SessionRecord};

use crate::gate::SerialGate;

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    canonical_id: Option<String>,
    /// Sessions queued for deferred cleanup (clears happen outside the gate).
    pending_cleanup: HashSet<String>,
    /// Sessions whose cleanup clear has already been issued since they last
    /// held (or contended for) canonical status. Re-marking these is a no-op
    /// so the companion is not spammed with redundant clears.
    cleared: HashSet<String>,
    probe_failures: HashMap<String, u32>,
}

impl StoreInner {
    fn track(&mut self, session_id: &str, now: DateTime<Utc>) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                session_id: session_id.to_string(),
                record: None,
                last_observed_at: now,
                last_sync_key: None,
            });
    }

    fn queue_cleanup(&mut self, session_id: &str) {
        if self.canonical_id.as_deref() == Some(session_id) {
            return;
        }
        if self.cleared.contains(session_id) {
            return;
        }
        self.pending_cleanup.insert(session_id.to_string());
    }
}

/// Result of one arbitration pass over the current candidate matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArbitrationOutcome {
    /// Canonical session after the pass, if any.
    pub canonical: Option<String>,
    /// Session newly promoted during this pass.
    pub promoted: Option<String>,
    /// Previous canonical cleared during this pass (its remote state must
    /// be cleared by the caller, outside the gate).
    pub demoted: Option<String>,
}

/// Mutex-guarded owner of all per-session arbitration state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    gate: SerialGate<StoreInner>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            gate: SerialGate::new(StoreInner::default()),
        }
    }

    /// Create or refresh a session from a freshly observed record.
    pub async fn observe(&self, session_id: &str, record: NormalizedRecord, now: DateTime<Utc>) {
        self.gate
            .run(|inner| {
                inner.cleared.remove(session_id);
                inner.track(session_id, now);
                if let Some(session) = inner.sessions.get_mut(session_id) {
                    session.record = Some(record);
                    session.last_observed_at = now;
                }
            })
            .await
    }

    /// Run one full arbitration transition over the current matches as a
    /// single atomic step under the gate.
    ///
    /// - Newly matched candidates become tracked sessions.
    /// - A canonical session still present keeps its status; every other
    ///   present candidate is (re)queued for cleanup.
    /// - A canonical session absent from the matches is cleared, then
    ///   selection re-runs over what remains.
    /// - With no matches at all, every known session is queued for cleanup.
    ///
    /// Network work (clears, pushes) is the caller's job, outside the gate.
    pub async fn arbitrate(
        &self,
        matched: &[MatchedCandidate],
        now: DateTime<Utc>,
    ) -> ArbitrationOutcome {
        self.gate
            .run(|inner| {
                let mut outcome = ArbitrationOutcome::default();

                for m in matched {
                    inner.track(&m.candidate.session_id, now);
                    if let Some(session) = inner.sessions.get_mut(&m.candidate.session_id) {
                        session.last_observed_at = now;
                    }
                }

                if matched.is_empty() {
                    if let Some(previous) = inner.canonical_id.take() {
                        // The caller issues the demoted session's clear, so
                        // the cleanup queue must not issue a second one.
                        inner.cleared.insert(previous.clone());
                        outcome.demoted = Some(previous);
                    }
                    let all: Vec<String> = inner.sessions.keys().cloned().collect();
                    for id in all {
                        inner.queue_cleanup(&id);
                    }
                    return outcome;
                }

                let still_present = inner.canonical_id.as_deref().is_some_and(|current| {
                    matched.iter().any(|m| m.candidate.session_id == current)
                });

                if !still_present {
                    let previous = inner.canonical_id.take();
                    let winner = select_candidate(matched, previous.as_deref())
                        .map(|m| m.candidate.session_id.clone());
                    if let Some(winner) = &winner {
                        inner.canonical_id = Some(winner.clone());
                        inner.cleared.remove(winner);
                        inner.pending_cleanup.remove(winner);
                        outcome.promoted = Some(winner.clone());
                    }
                    // Demotion is reported only when someone actually held
                    // canonical status before this pass. The caller issues
                    // its clear, so mark it cleared here.
                    outcome.demoted = previous.filter(|p| Some(p) != winner.as_ref());
                    if let Some(demoted) = &outcome.demoted {
                        inner.cleared.insert(demoted.clone());
                    }
                }

                for m in matched {
                    inner.queue_cleanup(&m.candidate.session_id);
                }

                outcome.canonical = inner.canonical_id.clone();
                outcome
            })
            .await
    }

    /// Promote a session to canonical. Returns `false` when the id is
    /// untracked (promotion of a ghost is refused).
    pub async fn promote(&self, session_id: &str) -> bool {
        self.gate
            .run(|inner| {
                if !inner.sessions.contains_key(session_id) {
                    return false;
                }
                inner.canonical_id = Some(session_id.to_string());
                inner.cleared.remove(session_id);
                inner.pending_cleanup.remove(session_id);
                true
            })
            .await
    }

    /// Clear canonical status if `session_id` currently holds it.
    /// Idempotent: clearing a non-canonical session is a no-op.
    pub async fn clear_canonical(&self, session_id: &str) -> bool {
        self.gate
            .run(|inner| {
                if inner.canonical_id.as_deref() == Some(session_id) {
                    inner.canonical_id = None;
                    true
                } else {
                    false
                }
            })
            .await
    }

    pub async fn canonical_id(&self) -> Option<String> {
        self.gate.run(|inner| inner.canonical_id.clone()).await
    }

    /// Queue sessions for deferred cleanup. Sessions whose clear was already
    /// issued are skipped until they contend again.
    pub async fn mark_for_cleanup<I, S>(&self, session_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.gate
            .run(|inner| {
                for id in session_ids {
                    let id = id.as_ref();
                    if inner.canonical_id.as_deref() == Some(id) {
                        continue;
                    }
                    if inner.cleared.contains(id) {
                        continue;
                    }
                    inner.pending_cleanup.insert(id.to_string());
                }
            })
            .await
    }

    /// Take the whole cleanup batch. The caller performs the actual clears
    /// outside the gate; taken ids are remembered as cleared so repeated
    /// marking does not re-issue them.
    pub async fn drain_cleanup(&self) -> Vec<String> {
        self.gate
            .run(|inner| {
                let batch: Vec<String> = inner.pending_cleanup.drain().collect();
                for id in &batch {
                    inner.cleared.insert(id.clone());
                }
                batch
            })
            .await
    }

    /// Remove a session entirely, dropping all bookkeeping. If it was
    /// canonical, canonical status is cleared with it.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.gate
            .run(|inner| {
                let existed = inner.sessions.remove(session_id).is_some();
                if inner.canonical_id.as_deref() == Some(session_id) {
                    inner.canonical_id = None;
                }
                inner.pending_cleanup.remove(session_id);
                inner.cleared.remove(session_id);
                inner.probe_failures.remove(session_id);
                existed
            })
            .await
    }

    /// Remove every session not observed within `stale_after`. Returns the
    /// removed ids so the caller can cancel their outstanding work.
    pub async fn remove_stale(&self, now: DateTime<Utc>, stale_after: TimeDelta) -> Vec<String> {
        self.gate
            .run(|inner| {
                let stale: Vec<String> = inner
                    .sessions
                    .values()
                    .filter(|s| now.signed_duration_since(s.last_observed_at) > stale_after)
                    .map(|s| s.session_id.clone())
                    .collect();
                for id in &stale {
                    inner.sessions.remove(id);
                    if inner.canonical_id.as_deref() == Some(id.as_str()) {
                        inner.canonical_id = None;
                    }
                    inner.pending_cleanup.remove(id);
                    inner.cleared.remove(id);
                    inner.probe_failures.remove(id);
                }
                stale
            })
            .await
    }

    /// Record the fingerprint of the last payload pushed for a session.
    pub async fn set_sync_key(&self, session_id: &str, sync_key: String) {
        self.gate
            .run(|inner| {
                if let Some(session) = inner.sessions.get_mut(session_id) {
                    session.last_sync_key = Some(sync_key);
                }
            })
            .await
    }

    /// Increment and return the probe-failure streak for a session.
    pub async fn record_probe_failure(&self, session_id: &str) -> u32 {
        self.gate
            .run(|inner| {
                let streak = inner
                    .probe_failures
                    .entry(session_id.to_string())
                    .or_insert(0);
                *streak = streak.saturating_add(1);
                *streak
            })
            .await
    }

    pub async fn reset_probe_failures(&self, session_id: &str) {
        self.gate
            .run(|inner| {
                inner.probe_failures.remove(session_id);
            })
            .await
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.gate
            .run(|inner| inner.sessions.get(session_id).cloned())
            .await
    }

    /// Clone of all tracked sessions (unordered). Permitted to be slightly
    /// stale by the time it is read.
    pub async fn snapshot(&self) -> Vec<SessionRecord> {
        self.gate
            .run(|inner| inner.sessions.values().cloned().collect())
            .await
    }

    pub async fn len(&self) -> usize {
        self.gate.run(|inner| inner.sessions.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.gate.run(|inner| inner.sessions.is_empty()).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str) -> NormalizedRecord {
        NormalizedRecord {
            title: title.to_string(),
            artist: "Artist".to_string(),
            progress_seconds: 0.0,
            duration_seconds: 180.0,
            is_playing: true,
            source_rule_id: Some("r1".to_string()),
        }
    }

    #[tokio::test]
    async fn observe_creates_then_updates() {
        let store = SessionStore::new();
        let now = Utc::now();

        store.observe("tab-1", record("First"), now).await;
        assert_eq!(store.len().await, 1);

        let later = now + TimeDelta::seconds(5);
        store.observe("tab-1", record("Second"), later).await;
        assert_eq!(store.len().await, 1);

        let session = store.get("tab-1").await.expect("tracked");
        assert_eq!(session.record.expect("record").title, "Second");
        assert_eq!(session.last_observed_at, later);
    }

    #[tokio::test]
    async fn promote_refuses_untracked_session() {
        let store = SessionStore::new();
        assert!(!store.promote("ghost").await);
        assert_eq!(store.canonical_id().await, None);
    }

    #[tokio::test]
    async fn at_most_one_canonical_under_interleaved_promotes() {
        let store = SessionStore::new();
        let now = Utc::now();
        for i in 0..10 {
            store.observe(&format!("tab-{i}"), record("Song"), now).await;
        }

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.promote(&format!("tab-{i}")).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        // Whatever interleaving happened, exactly one id holds canonical.
        let canonical = store.canonical_id().await;
        assert!(canonical.is_some());
    }

    #[tokio::test]
    async fn clear_canonical_is_idempotent_and_scoped() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.observe("tab-1", record("Song"), now).await;
        store.observe("tab-2", record("Song"), now).await;
        store.promote("tab-1").await;

        // Clearing a non-holder is a no-op.
        assert!(!store.clear_canonical("tab-2").await);
        assert_eq!(store.canonical_id().await, Some("tab-1".to_string()));

        assert!(store.clear_canonical("tab-1").await);
        assert!(!store.clear_canonical("tab-1").await, "second clear is a no-op");
        assert_eq!(store.canonical_id().await, None);
    }

    #[tokio::test]
    async fn remove_drops_canonical_with_session() {
        let store = SessionStore::new();
        store.observe("tab-1", record("Song"), Utc::now()).await;
        store.promote("tab-1").await;

        assert!(store.remove("tab-1").await);
        assert_eq!(store.canonical_id().await, None);
        assert!(!store.remove("tab-1").await, "second remove is a no-op");
    }

    #[tokio::test]
    async fn cleanup_marking_skips_canonical_and_already_cleared() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.observe("keep", record("Song"), now).await;
        store.observe("lose-a", record("Song"), now).await;
        store.observe("lose-b", record("Song"), now).await;
        store.promote("keep").await;

        store.mark_for_cleanup(["keep", "lose-a", "lose-b"]).await;
        let mut batch = store.drain_cleanup().await;
        batch.sort();
        assert_eq!(batch, vec!["lose-a".to_string(), "lose-b".to_string()]);

        // Re-marking drained losers does not queue them again.
        store.mark_for_cleanup(["lose-a", "lose-b"]).await;
        assert!(store.drain_cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn cleared_flag_resets_on_fresh_observation() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.observe("tab-1", record("Song"), now).await;
        store.mark_for_cleanup(["tab-1"]).await;
        assert_eq!(store.drain_cleanup().await, vec!["tab-1".to_string()]);

        // A new observation makes the session eligible for cleanup again.
        store.observe("tab-1", record("Song"), now).await;
        store.mark_for_cleanup(["tab-1"]).await;
        assert_eq!(store.drain_cleanup().await, vec!["tab-1".to_string()]);
    }

    #[tokio::test]
    async fn probe_failure_streaks() {
        let store = SessionStore::new();
        assert_eq!(store.record_probe_failure("tab-1").await, 1);
        assert_eq!(store.record_probe_failure("tab-1").await, 2);
        assert_eq!(store.record_probe_failure("tab-2").await, 1);

        store.reset_probe_failures("tab-1").await;
        assert_eq!(store.record_probe_failure("tab-1").await, 1);
    }

    #[tokio::test]
    async fn remove_stale_prunes_by_age() {
        let store = SessionStore::new();
        let now = Utc::now();
        store
            .observe("old", record("Song"), now - TimeDelta::seconds(120))
            .await;
        store.observe("fresh", record("Song"), now).await;
        store.promote("old").await;

        let removed = store.remove_stale(now, TimeDelta::seconds(60)).await;
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(store.canonical_id().await, None, "stale canonical is cleared");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn sync_key_recorded_for_tracked_sessions_only() {
        let store = SessionStore::new();
        store.observe("tab-1", record("Song"), Utc::now()).await;

        store.set_sync_key("tab-1", "fp-1".to_string()).await;
        store.set_sync_key("ghost", "fp-2".to_string()).await;

        let session = store.get("tab-1").await.expect("tracked");
        assert_eq!(session.last_sync_key, Some("fp-1".to_string()));
        assert!(store.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn arbitrate_keeps_present_canonical_and_queues_losers() {
        use trackcast_core::types::CandidateDescriptor;

        fn matched(id: &str, active: bool) -> MatchedCandidate {
            MatchedCandidate {
                candidate: CandidateDescriptor {
                    session_id: id.to_string(),
                    url: format!("https://example.com/{id}"),
                    is_audible: true,
                    is_active_window: active,
                },
                rule_id: "r1".to_string(),
            }
        }

        let store = SessionStore::new();
        let now = Utc::now();

        // First pass: active-window tab wins.
        let outcome = store
            .arbitrate(&[matched("bg", false), matched("fg", true)], now)
            .await;
        assert_eq!(outcome.promoted, Some("fg".to_string()));
        assert_eq!(outcome.canonical, Some("fg".to_string()));
        assert_eq!(outcome.demoted, None);
        assert_eq!(store.drain_cleanup().await, vec!["bg".to_string()]);

        // Second pass, same matches: canonical is stable, loser already
        // cleared so the cleanup queue stays empty.
        let outcome = store
            .arbitrate(&[matched("bg", false), matched("fg", true)], now)
            .await;
        assert_eq!(outcome.promoted, None);
        assert_eq!(outcome.canonical, Some("fg".to_string()));
        assert!(store.drain_cleanup().await.is_empty());

        // Canonical disappears: loser is promoted, old holder demoted.
        let outcome = store.arbitrate(&[matched("bg", false)], now).await;
        assert_eq!(outcome.demoted, Some("fg".to_string()));
        assert_eq!(outcome.promoted, Some("bg".to_string()));
        assert_eq!(outcome.canonical, Some("bg".to_string()));

        // Zero candidates: the store goes idle. Both sessions already had
        // their clears issued (fg at demotion, bg right now), so nothing
        // is re-queued.
        let outcome = store.arbitrate(&[], now).await;
        assert_eq!(outcome.demoted, Some("bg".to_string()));
        assert_eq!(outcome.canonical, None);
        assert!(store.drain_cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_a_clone() {
        let store = SessionStore::new();
        store.observe("tab-1", record("Song"), Utc::now()).await;

        let snapshot = store.snapshot().await;
        store.remove("tab-1").await;

        // The snapshot is unaffected by later mutation.
        assert_eq!(snapshot.len(), 1);
        assert!(store.is_empty().await);
    }
}
