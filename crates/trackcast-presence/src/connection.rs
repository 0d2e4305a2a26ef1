//! Owner of the single connection to the remote presence endpoint.
//!
//! State machine: `disconnected → connecting → ready`; any send failure or
//! observed disconnect drops `ready → degraded`; after a fixed backoff a
//! degraded connection re-enters `connecting`. Nothing is queued while the
//! connection is down — the reconciler re-sends current truth once the
//! endpoint is ready again.
//!
//! Escape hatch: when sends keep failing past the retry budget, the
//! transport handle is torn down and recreated wholesale instead of
//! retrying the same wedged handle forever. Any in-flight work on the old
//! handle dies with it.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::{Duration, timeout};

use trackcast_core::retry::{ReconnectPolicy, SendRetryBudget, retry_due};
use trackcast_core::types::{ConnectionState, NormalizedRecord};

use crate::transport::{PresenceTransport, TransportFactory};

/// Result of a send attempt. Never fatal to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Connection not ready; nothing was attempted.
    Skipped,
    /// The send failed and the connection dropped to degraded.
    Failed,
}

/// Connection lifecycle manager. `ConnectionState` is mutated only from
/// within these methods.
pub struct ConnectionManager<F: TransportFactory> {
    factory: F,
    transport: F::Transport,
    state: ConnectionState,
    policy: ReconnectPolicy,
    next_attempt_at: Option<DateTime<Utc>>,
    send_budget: SendRetryBudget,
    last_logged_error: Option<String>,
    handle_generation: u64,
}

impl<F: TransportFactory> ConnectionManager<F> {
    pub fn new(factory: F, policy: ReconnectPolicy) -> Self {
        let transport = factory.create();
        Self {
            factory,
            transport,
            state: ConnectionState::Disconnected,
            policy,
            next_attempt_at: None,
            send_budget: SendRetryBudget::new(),
            last_logged_error: None,
            handle_generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Readiness check for callers about to send. Readiness is not
    /// guaranteed to persist between this check and the send — send call
    /// sites must treat failure as a drop to degraded, never as fatal.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// How many times the transport handle has been recreated.
    pub fn handle_generation(&self) -> u64 {
        self.handle_generation
    }

    /// Drive the connection toward `ready`. Called every companion tick:
    /// drains disconnect notifications, and when a retry is due, runs one
    /// bounded connect attempt. Returns the post-drive readiness.
    pub async fn ensure_ready(&mut self, now: DateTime<Utc>) -> bool {
        if self.transport.take_disconnect() && self.state == ConnectionState::Ready {
            self.degrade("endpoint disconnected".to_string(), now);
        }

        if self.state == ConnectionState::Ready {
            return true;
        }

        let now_ms = now.timestamp_millis().max(0) as u64;
        let next_ms = self
            .next_attempt_at
            .map(|at| at.timestamp_millis().max(0) as u64);
        if !retry_due(next_ms, now_ms) {
            return false;
        }

        self.attempt_connect(now).await;
        self.state == ConnectionState::Ready
    }

    async fn attempt_connect(&mut self, now: DateTime<Utc>) {
        self.state = ConnectionState::Connecting;
        let bound = Duration::from_millis(self.policy.connect_timeout_ms);

        match timeout(bound, self.transport.login()).await {
            Ok(Ok(())) => {
                // The send budget is NOT reset here: only a successful send
                // proves the path works, and the forced-recreation rule
                // counts consecutive send failures across reconnects.
                self.state = ConnectionState::Ready;
                self.next_attempt_at = None;
                self.last_logged_error = None;
                tracing::info!("presence endpoint connected");
            }
            Ok(Err(e)) => self.connect_failed(e.to_string(), now),
            Err(_) => self.connect_failed(
                format!("connect timed out after {}ms", self.policy.connect_timeout_ms),
                now,
            ),
        }
    }

    fn connect_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.log_once(&reason);
        // Still logically "connecting": the retry loop runs until ready.
        self.state = ConnectionState::Connecting;
        self.next_attempt_at = Some(now + TimeDelta::milliseconds(self.policy.retry_delay_ms as i64));
    }

    /// Push the current activity. Skipped unless ready; a failure degrades
    /// the connection and counts toward the handle-recreation budget.
    pub async fn push_activity(
        &mut self,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        if !self.is_ready() {
            return SendOutcome::Skipped;
        }
        match self.transport.set_activity(record).await {
            Ok(()) => {
                self.send_budget.reset();
                SendOutcome::Sent
            }
            Err(e) => {
                self.send_failed(format!("activity push failed: {e}"), now);
                SendOutcome::Failed
            }
        }
    }

    /// Clear the remote activity. Same failure semantics as pushes.
    pub async fn clear_activity(&mut self, now: DateTime<Utc>) -> SendOutcome {
        if !self.is_ready() {
            return SendOutcome::Skipped;
        }
        match self.transport.clear_activity().await {
            Ok(()) => {
                self.send_budget.reset();
                SendOutcome::Sent
            }
            Err(e) => {
                self.send_failed(format!("activity clear failed: {e}"), now);
                SendOutcome::Failed
            }
        }
    }

    fn send_failed(&mut self, reason: String, now: DateTime<Utc>) {
        if self.send_budget.record_failure(self.policy.send_retry_budget) {
            self.recreate_handle(now);
        } else {
            self.degrade(reason, now);
        }
    }

    fn degrade(&mut self, reason: String, now: DateTime<Utc>) {
        self.log_once(&reason);
        self.state = ConnectionState::Degraded;
        self.next_attempt_at = Some(now + TimeDelta::milliseconds(self.policy.retry_delay_ms as i64));
    }

    /// Tear down the wedged handle and start over with a fresh one.
    /// Outstanding work on the old handle is dropped with it.
    fn recreate_handle(&mut self, now: DateTime<Utc>) {
        tracing::warn!(
            "send retries exhausted ({} consecutive), recreating presence connection handle",
            self.send_budget.consecutive_failures()
        );
        self.transport = self.factory.create();
        self.handle_generation += 1;
        self.send_budget.reset();
        self.state = ConnectionState::Disconnected;
        self.next_attempt_at = Some(now + TimeDelta::milliseconds(self.policy.retry_delay_ms as i64));
        self.last_logged_error = None;
    }

    /// Log a failure once at warn; identical consecutive failures drop to
    /// debug so a long outage does not spam the log.
    fn log_once(&mut self, reason: &str) {
        if self.last_logged_error.as_deref() == Some(reason) {
            tracing::debug!("{reason}");
        } else {
            tracing::warn!("{reason}");
            self.last_logged_error = Some(reason.to_string());
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    use crate::transport::TransportError;

    // ── Scripted fake transport ─────────────────────────────────

    #[derive(Debug, Default)]
    struct Script {
        login_results: VecDeque<Result<(), String>>,
        send_results: VecDeque<Result<(), String>>,
        disconnects: u32,
        activities_set: Vec<String>,
        clears: u32,
    }

    #[derive(Clone, Default)]
    struct SharedScript(Arc<StdMutex<Script>>);

    impl SharedScript {
        fn push_login(&self, result: Result<(), &str>) {
            self.0
                .lock()
                .expect("lock")
                .login_results
                .push_back(result.map_err(String::from));
        }

        fn push_send(&self, result: Result<(), &str>) {
            self.0
                .lock()
                .expect("lock")
                .send_results
                .push_back(result.map_err(String::from));
        }

        fn signal_disconnect(&self) {
            self.0.lock().expect("lock").disconnects += 1;
        }

        fn activities(&self) -> Vec<String> {
            self.0.lock().expect("lock").activities_set.clone()
        }

        fn clears(&self) -> u32 {
            self.0.lock().expect("lock").clears
        }
    }

    struct FakeTransport {
        script: SharedScript,
    }

    impl PresenceTransport for FakeTransport {
        async fn login(&mut self) -> Result<(), TransportError> {
            let result = self
                .script
                .0
                .lock()
                .expect("lock")
                .login_results
                .pop_front()
                .unwrap_or(Ok(()));
            result.map_err(TransportError::Unavailable)
        }

        async fn set_activity(&mut self, record: &NormalizedRecord) -> Result<(), TransportError> {
            let mut script = self.script.0.lock().expect("lock");
            let result = script.send_results.pop_front().unwrap_or(Ok(()));
            match result {
                Ok(()) => {
                    script.activities_set.push(record.title.clone());
                    Ok(())
                }
                Err(e) => Err(TransportError::SendFailed(e)),
            }
        }

        async fn clear_activity(&mut self) -> Result<(), TransportError> {
            let mut script = self.script.0.lock().expect("lock");
            let result = script.send_results.pop_front().unwrap_or(Ok(()));
            match result {
                Ok(()) => {
                    script.clears += 1;
                    Ok(())
                }
                Err(e) => Err(TransportError::SendFailed(e)),
            }
        }

        fn take_disconnect(&mut self) -> bool {
            let mut script = self.script.0.lock().expect("lock");
            if script.disconnects > 0 {
                script.disconnects -= 1;
                true
            } else {
                false
            }
        }
    }

    struct FakeFactory {
        script: SharedScript,
        created: Arc<StdMutex<u32>>,
    }

    impl TransportFactory for FakeFactory {
        type Transport = FakeTransport;

        fn create(&self) -> FakeTransport {
            *self.created.lock().expect("lock") += 1;
            FakeTransport {
                script: self.script.clone(),
            }
        }
    }

    fn manager() -> (ConnectionManager<FakeFactory>, SharedScript, Arc<StdMutex<u32>>) {
        let script = SharedScript::default();
        let created = Arc::new(StdMutex::new(0));
        let factory = FakeFactory {
            script: script.clone(),
            created: Arc::clone(&created),
        };
        let policy = ReconnectPolicy {
            connect_timeout_ms: 1_000,
            retry_delay_ms: 2_000,
            send_retry_budget: 3,
        };
        (ConnectionManager::new(factory, policy), script, created)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid RFC3339")
            .with_timezone(&Utc)
    }

    fn t0() -> DateTime<Utc> {
        ts("2026-08-01T12:00:00Z")
    }

    fn record(title: &str) -> NormalizedRecord {
        NormalizedRecord {
            title: title.to_string(),
            artist: "Artist".to_string(),
            progress_seconds: 0.0,
            duration_seconds: 180.0,
            is_playing: true,
            source_rule_id: None,
        }
    }

    // ── Connect lifecycle ───────────────────────────────────────

    #[tokio::test]
    async fn starts_disconnected_then_connects() {
        let (mut manager, _script, _created) = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_ready());

        assert!(manager.ensure_ready(t0()).await);
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn connect_failure_backs_off_then_retries() {
        let (mut manager, script, _created) = manager();
        script.push_login(Err("endpoint not running"));

        assert!(!manager.ensure_ready(t0()).await);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        // Within the retry delay nothing is attempted.
        script.push_login(Ok(()));
        assert!(!manager.ensure_ready(t0() + TimeDelta::seconds(1)).await);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        // After the fixed delay the next attempt runs and succeeds.
        assert!(manager.ensure_ready(t0() + TimeDelta::seconds(2)).await);
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn sends_skipped_while_not_ready() {
        let (mut manager, script, _created) = manager();
        assert_eq!(
            manager.push_activity(&record("Song"), t0()).await,
            SendOutcome::Skipped
        );
        assert_eq!(manager.clear_activity(t0()).await, SendOutcome::Skipped);
        assert!(script.activities().is_empty());
    }

    #[tokio::test]
    async fn successful_push_reaches_transport() {
        let (mut manager, script, _created) = manager();
        manager.ensure_ready(t0()).await;

        assert_eq!(
            manager.push_activity(&record("Song A"), t0()).await,
            SendOutcome::Sent
        );
        assert_eq!(script.activities(), vec!["Song A".to_string()]);
    }

    // ── Degrade & recover ───────────────────────────────────────

    #[tokio::test]
    async fn send_failure_degrades_then_recovers() {
        let (mut manager, script, _created) = manager();
        manager.ensure_ready(t0()).await;

        script.push_send(Err("pipe broken"));
        assert_eq!(
            manager.push_activity(&record("Song"), t0()).await,
            SendOutcome::Failed
        );
        assert_eq!(manager.state(), ConnectionState::Degraded);

        // Backoff, reconnect, send again.
        assert!(manager.ensure_ready(t0() + TimeDelta::seconds(2)).await);
        assert_eq!(
            manager
                .push_activity(&record("Song"), t0() + TimeDelta::seconds(2))
                .await,
            SendOutcome::Sent
        );
    }

    #[tokio::test]
    async fn external_disconnect_reenters_retry_loop() {
        let (mut manager, script, _created) = manager();
        manager.ensure_ready(t0()).await;
        assert!(manager.is_ready());

        script.signal_disconnect();
        assert!(!manager.ensure_ready(t0() + TimeDelta::seconds(1)).await);
        assert_eq!(manager.state(), ConnectionState::Degraded);

        // After the backoff the manager reconnects on its own.
        assert!(manager.ensure_ready(t0() + TimeDelta::seconds(3)).await);
    }

    // ── Forced handle recreation ────────────────────────────────

    #[tokio::test]
    async fn three_consecutive_send_timeouts_recreate_handle_then_succeed() {
        let (mut manager, script, created) = manager();
        manager.ensure_ready(t0()).await;
        assert_eq!(*created.lock().expect("lock"), 1);

        // Three consecutive failed pushes: the first two degrade and
        // reconnect, the third exhausts the budget.
        let mut now = t0();
        for i in 0..3 {
            script.push_send(Err("push timed out"));
            assert_eq!(
                manager.push_activity(&record("Song"), now).await,
                SendOutcome::Failed,
                "attempt {i} fails"
            );
            now += TimeDelta::seconds(3);
            if i < 2 {
                assert!(manager.ensure_ready(now).await, "reconnect between attempts");
            }
        }

        assert_eq!(
            *created.lock().expect("lock"),
            2,
            "handle torn down and recreated after the budget"
        );
        assert_eq!(manager.handle_generation(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Fourth attempt succeeds without manual intervention.
        now += TimeDelta::seconds(3);
        assert!(manager.ensure_ready(now).await);
        assert_eq!(
            manager.push_activity(&record("Song"), now).await,
            SendOutcome::Sent
        );
    }

    #[tokio::test]
    async fn repeated_clear_failures_recreate_handle() {
        let (mut manager, script, created) = manager();
        manager.ensure_ready(t0()).await;

        let mut now = t0();
        for _ in 0..3 {
            script.push_send(Err("clear rejected"));
            manager.clear_activity(now).await;
            now += TimeDelta::seconds(3);
            manager.ensure_ready(now).await;
        }

        assert_eq!(*created.lock().expect("lock"), 2);
        assert_eq!(script.clears(), 0, "no clear ever succeeded on the old handle");
    }

    #[tokio::test]
    async fn successful_send_resets_the_budget() {
        let (mut manager, script, created) = manager();
        manager.ensure_ready(t0()).await;

        let mut now = t0();
        // Two failures, then a success, then two more failures: the budget
        // never reaches three consecutive, so the handle survives.
        for result in [Err("x"), Err("x"), Ok(()), Err("x"), Err("x")] {
            script.push_send(result);
            manager.push_activity(&record("Song"), now).await;
            now += TimeDelta::seconds(3);
            manager.ensure_ready(now).await;
        }

        assert_eq!(*created.lock().expect("lock"), 1, "handle never recreated");
    }
}
