//! Per-session debounce + cancellable outgoing pushes.
//!
//! Bursts of updates for one session coalesce into a single outgoing
//! synchronization request carrying the last-scheduled payload. Firing
//! aborts any in-flight request for the same session first, so an older
//! request can never win after a newer one has been scheduled. Cancelling a
//! session kills both its pending timer and its in-flight request; a
//! cancelled session never produces a late network call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use chrono::Utc;
use thiserror::Error;

use trackcast_core::types::{ClearRequest, NormalizedRecord, PushRequest};

use crate::timer::CancellableTimer;

/// Default debounce window before a scheduled update fires.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("companion unreachable: {0}")]
    Unreachable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Destination for outgoing synchronization requests.
pub trait PushSink: Send + Sync + 'static {
    fn push(&self, request: PushRequest) -> impl Future<Output = Result<(), SinkError>> + Send;
    fn clear(&self, request: ClearRequest) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Push,
    Clear,
}

#[derive(Debug, Clone)]
enum Op {
    Push(PushRequest),
    Clear(ClearRequest),
}

impl Op {
    fn kind(&self) -> OpKind {
        match self {
            Self::Push(_) => OpKind::Push,
            Self::Clear(_) => OpKind::Clear,
        }
    }
}

#[derive(Debug)]
struct Inflight {
    token: u64,
    kind: OpKind,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SessionOps {
    debounce: CancellableTimer,
    inflight: Option<Inflight>,
}

/// Debouncing dispatcher over a [`PushSink`].
#[derive(Debug)]
pub struct UpdateDispatcher<S> {
    sink: Arc<S>,
    debounce: Duration,
    sessions: Arc<StdMutex<HashMap<String, SessionOps>>>,
    next_token: Arc<AtomicU64>,
}

impl<S> Clone for UpdateDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            debounce: self.debounce,
            sessions: Arc::clone(&self.sessions),
            next_token: Arc::clone(&self.next_token),
        }
    }
}

impl<S: PushSink> UpdateDispatcher<S> {
    pub fn new(sink: S, debounce: Duration) -> Self {
        Self {
            sink: Arc::new(sink),
            debounce,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionOps>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule a push for this session, replacing any pending timer for it.
    /// Timers do not stack: only the last-scheduled payload fires.
    pub fn schedule(&self, session_id: &str, record: NormalizedRecord) {
        let mut sessions = self.lock_sessions();
        let entry = sessions.entry(session_id.to_string()).or_default();

        let this = self.clone();
        let id = session_id.to_string();
        entry.debounce.schedule(self.debounce, async move {
            this.fire(&id, record);
        });
    }

    /// Abort any in-flight request for this session, then send.
    fn fire(&self, session_id: &str, record: NormalizedRecord) {
        self.spawn_op(
            session_id,
            Op::Push(PushRequest {
                session_id: session_id.to_string(),
                record,
                timestamp: Utc::now(),
            }),
        );
    }

    /// Send a clear for this session immediately, superseding any pending
    /// push. If a clear is already in flight for the session, skip — the
    /// clear path is idempotent.
    pub fn send_clear(&self, session_id: &str) {
        {
            let sessions = self.lock_sessions();
            if let Some(entry) = sessions.get(session_id)
                && entry
                    .inflight
                    .as_ref()
                    .is_some_and(|op| op.kind == OpKind::Clear && !op.handle.is_finished())
            {
                return;
            }
        }
        self.spawn_op(
            session_id,
            Op::Clear(ClearRequest {
                session_id: session_id.to_string(),
            }),
        );
    }

    fn spawn_op(&self, session_id: &str, op: Op) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let kind = op.kind();
        let sink = Arc::clone(&self.sink);
        let sessions = Arc::clone(&self.sessions);
        let id = session_id.to_string();

        let mut guard = self.lock_sessions();
        let entry = guard.entry(id.clone()).or_default();
        if kind == OpKind::Clear {
            entry.debounce.cancel();
        }
        if let Some(previous) = entry.inflight.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            let result = match op {
                Op::Clear(clear) => sink.clear(clear).await,
                Op::Push(push) => sink.push(push).await,
            };
            match result {
                Ok(()) => {
                    // Clear the in-flight slot only if it still holds the
                    // handle used for this send.
                    let mut sessions = sessions.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = sessions.get_mut(&id)
                        && entry.inflight.as_ref().is_some_and(|op| op.token == token)
                    {
                        entry.inflight = None;
                    }
                }
                Err(e) => {
                    tracing::warn!("sync request for {id} failed: {e}");
                }
            }
        });

        entry.inflight = Some(Inflight {
            token,
            kind,
            handle,
        });
    }

    /// Cancel everything outstanding for a session: the pending debounce
    /// timer and any in-flight request. Idempotent; never fails.
    pub fn cancel(&self, session_id: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(mut entry) = sessions.remove(session_id) {
            entry.debounce.cancel();
            if let Some(inflight) = entry.inflight.take() {
                inflight.handle.abort();
            }
        }
    }

    /// Whether a debounce timer is pending for this session.
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.lock_sessions()
            .get(session_id)
            .is_some_and(|entry| entry.debounce.is_pending())
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep};

    /// Sink that records completions after an optional artificial delay.
    struct RecordingSink {
        pushes: StdMutex<Vec<PushRequest>>,
        clears: StdMutex<Vec<String>>,
        delay: Duration,
    }

    impl RecordingSink {
        fn new(delay: Duration) -> Self {
            Self {
                pushes: StdMutex::new(Vec::new()),
                clears: StdMutex::new(Vec::new()),
                delay,
            }
        }
    }

    impl PushSink for Arc<RecordingSink> {
        async fn push(&self, request: PushRequest) -> Result<(), SinkError> {
            sleep(self.delay).await;
            self.pushes.lock().expect("lock").push(request);
            Ok(())
        }

        async fn clear(&self, request: ClearRequest) -> Result<(), SinkError> {
            sleep(self.delay).await;
            self.clears.lock().expect("lock").push(request.session_id);
            Ok(())
        }
    }

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

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_to_last_payload() {
        let sink = Arc::new(RecordingSink::new(Duration::ZERO));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        for i in 1..=5 {
            dispatcher.schedule("tab-1", record(&format!("Song {i}")));
            advance(Duration::from_millis(100)).await;
        }

        advance(Duration::from_millis(600)).await;
        settle().await;

        let pushes = sink.pushes.lock().expect("lock");
        assert_eq!(pushes.len(), 1, "burst coalesces into one push");
        assert_eq!(pushes[0].record.title, "Song 5", "last payload wins");
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_debounce_independently() {
        let sink = Arc::new(RecordingSink::new(Duration::ZERO));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        dispatcher.schedule("tab-a", record("A"));
        dispatcher.schedule("tab-b", record("B"));

        advance(Duration::from_millis(600)).await;
        settle().await;

        let pushes = sink.pushes.lock().expect("lock");
        assert_eq!(pushes.len(), 2, "each session fires its own push");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_kills_pending_timer_and_inflight_request() {
        let sink = Arc::new(RecordingSink::new(Duration::from_secs(1)));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        // First update fires and goes in flight (slow sink).
        dispatcher.schedule("tab-1", record("In flight"));
        advance(Duration::from_millis(510)).await;
        settle().await;

        // Second update is still pending when the session is cancelled.
        dispatcher.schedule("tab-1", record("Pending"));
        assert!(dispatcher.has_pending("tab-1"));

        dispatcher.cancel("tab-1");
        dispatcher.cancel("tab-1"); // idempotent

        advance(Duration::from_secs(5)).await;
        settle().await;

        assert!(sink.pushes.lock().expect("lock").is_empty(), "no late network calls");
        assert!(!dispatcher.has_pending("tab-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_push_aborts_superseded_inflight() {
        let sink = Arc::new(RecordingSink::new(Duration::from_secs(1)));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        dispatcher.schedule("tab-1", record("Old"));
        advance(Duration::from_millis(510)).await;
        settle().await; // "Old" now in flight, sleeping in the sink

        dispatcher.schedule("tab-1", record("New"));
        advance(Duration::from_millis(510)).await;
        settle().await; // firing "New" aborts "Old" first

        advance(Duration::from_secs(2)).await;
        settle().await;

        let pushes = sink.pushes.lock().expect("lock");
        assert_eq!(pushes.len(), 1, "aborted request never completes");
        assert_eq!(pushes[0].record.title, "New");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_supersedes_pending_push() {
        let sink = Arc::new(RecordingSink::new(Duration::ZERO));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        dispatcher.schedule("tab-1", record("Never sent"));
        dispatcher.send_clear("tab-1");

        advance(Duration::from_secs(2)).await;
        settle().await;

        assert!(sink.pushes.lock().expect("lock").is_empty());
        assert_eq!(sink.clears.lock().expect("lock").as_slice(), ["tab-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_clear_is_skipped_while_one_is_in_flight() {
        let sink = Arc::new(RecordingSink::new(Duration::from_secs(1)));
        let dispatcher = UpdateDispatcher::new(Arc::clone(&sink), Duration::from_millis(500));

        dispatcher.send_clear("tab-1");
        settle().await;
        dispatcher.send_clear("tab-1");
        dispatcher.send_clear("tab-1");

        advance(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(
            sink.clears.lock().expect("lock").len(),
            1,
            "redundant clears are skipped while one is in flight"
        );
    }
}
