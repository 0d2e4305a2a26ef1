//! History dwell rule: a track is committed to history only after it has
//! been the active record continuously for a minimum dwell time, and a
//! commit is deduplicated against the most recently written entry.
//!
//! Pure state machine — the caller supplies `now` and performs the actual
//! log write; this module only decides *whether* and *how* to commit.

use chrono::{DateTime, TimeDelta, Utc};

use crate::types::HistoryEntry;

/// Default minimum continuous dwell before a record is committed (seconds).
pub const DEFAULT_DWELL_SECS: u64 = 25;

// ─── Armed Commit ─────────────────────────────────────────────────

/// A candidate commit waiting out its dwell window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    /// Progress-ignoring key of the record that armed the timer.
    pub key: String,
    pub title: String,
    pub artist: String,
    pub source: String,
    pub armed_at: DateTime<Utc>,
}

/// Tracks the single armed dwell timer for the companion process.
///
/// Re-observing the same key keeps the existing timer running; observing a
/// different key discards the pending commit entirely and arms a fresh one
/// (no partial commits).
#[derive(Debug, Clone)]
pub struct DwellTracker {
    armed: Option<PendingCommit>,
    dwell: TimeDelta,
}

impl DwellTracker {
    pub fn new(dwell_secs: u64) -> Self {
        Self {
            armed: None,
            dwell: TimeDelta::seconds(dwell_secs as i64),
        }
    }

    /// Observe the current record. `key` must ignore progress (see
    /// `fingerprint::dwell_key`).
    pub fn observe(
        &mut self,
        key: &str,
        title: &str,
        artist: &str,
        source: &str,
        now: DateTime<Utc>,
    ) {
        if self.armed.as_ref().is_some_and(|a| a.key == key) {
            return;
        }
        self.armed = Some(PendingCommit {
            key: key.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            source: source.to_string(),
            armed_at: now,
        });
    }

    /// Discard any pending commit (incoming signal gone or activity cleared).
    pub fn discard(&mut self) {
        self.armed = None;
    }

    /// If the armed commit has dwelled long enough, take it. The timer is
    /// disarmed so a steady record commits exactly once.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Option<PendingCommit> {
        let due = self
            .armed
            .as_ref()
            .is_some_and(|a| now.signed_duration_since(a.armed_at) >= self.dwell);
        if due { self.armed.take() } else { None }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Key of the currently armed commit, if any.
    pub fn armed_key(&self) -> Option<&str> {
        self.armed.as_ref().map(|a| a.key.as_str())
    }
}

// ─── Commit Decision ──────────────────────────────────────────────

/// How a due pending commit should be applied to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitDecision {
    /// Append a fresh entry.
    Append(HistoryEntry),
    /// The last entry is the same track: extend its listened time instead.
    Extend { additional_ms: u64 },
}

/// Decide how to apply a due commit against the most recent log entry.
///
/// `now` is the moment the dwell timer fired; the listened duration is the
/// time the record was held (armed → due).
pub fn decide_commit(
    last: Option<&HistoryEntry>,
    pending: &PendingCommit,
    now: DateTime<Utc>,
) -> CommitDecision {
    let listened_ms = now
        .signed_duration_since(pending.armed_at)
        .num_milliseconds()
        .max(0) as u64;

    if let Some(last) = last
        && last.same_track(&pending.title, &pending.artist, &pending.source)
    {
        return CommitDecision::Extend {
            additional_ms: listened_ms,
        };
    }

    CommitDecision::Append(HistoryEntry {
        title: pending.title.clone(),
        artist: pending.artist.clone(),
        source: pending.source.clone(),
        played_at: pending.armed_at,
        total_listened_ms: listened_ms,
    })
}

// ─── Tests ────────────────────────────────────────────────────────
