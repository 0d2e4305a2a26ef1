//! Played-track history: dwell-gated commits into an append-only log.
//!
//! A track is committed only after it has been the active record for the
//! full dwell window; a commit matching the most recent entry extends that
//! entry's listened time instead of appending a duplicate. The log itself
//! is newline-delimited JSON, newest last.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use trackcast_core::history::{CommitDecision, DwellTracker, decide_commit};
use trackcast_core::types::HistoryEntry;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history entry malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ─── Log Backend ──────────────────────────────────────────────────

/// Persistence behind the recorder. Append-only except for the in-place
/// listened-time increment on the newest entry.
pub trait HistoryLog: Send {
    fn append(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError>;

    /// Replace the newest entry (used to extend `total_listened_ms`).
    fn update_last(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError>;

    fn last(&self) -> Result<Option<HistoryEntry>, HistoryError>;

    fn read_all(&self) -> Result<Vec<HistoryEntry>, HistoryError>;
}

/// Newline-delimited JSON file, one entry per line, newest last.
#[derive(Debug)]
pub struct JsonlHistoryLog {
    path: PathBuf,
}

impl JsonlHistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn write_lines(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        let mut file = File::create(&self.path)?;
        for entry in entries {
            serde_json::to_writer(&mut file, entry)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl HistoryLog for JsonlHistoryLog {
    fn append(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, entry)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn update_last(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.read_lines()?;
        match entries.last_mut() {
            Some(last) => {
                *last = entry.clone();
                self.write_lines(&entries)
            }
            None => self.append(entry),
        }
    }

    fn last(&self) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self.read_lines()?.pop())
    }

    fn read_all(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.read_lines()
    }
}

/// In-memory log for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryHistoryLog {
    entries: Vec<HistoryEntry>,
}

impl MemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryLog for MemoryHistoryLog {
    fn append(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn update_last(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        match self.entries.last_mut() {
            Some(last) => *last = entry.clone(),
            None => self.entries.push(entry.clone()),
        }
        Ok(())
    }

    fn last(&self) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self.entries.last().cloned())
    }

    fn read_all(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(self.entries.clone())
    }
}

// ─── Recorder ─────────────────────────────────────────────────────

/// What a due commit did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Appended,
    Extended,
}

/// Dwell-gated writer over a [`HistoryLog`].
pub struct HistoryRecorder<L> {
    log: L,
    dwell: DwellTracker,
}

impl<L: HistoryLog> HistoryRecorder<L> {
    pub fn new(log: L, dwell_secs: u64) -> Self {
        Self {
            log,
            dwell: DwellTracker::new(dwell_secs),
        }
    }

    /// Observe the reconciled record. `key` must ignore progress so ordinary
    /// playback advancement keeps the dwell timer running.
    pub fn observe(
        &mut self,
        key: &str,
        title: &str,
        artist: &str,
        source: &str,
        now: DateTime<Utc>,
    ) {
        self.dwell.observe(key, title, artist, source, now);
    }

    /// Discard any pending commit (activity cleared or signal lost).
    pub fn discard_pending(&mut self) {
        self.dwell.discard();
    }

    /// Drive the dwell timer. When a commit is due it is applied to the
    /// log: appended if it differs from the newest entry, or folded into
    /// it when the track matches.
    pub fn poll_due(&mut self, now: DateTime<Utc>) -> Option<CommitOutcome> {
        let pending = self.dwell.take_due(now)?;
        let last = match self.log.last() {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!("history log read failed: {e}");
                return None;
            }
        };

        let result = match decide_commit(last.as_ref(), &pending, now) {
            CommitDecision::Append(entry) => {
                tracing::debug!("history: {} — {}", entry.artist, entry.title);
                self.log.append(&entry).map(|()| CommitOutcome::Appended)
            }
            CommitDecision::Extend { additional_ms } => {
                // decide_commit only extends when a last entry exists.
                let Some(mut entry) = last else { return None };
                entry.total_listened_ms = entry.total_listened_ms.saturating_add(additional_ms);
                self.log
                    .update_last(&entry)
                    .map(|()| CommitOutcome::Extended)
            }
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!("history commit failed: {e}");
                None
            }
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

// ─── Tests ────────────────────────────────────────────────────────
