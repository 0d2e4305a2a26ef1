use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Candidates & Rules ───────────────────────────────────────────

/// A raw tab/window descriptor as reported by the parser layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// Opaque identifier, stable for the lifetime of the tab/window.
    pub session_id: String,
    pub url: String,
    pub is_audible: bool,
    pub is_active_window: bool,
}

/// Path pattern entry that matches every path.
pub const PATH_WILDCARD: &str = "*";

/// Domain pattern entry that matches every host.
pub const DOMAIN_WILDCARD: &str = "*";

/// An enabled matching rule: a domain pattern plus one or more path
/// patterns. Each path pattern is either [`PATH_WILDCARD`] or a regex
/// literal tested against the URL path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub rule_id: String,
    pub domain_pattern: String,
    pub path_patterns: Vec<String>,
}

impl PatternRule {
    /// A permissive rule matching any host and any path.
    pub fn match_all(rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            domain_pattern: DOMAIN_WILDCARD.to_string(),
            path_patterns: vec![PATH_WILDCARD.to_string()],
        }
    }
}

// ─── Playback Records ─────────────────────────────────────────────

/// Normalized playback metadata handed to the core by the parser layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub title: String,
    pub artist: String,
    pub progress_seconds: f64,
    pub duration_seconds: f64,
    pub is_playing: bool,
    /// Which pattern rule matched the reporting session (if known).
    pub source_rule_id: Option<String>,
}

impl NormalizedRecord {
    /// Contract check: a record without a title cannot be displayed or
    /// deduplicated. Violations are dropped by callers, never propagated.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::MissingField("title"));
        }
        if !self.progress_seconds.is_finite() || self.progress_seconds < 0.0 {
            return Err(CoreError::InvalidField("progress_seconds"));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(CoreError::InvalidField("duration_seconds"));
        }
        Ok(())
    }

    /// Display label for the playback source (rule id, or "unknown").
    pub fn source_label(&self) -> &str {
        self.source_rule_id.as_deref().unwrap_or("unknown")
    }
}

/// One tracked candidate session on the arbitration side.
///
/// Canonical status is derived — a record is canonical exactly when its
/// `session_id` equals the store's canonical id. It is never stored here.
/// `record` is `None` between first observation of the candidate and its
/// first successful probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub record: Option<NormalizedRecord>,
    pub last_observed_at: DateTime<Utc>,
    /// Fingerprint of the last payload pushed for this session (dedup).
    pub last_sync_key: Option<String>,
}

// ─── Connection State ─────────────────────────────────────────────

/// Lifecycle of the single connection to the remote presence endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "ready" => Ok(Self::Ready),
            "degraded" => Ok(Self::Degraded),
            _ => Err(CoreError::InvalidField("connection state")),
        }
    }
}

// ─── History ──────────────────────────────────────────────────────

/// One committed played-track entry in the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title: String,
    pub artist: String,
    pub source: String,
    pub played_at: DateTime<Utc>,
    pub total_listened_ms: u64,
}

impl HistoryEntry {
    /// Two entries describe the same track when title, artist, and source
    /// all match. Progress and timestamps are irrelevant here.
    pub fn same_track(&self, title: &str, artist: &str, source: &str) -> bool {
        self.title == title && self.artist == artist && self.source == source
    }
}

// ─── Companion-Side Activity State ────────────────────────────────

/// The last record believed to be reflected in the remote presence
/// endpoint. Exactly one exists per companion process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub fingerprint: String,
    pub payload: NormalizedRecord,
    pub set_at: DateTime<Utc>,
}

// ─── Protocol: Arbiter <-> Companion ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub session_id: String,
    pub record: NormalizedRecord,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ready: bool,
}

// ─── Error ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    MissingField(&'static str),
    InvalidField(&'static str),
    InvalidRulePattern { rule_id: String, detail: String },
    InvalidUrl(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field: {field}"),
            Self::InvalidField(field) => write!(f, "invalid field: {field}"),
            Self::InvalidRulePattern { rule_id, detail } => {
                write!(f, "invalid pattern in rule {rule_id}: {detail}")
            }
            Self::InvalidUrl(url) => write!(f, "invalid url: {url}"),
        }
    }
}

impl std::error::Error for CoreError {}

// ─── Tests ────────────────────────────────────────────────────────
