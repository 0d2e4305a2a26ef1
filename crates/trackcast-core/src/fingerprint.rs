//! Derived comparison keys for presence dedup.
//!
//! The presence fingerprint covers exactly the fields the remote endpoint
//! displays — title, artist, play state, duration, and a coarse progress
//! bucket. Raw sub-second progress is deliberately excluded so ordinary
//! playback advancement does not cause redundant pushes.

use crate::types::NormalizedRecord;

/// Width of the coarse progress bucket in seconds. Progress movement within
/// a bucket does not change the fingerprint.
pub const PROGRESS_BUCKET_SECS: u64 = 15;

/// Field separator for derived keys; unit separator avoids collisions with
/// titles containing printable punctuation.
const SEP: char = '\u{1f}';

/// Coarse progress bucket index for a raw progress value.
pub fn progress_bucket(progress_seconds: f64) -> u64 {
    if !progress_seconds.is_finite() || progress_seconds <= 0.0 {
        return 0;
    }
    (progress_seconds as u64) / PROGRESS_BUCKET_SECS
}

/// Fingerprint over the fields that matter for presence display.
///
/// Two records with the same fingerprint would render identically on the
/// remote endpoint, so pushing both is redundant.
pub fn presence_fingerprint(record: &NormalizedRecord) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}",
        record.title,
        record.artist,
        record.is_playing,
        progress_bucket(record.progress_seconds),
        record.duration_seconds.round() as i64,
    )
}

/// Comparison key ignoring progress entirely. Used by the history dwell
/// rule: only a change to this key re-arms the dwell timer.
pub fn dwell_key(record: &NormalizedRecord) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{}",
        record.title,
        record.artist,
        record.is_playing,
        record.source_label(),
    )
}

// ─── Tests ────────────────────────────────────────────────────────
