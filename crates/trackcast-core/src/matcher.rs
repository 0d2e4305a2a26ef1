//! Candidate matching and canonical selection.
//!
//! Pure functions: given the current candidate descriptors and the enabled
//! pattern rules, decide which candidates are eligible and which single
//! candidate should be canonical. The tie-break is deterministic:
//!
//! 1. a candidate in the active window wins,
//! 2. otherwise the candidate that is already canonical wins (stability),
//! 3. otherwise the first match in input order wins.

use regex::Regex;

use crate::types::{CandidateDescriptor, DOMAIN_WILDCARD, PATH_WILDCARD, PatternRule};

/// A candidate that survived rule matching, tagged with the rule that won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedCandidate {
    pub candidate: CandidateDescriptor,
    pub rule_id: String,
}

// ─── URL Decomposition ────────────────────────────────────────────

/// Extract the host portion of a URL, lowercased, with any `www.` prefix
/// stripped. Returns `None` for URLs without a recognizable host.
fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .next_back()
        .unwrap_or("");
    // Strip a port suffix if present.
    let host = host.split(':').next().unwrap_or("");
    if host.is_empty() {
        return None;
    }
    let host = host.to_ascii_lowercase();
    Some(
        host.strip_prefix("www.")
            .map_or(host.clone(), str::to_string),
    )
}

/// Extract the path portion of a URL (leading `/` included, `/` if absent).
fn url_path(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    match rest.find('/') {
        Some(idx) => {
            let path = &rest[idx..];
            path.split(['?', '#']).next().unwrap_or("/").to_string()
        }
        None => "/".to_string(),
    }
}

// ─── Rule Matching ────────────────────────────────────────────────

/// Case-insensitive host match with `www.` ignored on both sides.
/// A pattern matches its exact host or any subdomain of it.
fn domain_matches(domain_pattern: &str, host: &str) -> bool {
    if domain_pattern == DOMAIN_WILDCARD {
        return true;
    }
    let pattern = domain_pattern.to_ascii_lowercase();
    let pattern = pattern.strip_prefix("www.").unwrap_or(&pattern);
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// At least one path pattern must match. A wildcard entry (or an empty
/// pattern list) matches everything; other entries are regex literals.
/// Invalid regexes are skipped rather than failing the whole rule.
fn path_matches(path_patterns: &[String], path: &str) -> bool {
    if path_patterns.is_empty() {
        return true;
    }
    path_patterns.iter().any(|pattern| {
        if pattern == PATH_WILDCARD {
            return true;
        }
        match Regex::new(pattern) {
            Ok(re) => re.is_match(path),
            Err(_) => false,
        }
    })
}

/// Return the candidates matching at least one enabled rule, preserving
/// input order. Each match carries the first rule (in rule order) that
/// survived both the domain and the path filter.
pub fn match_candidates(
    candidates: &[CandidateDescriptor],
    rules: &[PatternRule],
) -> Vec<MatchedCandidate> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let host = url_host(&candidate.url)?;
            let path = url_path(&candidate.url);
            let rule = rules.iter().find(|rule| {
                domain_matches(&rule.domain_pattern, &host)
                    && path_matches(&rule.path_patterns, &path)
            })?;
            Some(MatchedCandidate {
                candidate: candidate.clone(),
                rule_id: rule.rule_id.clone(),
            })
        })
        .collect()
}

/// Pick the canonical candidate among the matches.
///
/// `current_canonical` biases selection toward the session that already
/// holds canonical status so an unfocused-but-still-playing session is not
/// displaced by a background newcomer.
pub fn select_candidate<'a>(
    matched: &'a [MatchedCandidate],
    current_canonical: Option<&str>,
) -> Option<&'a MatchedCandidate> {
    if let Some(active) = matched.iter().find(|m| m.candidate.is_active_window) {
        return Some(active);
    }
    if let Some(current) = current_canonical
        && let Some(held) = matched.iter().find(|m| m.candidate.session_id == current)
    {
        return Some(held);
    }
    matched.first()
}

// ─── Tests ────────────────────────────────────────────────────────
