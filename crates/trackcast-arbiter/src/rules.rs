//! Enabled-rule cache fed by the external settings layer.
//!
//! The settings store notifies on change; the cache republishes the rule
//! set over a watch channel so the arbitrator always reads current truth
//! without blocking on storage.

use std::sync::Arc;
use tokio::sync::watch;

use trackcast_core::types::PatternRule;

/// Writer half: the settings subscription pushes updates here.
#[derive(Debug, Clone)]
pub struct RuleCache {
    tx: watch::Sender<Arc<Vec<PatternRule>>>,
}

/// Reader half handed to the arbitrator.
pub type RuleFeed = watch::Receiver<Arc<Vec<PatternRule>>>;

impl RuleCache {
    pub fn new(initial: Vec<PatternRule>) -> (Self, RuleFeed) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Self { tx }, rx)
    }

    /// Replace the enabled rule set. Readers see the update on their next
    /// borrow; no notification ordering is needed beyond that.
    pub fn update(&self, rules: Vec<PatternRule>) {
        let _ = self.tx.send(Arc::new(rules));
    }

    pub fn current(&self) -> Arc<Vec<PatternRule>> {
        self.tx.borrow().clone()
    }
}

// ─── Tests ────────────────────────────────────────────────────────
