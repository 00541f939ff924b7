//! Decision Ledger
//!
//! Append-only audit of every advisory call, emitted or blocked. One line
//! per call, newline-delimited JSON.

use super::AdviceRoute;
use crate::storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Emitted,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceDecision {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub tool: String,
    pub outcome: DecisionOutcome,
    pub route: AdviceRoute,
    pub selected_count: usize,
    pub suppressed_count: usize,
    pub sources: Vec<SourceCount>,
    #[serde(default)]
    pub suppression_reasons: Vec<String>,
}

pub struct DecisionLedger {
    path: PathBuf,
}

impl DecisionLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn record(&self, decision: &AdviceDecision) {
        if let Err(e) = storage::append_jsonl(&self.path, decision) {
            tracing::warn!("Failed to append decision ledger: {}", e);
        }
    }

    pub fn entries(&self) -> Vec<AdviceDecision> {
        storage::read_jsonl(&self.path).unwrap_or_default()
    }
}
