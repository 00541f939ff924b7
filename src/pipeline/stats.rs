//! Batch Cycle Stats
//!
//! Persisted after every pipeline cycle; the status surface reads them back
//! to report the last cycle age.

use crate::storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cycles: u64,
    pub events_processed: u64,
    pub insights_created: u64,
    pub empty_cycles: u64,
    /// Duration of the most recent non-empty cycle
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl PipelineStats {
    pub fn load(path: &Path) -> Result<Self> {
        storage::read_json_or_default(path)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        storage::write_json_atomic(path, self)
    }

    /// Seconds since the last completed cycle, if any.
    pub fn last_cycle_age_s(&self) -> Option<i64> {
        self.last_cycle_at
            .map(|at| Utc::now().signed_duration_since(at).num_seconds().max(0))
    }
}
