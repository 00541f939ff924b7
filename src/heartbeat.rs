//! Worker Heartbeats
//!
//! Each long-running worker writes a small heartbeat file on every cycle.
//! The status endpoint reads them back to report component health without
//! any cross-thread coordination.

use crate::config::DataPaths;
use crate::storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How stale a heartbeat may be before the component is reported degraded.
const STALE_AFTER_S: i64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker: String,
    pub at: DateTime<Utc>,
    pub cycles: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Missing,
}

/// Writer handle owned by one worker.
pub struct HeartbeatWriter {
    paths: DataPaths,
    worker: String,
    cycles: u64,
}

impl HeartbeatWriter {
    pub fn new(paths: DataPaths, worker: impl Into<String>) -> Self {
        Self {
            paths,
            worker: worker.into(),
            cycles: 0,
        }
    }

    pub fn beat(&mut self) {
        self.beat_with(None);
    }

    pub fn beat_with(&mut self, detail: Option<String>) {
        self.cycles += 1;
        let hb = Heartbeat {
            worker: self.worker.clone(),
            at: Utc::now(),
            cycles: self.cycles,
            detail,
        };
        let path = self.paths.heartbeat(&self.worker);
        if let Err(e) = storage::write_json_atomic(&path, &hb) {
            tracing::warn!(worker = %self.worker, "Failed to write heartbeat: {}", e);
        }
    }
}

/// Read a worker's health as seen from its heartbeat file.
pub fn component_status(paths: &DataPaths, worker: &str) -> ComponentStatus {
    let path = paths.heartbeat(worker);
    if !path.exists() {
        return ComponentStatus::Missing;
    }
    let hb: Result<Heartbeat> =
        storage::read_json_or_default::<Option<Heartbeat>>(&path).map(|o| match o {
            Some(hb) => hb,
            None => Heartbeat {
                worker: worker.to_string(),
                at: DateTime::<Utc>::MIN_UTC,
                cycles: 0,
                detail: None,
            },
        });
    match hb {
        Ok(hb) => {
            let age = Utc::now().signed_duration_since(hb.at).num_seconds();
            if age > STALE_AFTER_S {
                ComponentStatus::Degraded
            } else {
                ComponentStatus::Ok
            }
        }
        Err(_) => ComponentStatus::Degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_beat_then_status_ok() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf());
        let mut writer = HeartbeatWriter::new(paths.clone(), "kaitd");
        writer.beat();
        assert_eq!(component_status(&paths, "kaitd"), ComponentStatus::Ok);
    }

    #[test]
    fn test_missing_heartbeat() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf());
        assert_eq!(component_status(&paths, "bridge"), ComponentStatus::Missing);
    }

    #[test]
    fn test_cycle_counter_increments() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf());
        let mut writer = HeartbeatWriter::new(paths.clone(), "advisory");
        writer.beat();
        writer.beat();
        writer.beat();
        let hb: Option<Heartbeat> =
            storage::read_json_or_default(&paths.heartbeat("advisory")).unwrap();
        assert_eq!(hb.unwrap().cycles, 3);
    }

    #[test]
    fn test_stale_heartbeat_degraded() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf());
        let hb = Heartbeat {
            worker: "old".into(),
            at: Utc::now() - chrono::Duration::seconds(STALE_AFTER_S + 60),
            cycles: 1,
            detail: None,
        };
        storage::write_json_atomic(&paths.heartbeat("old"), &hb).unwrap();
        assert_eq!(component_status(&paths, "old"), ComponentStatus::Degraded);
    }
}
