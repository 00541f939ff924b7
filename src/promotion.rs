//! Insight Promotion
//!
//! A timer-driven pass that writes high-reliability insights into external
//! guidance files and pulls them back out when reliability degrades. Every
//! action is appended to the promotion log. Promoted lines carry a hidden
//! key marker so removal never touches hand-written content.

use crate::cognitive::CognitiveStore;
use crate::config::{DataPaths, PromotionConfig};
use crate::errors::Result;
use crate::storage;
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    Promoted,
    Demoted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub ts: chrono::DateTime<Utc>,
    pub action: PromotionAction,
    pub key: String,
    pub statement: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PromotionStats {
    pub promoted: usize,
    pub demoted: usize,
}

pub struct PromotionLoop {
    cognitive: Arc<CognitiveStore>,
    paths: DataPaths,
    config: PromotionConfig,
    last_run_s: Mutex<Option<i64>>,
}

impl PromotionLoop {
    pub fn new(cognitive: Arc<CognitiveStore>, paths: DataPaths, config: PromotionConfig) -> Self {
        Self {
            cognitive,
            paths,
            config,
            last_run_s: Mutex::new(None),
        }
    }

    /// Run one pass, rate-limited to the configured interval. Demotions are
    /// handled before promotions so a degraded insight cannot survive the
    /// pass in a guidance file.
    pub fn run_once(&self, now_s: i64) -> Result<PromotionStats> {
        {
            let mut last = self.last_run_s.lock();
            if let Some(at) = *last {
                if now_s - at < self.config.interval_s as i64 {
                    return Ok(PromotionStats::default());
                }
            }
            *last = Some(now_s);
        }
        self.run_pass()
    }

    /// The pass itself, without the interval guard. Used at shutdown.
    pub fn run_pass(&self) -> Result<PromotionStats> {
        let mut stats = PromotionStats::default();

        for insight in self.cognitive.demotable(self.config.demotion_threshold) {
            let file = match self.cognitive.demote(&insight.key)? {
                Some(file) => file,
                None => insight.category.guidance_file().to_string(),
            };
            self.remove_line(&file, &insight.key)?;
            self.log(PromotionRecord {
                ts: Utc::now(),
                action: PromotionAction::Demoted,
                key: insight.key.clone(),
                statement: insight.statement.clone(),
                file,
                reason: Some("reliability_degraded".to_string()),
            });
            stats.demoted += 1;
        }

        for insight in self
            .cognitive
            .promotable(self.config.promote_reliability, self.config.promote_validations)
        {
            let file = insight.category.guidance_file().to_string();
            self.append_line(&file, &insight.key, &insight.statement)?;
            self.cognitive.mark_promoted(&insight.key, &file)?;
            self.log(PromotionRecord {
                ts: Utc::now(),
                action: PromotionAction::Promoted,
                key: insight.key.clone(),
                statement: insight.statement.clone(),
                file,
                reason: None,
            });
            stats.promoted += 1;
        }

        if stats.promoted > 0 || stats.demoted > 0 {
            tracing::info!(
                promoted = stats.promoted,
                demoted = stats.demoted,
                "Promotion pass complete"
            );
        }
        Ok(stats)
    }

    fn append_line(&self, file: &str, key: &str, statement: &str) -> Result<()> {
        let path = self.paths.guidance_file(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(crate::errors::KaitError::Other)?;
        }
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))
            .map_err(crate::errors::KaitError::Other)?;
        writeln!(handle, "- {} <!-- kait:{} -->", statement, key)
            .context("Failed to append guidance line")
            .map_err(crate::errors::KaitError::Other)?;
        Ok(())
    }

    fn remove_line(&self, file: &str, key: &str) -> Result<()> {
        let path = self.paths.guidance_file(file);
        if !path.exists() {
            return Ok(());
        }
        let marker = format!("<!-- kait:{} -->", key);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .map_err(crate::errors::KaitError::Other)?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| !line.contains(&marker))
            .collect();
        let mut rebuilt = kept.join("\n");
        if !rebuilt.is_empty() {
            rebuilt.push('\n');
        }
        storage::write_atomic(&path, rebuilt.as_bytes())
            .map_err(crate::errors::KaitError::Other)?;
        Ok(())
    }

    fn log(&self, record: PromotionRecord) {
        if let Err(e) = storage::append_jsonl(&self.paths.promotion_log(), &record) {
            tracing::warn!("Failed to append promotion log: {}", e);
        }
    }

    pub fn records(&self) -> Vec<PromotionRecord> {
        storage::read_jsonl(&self.paths.promotion_log()).unwrap_or_default()
    }
}
