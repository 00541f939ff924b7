//! Cognitive Insight Store
//!
//! Single-writer store of reliability-scored insights keyed by a stable
//! hash of category + normalized statement. Readers take cloned snapshots;
//! reliability updates are commutative counter bumps so concurrent
//! validations from different sessions stay safe.
//!
//! Persisted as one JSON snapshot rewritten atomically. Insights are never
//! deleted; promoted insights can only be demoted.

use crate::bus::{BusEvent, EventBus};
use crate::capture::MemoryCategory;
use crate::config::CognitiveConfig;
use crate::errors::{KaitError, Result, StoreError};
use crate::storage;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

const WILSON_Z: f64 = 1.96;
/// Validation count at which the readiness saturation term reaches 1.0
const SATURATION_N: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    Wisdom,
    SelfAwareness,
    UserUnderstanding,
    Reasoning,
    MetaLearning,
    Other,
}

impl InsightCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Wisdom => "wisdom",
            InsightCategory::SelfAwareness => "self_awareness",
            InsightCategory::UserUnderstanding => "user_understanding",
            InsightCategory::Reasoning => "reasoning",
            InsightCategory::MetaLearning => "meta_learning",
            InsightCategory::Other => "other",
        }
    }

    /// Weight applied in advisory readiness
    pub fn weight(&self) -> f64 {
        match self {
            InsightCategory::Wisdom => 1.0,
            InsightCategory::Reasoning => 0.95,
            InsightCategory::UserUnderstanding => 0.9,
            InsightCategory::MetaLearning => 0.85,
            InsightCategory::SelfAwareness => 0.8,
            InsightCategory::Other => 0.6,
        }
    }

    /// Guidance file that receives this category on promotion
    pub fn guidance_file(&self) -> &'static str {
        match self {
            InsightCategory::Wisdom | InsightCategory::Reasoning => "CLAUDE.md",
            InsightCategory::UserUnderstanding => "AGENTS.md",
            InsightCategory::MetaLearning | InsightCategory::Other => "TOOLS.md",
            InsightCategory::SelfAwareness => "SOUL.md",
        }
    }
}

impl From<MemoryCategory> for InsightCategory {
    fn from(category: MemoryCategory) -> Self {
        match category {
            MemoryCategory::Wisdom => InsightCategory::Wisdom,
            MemoryCategory::SelfAwareness => InsightCategory::SelfAwareness,
            MemoryCategory::UserUnderstanding => InsightCategory::UserUnderstanding,
            MemoryCategory::MetaLearning => InsightCategory::MetaLearning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub key: String,
    pub category: InsightCategory,
    pub statement: String,
    pub reliability: f64,
    pub validations: u64,
    pub contradictions: u64,
    /// Wilson lower bound on reliability
    pub confidence: f64,
    pub promoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to: Option<String>,
    /// Last supporting event ids, newest last
    pub evidence: VecDeque<String>,
    /// Last refuting event ids, newest last
    pub counter_examples: VecDeque<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<DateTime<Utc>>,
    pub advisory_readiness: f64,
}

impl Insight {
    pub fn new(
        category: InsightCategory,
        statement: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let statement = statement.into();
        Self {
            key: insight_key(category, &statement),
            category,
            statement,
            reliability: 0.0,
            validations: 0,
            contradictions: 0,
            confidence: 0.0,
            promoted: false,
            promoted_to: None,
            evidence: VecDeque::new(),
            counter_examples: VecDeque::new(),
            source: source.into(),
            created_at: Utc::now(),
            last_validated_at: None,
            advisory_readiness: 0.0,
        }
    }

    fn recompute(&mut self, halflife_s: u64, now: DateTime<Utc>) {
        let denominator = self.validations + self.contradictions;
        self.reliability = if denominator > 0 {
            self.validations as f64 / denominator as f64
        } else {
            0.0
        };
        self.confidence = wilson_lower_bound(self.validations, denominator);

        let saturation =
            ((1.0 + self.validations as f64).ln() / (1.0 + SATURATION_N).ln()).min(1.0);
        let anchor = self.last_validated_at.unwrap_or(self.created_at);
        let age_s = (now.signed_duration_since(anchor).num_seconds().max(0)) as f64;
        let recency = if halflife_s == 0 {
            1.0
        } else {
            0.5_f64.powf(age_s / halflife_s as f64)
        };
        self.advisory_readiness =
            (self.reliability * saturation * self.category.weight() * recency).clamp(0.0, 1.0);
    }
}

/// Stable key: category + lowercased, whitespace-collapsed statement.
pub fn insight_key(category: InsightCategory, statement: &str) -> String {
    let normalized = statement
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Wilson score interval lower bound for `successes` out of `n`.
pub fn wilson_lower_bound(successes: u64, n: u64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let p = successes as f64 / n;
    let z = WILSON_Z;
    let z2 = z * z;
    let denominator = 1.0 + z2 / n;
    let centre = p + z2 / (2.0 * n);
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    ((centre - margin) / denominator).clamp(0.0, 1.0)
}

pub struct CognitiveStore {
    inner: RwLock<BTreeMap<String, Insight>>,
    path: PathBuf,
    config: CognitiveConfig,
    bus: Option<EventBus>,
    degraded: AtomicBool,
}

impl CognitiveStore {
    pub fn load(path: PathBuf, config: CognitiveConfig) -> Result<Self> {
        let insights: BTreeMap<String, Insight> = storage::read_json_or_default(&path)
            .map_err(|e| {
                KaitError::Store(StoreError::CorruptRecord {
                    store: "cognitive".to_string(),
                    detail: e.to_string(),
                })
            })?;
        Ok(Self {
            inner: RwLock::new(insights),
            path,
            config,
            bus: None,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Insert a new insight or fold a re-observation into an existing one.
    /// A fresh insight starts with one validation: the observation that
    /// produced it. Returns the insight key.
    pub fn upsert(
        &self,
        category: InsightCategory,
        statement: &str,
        source: &str,
        event_id: &str,
    ) -> Result<String> {
        if self.is_degraded() {
            return Err(KaitError::Store(StoreError::Degraded {
                store: "cognitive".to_string(),
            }));
        }
        let statement: String = statement
            .chars()
            .take(self.config.statement_max_chars)
            .collect();
        let key = insight_key(category, &statement);
        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            let insight = inner.entry(key.clone()).or_insert_with(|| {
                Insight::new(category, statement.clone(), source.to_string())
            });
            insight.validations += 1;
            insight.last_validated_at = Some(now);
            push_ring(
                &mut insight.evidence,
                event_id.to_string(),
                self.config.evidence_ring,
            );
            insight.recompute(self.config.reliability_halflife_s, now);
        }
        self.persist()?;
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::InsightUpserted {
                key: key.clone(),
                category: category.as_str().to_string(),
            });
        }
        Ok(key)
    }

    /// Seed a fully formed insight, used at import time and in tests.
    pub fn insert(&self, mut insight: Insight) -> Result<()> {
        insight.recompute(self.config.reliability_halflife_s, Utc::now());
        self.inner.write().insert(insight.key.clone(), insight);
        self.persist()
    }

    pub fn validate(&self, key: &str, event_id: &str) -> Result<()> {
        self.bump(key, event_id, true)
    }

    pub fn contradict(&self, key: &str, event_id: &str) -> Result<()> {
        self.bump(key, event_id, false)
    }

    fn bump(&self, key: &str, event_id: &str, supporting: bool) -> Result<()> {
        if self.is_degraded() {
            return Err(KaitError::Store(StoreError::Degraded {
                store: "cognitive".to_string(),
            }));
        }
        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            let Some(insight) = inner.get_mut(key) else {
                return Err(KaitError::Store(StoreError::CorruptRecord {
                    store: "cognitive".to_string(),
                    detail: format!("unknown insight key {}", key),
                }));
            };
            if supporting {
                insight.validations += 1;
                insight.last_validated_at = Some(now);
                push_ring(
                    &mut insight.evidence,
                    event_id.to_string(),
                    self.config.evidence_ring,
                );
            } else {
                insight.contradictions += 1;
                push_ring(
                    &mut insight.counter_examples,
                    event_id.to_string(),
                    self.config.evidence_ring,
                );
            }
            insight.recompute(self.config.reliability_halflife_s, now);
        }
        self.persist()
    }

    /// Clear the promoted flag. Returns the file the insight was promoted
    /// to, if any, so the caller can remove the line.
    pub fn demote(&self, key: &str) -> Result<Option<String>> {
        let previous = {
            let mut inner = self.inner.write();
            let Some(insight) = inner.get_mut(key) else {
                return Ok(None);
            };
            let previous = insight.promoted_to.take();
            insight.promoted = false;
            previous
        };
        self.persist()?;
        Ok(previous)
    }

    pub fn mark_promoted(&self, key: &str, file: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if let Some(insight) = inner.get_mut(key) {
                insight.promoted = true;
                insight.promoted_to = Some(file.to_string());
            }
        }
        self.persist()
    }

    pub fn get(&self, key: &str) -> Option<Insight> {
        self.inner.read().get(key).cloned()
    }

    /// Cloned view of every insight, ordered by key.
    pub fn snapshot(&self) -> Vec<Insight> {
        self.inner.read().values().cloned().collect()
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner
            .read()
            .values()
            .map(|i| i.statement.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Insights eligible for promotion
    pub fn promotable(&self, min_reliability: f64, min_validations: u64) -> Vec<Insight> {
        self.inner
            .read()
            .values()
            .filter(|i| {
                !i.promoted && i.reliability >= min_reliability && i.validations >= min_validations
            })
            .cloned()
            .collect()
    }

    /// Promoted insights whose reliability has degraded
    pub fn demotable(&self, threshold: f64) -> Vec<Insight> {
        self.inner
            .read()
            .values()
            .filter(|i| i.promoted && i.reliability < threshold)
            .cloned()
            .collect()
    }

    /// Write the snapshot. One retry, then the store degrades to read-only.
    fn persist(&self) -> Result<()> {
        let snapshot = self.inner.read().clone();
        match storage::write_json_atomic(&self.path, &snapshot) {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!("Cognitive snapshot write failed, retrying: {}", first);
                match storage::write_json_atomic(&self.path, &snapshot) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.degraded.store(true, Ordering::Relaxed);
                        tracing::error!("Cognitive store degraded to read-only: {}", e);
                        Err(KaitError::Store(StoreError::WriteFailed {
                            path: self.path.clone(),
                            message: e.to_string(),
                        }))
                    }
                }
            }
        }
    }
}

fn push_ring(ring: &mut VecDeque<String>, value: String, capacity: usize) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &std::path::Path) -> CognitiveStore {
        CognitiveStore::load(dir.join("cognitive_insights.json"), CognitiveConfig::default())
            .unwrap()
    }

    #[test]
    fn test_upsert_starts_with_one_validation() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let key = store
            .upsert(InsightCategory::Wisdom, "use Glob before Read", "roast", "e1")
            .unwrap();
        let insight = store.get(&key).unwrap();
        assert_eq!(insight.validations, 1);
        assert_eq!(insight.contradictions, 0);
        assert_eq!(insight.reliability, 1.0);
    }

    #[test]
    fn test_upsert_same_statement_folds() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let k1 = store
            .upsert(InsightCategory::Wisdom, "Use Glob  before Read", "roast", "e1")
            .unwrap();
        let k2 = store
            .upsert(InsightCategory::Wisdom, "use glob before read", "roast", "e2")
            .unwrap();
        assert_eq!(k1, k2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&k1).unwrap().validations, 2);
    }

    #[test]
    fn test_reliability_arithmetic() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let key = store
            .upsert(InsightCategory::Wisdom, "run tests before pushing", "roast", "e1")
            .unwrap();
        store.validate(&key, "e2").unwrap();
        store.validate(&key, "e3").unwrap();
        store.contradict(&key, "e4").unwrap();

        let insight = store.get(&key).unwrap();
        assert_eq!(insight.validations, 3);
        assert_eq!(insight.contradictions, 1);
        assert!((insight.reliability - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_evidence_ring_bounded() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let key = store
            .upsert(InsightCategory::Wisdom, "bounded evidence", "roast", "e0")
            .unwrap();
        for n in 0..25 {
            store.validate(&key, &format!("e{}", n)).unwrap();
        }
        let insight = store.get(&key).unwrap();
        assert_eq!(insight.evidence.len(), 10);
        assert_eq!(insight.evidence.back().unwrap(), "e24");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.validate("nope", "e1").is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cognitive_insights.json");
        {
            let store =
                CognitiveStore::load(path.clone(), CognitiveConfig::default()).unwrap();
            store
                .upsert(InsightCategory::Wisdom, "zebra statement", "roast", "e1")
                .unwrap();
            store
                .upsert(InsightCategory::Reasoning, "alpha statement", "roast", "e2")
                .unwrap();
        }
        let first = std::fs::read_to_string(&path).unwrap();
        {
            // Reload and rewrite without mutating.
            let store =
                CognitiveStore::load(path.clone(), CognitiveConfig::default()).unwrap();
            store.persist().unwrap();
        }
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wilson_bound_properties() {
        assert_eq!(wilson_lower_bound(0, 0), 0.0);
        // More observations tighten the bound upward for the same ratio.
        let small = wilson_lower_bound(4, 5);
        let large = wilson_lower_bound(80, 100);
        assert!(large > small);
        assert!(wilson_lower_bound(100, 100) < 1.0);
    }

    #[test]
    fn test_promotable_and_demotable() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut strong = Insight::new(InsightCategory::Wisdom, "strong insight", "seed");
        strong.validations = 10;
        let strong_key = strong.key.clone();
        store.insert(strong).unwrap();

        let eligible = store.promotable(0.80, 5);
        assert_eq!(eligible.len(), 1);

        store.mark_promoted(&strong_key, "CLAUDE.md").unwrap();
        assert!(store.promotable(0.80, 5).is_empty());

        // Contradictions drag reliability under the demotion threshold.
        for n in 0..8 {
            store.contradict(&strong_key, &format!("c{}", n)).unwrap();
        }
        let demotable = store.demotable(0.65);
        assert_eq!(demotable.len(), 1);

        let previous = store.demote(&strong_key).unwrap();
        assert_eq!(previous.as_deref(), Some("CLAUDE.md"));
        assert!(!store.get(&strong_key).unwrap().promoted);
    }

    #[test]
    fn test_readiness_grows_with_validations() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let key = store
            .upsert(InsightCategory::Wisdom, "readiness check", "roast", "e1")
            .unwrap();
        let young = store.get(&key).unwrap().advisory_readiness;
        for n in 0..15 {
            store.validate(&key, &format!("e{}", n)).unwrap();
        }
        let seasoned = store.get(&key).unwrap().advisory_readiness;
        assert!(seasoned > young);
    }

    #[test]
    fn test_category_guidance_files() {
        assert_eq!(InsightCategory::Wisdom.guidance_file(), "CLAUDE.md");
        assert_eq!(InsightCategory::UserUnderstanding.guidance_file(), "AGENTS.md");
        assert_eq!(InsightCategory::MetaLearning.guidance_file(), "TOOLS.md");
        assert_eq!(InsightCategory::SelfAwareness.guidance_file(), "SOUL.md");
    }

    #[test]
    fn test_key_ignores_case_and_spacing() {
        let a = insight_key(InsightCategory::Wisdom, "Use  Glob First");
        let b = insight_key(InsightCategory::Wisdom, "use glob first");
        assert_eq!(a, b);
        let c = insight_key(InsightCategory::Reasoning, "use glob first");
        assert_ne!(a, c);
    }
}
