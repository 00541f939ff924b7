//! Implicit Feedback
//!
//! Every emitted advice becomes an exposure awaiting its signal. The next
//! same-tool observation for the session resolves it: success validates the
//! backing insight, failure contradicts it. A different tool arriving
//! inside the timeout marks the advice ignored, and stale exposures expire
//! silently. Replaying the same (event, advice) pair never double-counts.

use crate::advisory::AdviceItem;
use crate::cognitive::CognitiveStore;
use crate::config::FeedbackConfig;
use crate::eidos::EidosStore;
use crate::events::{Event, EventKind};
use crate::storage;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    Followed,
    Unhelpful,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub ts: chrono::DateTime<Utc>,
    pub advice_id: String,
    pub session_id: String,
    pub tool: String,
    pub signal: FeedbackSignal,
    pub success: bool,
    pub sources_used: Vec<String>,
    pub latency_s: f64,
}

#[derive(Debug, Clone)]
struct Exposure {
    advice_id: String,
    tool: String,
    insight_key: Option<String>,
    distillation_id: Option<i64>,
    source: String,
    at_s: i64,
}

#[derive(Default)]
struct MatcherState {
    /// session -> pending exposures
    pending: HashMap<String, Vec<Exposure>>,
    /// (event_id, advice_id) pairs already applied
    seen: HashSet<(String, String)>,
}

pub struct FeedbackMatcher {
    config: FeedbackConfig,
    cognitive: Arc<CognitiveStore>,
    eidos: Arc<EidosStore>,
    log_path: PathBuf,
    state: Mutex<MatcherState>,
}

impl FeedbackMatcher {
    pub fn new(
        config: FeedbackConfig,
        cognitive: Arc<CognitiveStore>,
        eidos: Arc<EidosStore>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            config,
            cognitive,
            eidos,
            log_path,
            state: Mutex::new(MatcherState::default()),
        }
    }

    /// Register emitted advice as pending exposures.
    pub fn record_exposure(
        &self,
        session_id: &str,
        tool: &str,
        items: &[AdviceItem],
        now_s: i64,
    ) {
        if items.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let pending = state.pending.entry(session_id.to_string()).or_default();
        for item in items {
            pending.push(Exposure {
                advice_id: item.advice_id.clone(),
                tool: tool.to_string(),
                insight_key: item.insight_key.clone(),
                distillation_id: item.distillation_id,
                source: item.source.as_str().to_string(),
                at_s: now_s,
            });
        }
    }

    /// Pair one processed event against the session's pending exposures.
    pub fn observe(&self, event: &Event) {
        let Some(event_tool) = event.tool.as_deref() else {
            return;
        };
        let now_s = event.ts_ns / 1_000_000_000;

        let resolutions: Vec<(Exposure, FeedbackSignal, bool)> = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.get_mut(&event.session_id) else {
                return;
            };

            let expiry = self.config.exposure_expiry_s as i64;
            pending.retain(|e| now_s - e.at_s <= expiry);

            let mut resolved = Vec::new();
            let timeout = self.config.exposure_timeout_s as i64;
            pending.retain(|exposure| {
                let same_tool = exposure.tool == event_tool;
                match event.kind {
                    EventKind::PostTool if same_tool => {
                        resolved.push((exposure.clone(), FeedbackSignal::Followed, true));
                        false
                    }
                    EventKind::PostToolFailure if same_tool => {
                        resolved.push((exposure.clone(), FeedbackSignal::Unhelpful, false));
                        false
                    }
                    EventKind::PreTool if !same_tool && now_s - exposure.at_s <= timeout => {
                        resolved.push((exposure.clone(), FeedbackSignal::Ignored, false));
                        false
                    }
                    _ => true,
                }
            });

            // Idempotence: drop pairs this event already applied.
            resolved.retain(|(exposure, _, _)| {
                state
                    .seen
                    .insert((event.event_id.clone(), exposure.advice_id.clone()))
            });
            resolved
        };

        for (exposure, signal, success) in resolutions {
            self.apply(event, &exposure, signal, success, now_s);
        }
    }

    fn apply(
        &self,
        event: &Event,
        exposure: &Exposure,
        signal: FeedbackSignal,
        success: bool,
        now_s: i64,
    ) {
        // Ignored exposures only feed rate tracking, never the stores.
        if signal != FeedbackSignal::Ignored {
            if let Some(key) = &exposure.insight_key {
                let result = if success {
                    self.cognitive.validate(key, &event.event_id)
                } else {
                    self.cognitive.contradict(key, &event.event_id)
                };
                if let Err(e) = result {
                    tracing::warn!(key = %key, "Feedback update failed: {}", e);
                }
            }
            if let Some(id) = exposure.distillation_id {
                if let Err(e) = self.eidos.record_usage(id, success) {
                    tracing::warn!(distillation_id = id, "Feedback update failed: {}", e);
                }
            }
        }

        let entry = FeedbackEntry {
            ts: Utc::now(),
            advice_id: exposure.advice_id.clone(),
            session_id: event.session_id.clone(),
            tool: exposure.tool.clone(),
            signal,
            success,
            sources_used: vec![exposure.source.clone()],
            latency_s: (now_s - exposure.at_s).max(0) as f64,
        };
        if let Err(e) = storage::append_jsonl(&self.log_path, &entry) {
            tracing::warn!("Failed to append feedback log: {}", e);
        }
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(session_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<FeedbackEntry> {
        storage::read_jsonl(&self.log_path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::SourceKind;
    use crate::cognitive::{Insight, InsightCategory};
    use crate::config::{CognitiveConfig, DataPaths, EidosConfig};
    use tempfile::tempdir;

    struct Fixture {
        matcher: FeedbackMatcher,
        cognitive: Arc<CognitiveStore>,
        insight_key: String,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let paths = DataPaths::new(dir.to_path_buf());
        let cognitive = Arc::new(
            CognitiveStore::load(paths.cognitive_snapshot(), CognitiveConfig::default()).unwrap(),
        );
        let mut insight =
            Insight::new(InsightCategory::Wisdom, "use Glob before Read", "seed");
        insight.validations = 100;
        let insight_key = insight.key.clone();
        cognitive.insert(insight).unwrap();
        let eidos = Arc::new(EidosStore::open(&paths.eidos_db(), EidosConfig::default()).unwrap());
        let matcher = FeedbackMatcher::new(
            FeedbackConfig::default(),
            cognitive.clone(),
            eidos,
            paths.feedback_log(),
        );
        Fixture {
            matcher,
            cognitive,
            insight_key,
        }
    }

    fn advice(id: &str, insight_key: &str) -> AdviceItem {
        AdviceItem {
            advice_id: id.into(),
            text: "use Glob before Read".into(),
            source: SourceKind::Cognitive,
            score: 1.0,
            insight_key: Some(insight_key.into()),
            distillation_id: None,
        }
    }

    fn event_at(kind: EventKind, session: &str, tool: &str, at_s: i64) -> Event {
        let mut event = Event::new(kind, session).with_tool(tool);
        event.ts_ns = at_s * 1_000_000_000;
        event
    }

    #[test]
    fn test_success_validates_insight() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher
            .observe(&event_at(EventKind::PostTool, "s1", "Read", 1005));

        assert_eq!(f.cognitive.get(&f.insight_key).unwrap().validations, 101);
        let entries = f.matcher.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].signal, FeedbackSignal::Followed);
        assert!(entries[0].success);
        assert_eq!(entries[0].tool, "Read");
    }

    #[test]
    fn test_failure_contradicts_insight() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher
            .observe(&event_at(EventKind::PostToolFailure, "s1", "Read", 1005));

        let insight = f.cognitive.get(&f.insight_key).unwrap();
        assert_eq!(insight.contradictions, 1);
        assert!(insight.reliability < 1.0);
        assert_eq!(f.matcher.entries()[0].signal, FeedbackSignal::Unhelpful);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        let success = event_at(EventKind::PostTool, "s1", "Read", 1005);
        f.matcher.observe(&success);
        let after_first = f.cognitive.get(&f.insight_key).unwrap().validations;

        // Replay the exact same event (crash recovery re-processing).
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher.observe(&success);
        assert_eq!(
            f.cognitive.get(&f.insight_key).unwrap().validations,
            after_first
        );
    }

    #[test]
    fn test_different_tool_marks_ignored() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher
            .observe(&event_at(EventKind::PreTool, "s1", "Bash", 1010));

        let entries = f.matcher.entries();
        assert_eq!(entries[0].signal, FeedbackSignal::Ignored);
        // Ignored never touches the store.
        assert_eq!(f.cognitive.get(&f.insight_key).unwrap().validations, 100);
        assert_eq!(f.matcher.pending_count("s1"), 0);
    }

    #[test]
    fn test_different_tool_after_timeout_keeps_pending() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        // Past the 30s ignore window but inside the 5min expiry.
        f.matcher
            .observe(&event_at(EventKind::PreTool, "s1", "Bash", 1060));
        assert_eq!(f.matcher.pending_count("s1"), 1);
    }

    #[test]
    fn test_expired_exposure_dropped() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        // Expiry default is 300s; the matching success arrives too late.
        f.matcher
            .observe(&event_at(EventKind::PostTool, "s1", "Read", 1400));
        assert!(f.matcher.entries().is_empty());
        assert_eq!(f.cognitive.get(&f.insight_key).unwrap().validations, 100);
    }

    #[test]
    fn test_sessions_isolated() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher
            .observe(&event_at(EventKind::PostTool, "s2", "Read", 1005));
        assert_eq!(f.matcher.pending_count("s1"), 1);
        assert!(f.matcher.entries().is_empty());
    }

    #[test]
    fn test_latency_recorded() {
        let dir = tempdir().unwrap();
        let f = fixture(dir.path());
        f.matcher
            .record_exposure("s1", "Read", &[advice("a1", &f.insight_key)], 1000);
        f.matcher
            .observe(&event_at(EventKind::PostTool, "s1", "Read", 1012));
        assert!((f.matcher.entries()[0].latency_s - 12.0).abs() < 1e-9);
    }
}
