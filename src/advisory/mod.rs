//! Advisory Engine
//!
//! Just-in-time pre-tool advice. Every call fans out to four sources under
//! a shared deadline, fuses the rankings, applies suppression, and writes a
//! decision-ledger row whether or not anything is emitted. The caller is
//! never blocked past the call budget: on any fault the call returns an
//! empty list and the ledger records the block.

pub mod fusion;
mod ledger;
mod packets;
mod sources;
mod suppress;

pub use ledger::{AdviceDecision, DecisionLedger, DecisionOutcome, SourceCount};
pub use packets::{exact_key, relaxed_key, Packet, PacketCache};
pub use sources::{
    AdviceSource, CognitiveSource, EidosSource, KeywordScorer, PacketSource, SemanticScorer,
    SemanticSource,
};
pub use suppress::{Suppressor, REASON_ADVISOR_ERROR};

use crate::bus::{BusEvent, EventBus};
use crate::cognitive::CognitiveStore;
use crate::config::{AdvisoryConfig, DataPaths};
use crate::eidos::EidosStore;
use crate::errors::Result;
use crate::ralph::content_tokens;
use crate::storage;
use chrono::Utc;
use fusion::{rerank, rrf_fuse, FusedItem};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Cognitive,
    Eidos,
    Semantic,
    Packet,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Cognitive => "cognitive",
            SourceKind::Eidos => "eidos",
            SourceKind::Semantic => "semantic",
            SourceKind::Packet => "packet",
        }
    }
}

/// How the answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceRoute {
    Live,
    PacketExact,
    PacketRelaxed,
    PacketRelaxedFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceItem {
    pub advice_id: String,
    pub text: String,
    pub source: SourceKind,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distillation_id: Option<i64>,
}

/// Normalized retrieval context shared by all sources
#[derive(Debug, Clone)]
pub struct AdviceQuery {
    pub session_id: String,
    pub tool: String,
    pub arg_head: String,
    pub phase: String,
    pub tokens: HashSet<String>,
}

impl AdviceQuery {
    pub fn new(session_id: &str, tool: &str, context: &str, phase: &str) -> Self {
        let mut tokens = content_tokens(context);
        tokens.insert(tool.to_lowercase());
        Self {
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            arg_head: context.split_whitespace().take(3).collect::<Vec<_>>().join(" "),
            phase: phase.to_string(),
            tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdviceRequest {
    pub session_id: String,
    pub tool: String,
    pub tool_args: Map<String, Value>,
    pub context: Option<String>,
    /// Remaining caller budget; defaults to the configured budget
    pub budget_ms: Option<u64>,
}

/// One advice-log line, the full emitted-item audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceLogEntry {
    pub ts: chrono::DateTime<Utc>,
    pub session_id: String,
    pub tool: String,
    pub advice_id: String,
    pub text: String,
    pub source: SourceKind,
    pub score: f64,
}

pub struct Advisor {
    cognitive: Arc<CognitiveStore>,
    eidos: Arc<EidosStore>,
    packet_cache: Arc<PacketCache>,
    live_sources: Vec<Arc<dyn AdviceSource>>,
    packet_source: Arc<dyn AdviceSource>,
    suppressor: Suppressor,
    ledger: DecisionLedger,
    advice_log: PathBuf,
    bus: Option<EventBus>,
    config: RwLock<Arc<AdvisoryConfig>>,
}

impl Advisor {
    pub fn new(
        config: AdvisoryConfig,
        paths: &DataPaths,
        cognitive: Arc<CognitiveStore>,
        eidos: Arc<EidosStore>,
    ) -> Self {
        let packet_cache = Arc::new(PacketCache::new(config.packet_capacity));
        let live_sources: Vec<Arc<dyn AdviceSource>> = vec![
            Arc::new(CognitiveSource::new(cognitive.clone())),
            Arc::new(EidosSource::new(eidos.clone())),
            Arc::new(SemanticSource::keyword(cognitive.clone())),
        ];
        let packet_source: Arc<dyn AdviceSource> =
            Arc::new(PacketSource::new(packet_cache.clone()));
        Self {
            cognitive,
            eidos,
            packet_cache,
            live_sources,
            packet_source,
            suppressor: Suppressor::new(),
            ledger: DecisionLedger::new(paths.decision_ledger()),
            advice_log: paths.advice_log(),
            bus: None,
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace a semantic backend, e.g. an embedding-backed scorer.
    pub fn with_semantic_scorer(mut self, scorer: Box<dyn SemanticScorer>) -> Self {
        self.live_sources[2] = Arc::new(SemanticSource::with_scorer(
            self.cognitive.clone(),
            scorer,
        ));
        self
    }

    /// Publish an updated advisory configuration snapshot.
    pub fn reload_config(&self, config: AdvisoryConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    /// Entry point for the pre-tool path. Never errors toward the caller;
    /// faults surface as an empty list plus a blocked ledger row.
    pub async fn advise(&self, request: &AdviceRequest) -> Vec<AdviceItem> {
        let config = self.config.read().clone();
        match self.advise_inner(request, &config).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(tool = %request.tool, "Advisory fault: {}", e);
                self.ledger.record(&AdviceDecision {
                    ts: Utc::now(),
                    session_id: request.session_id.clone(),
                    tool: request.tool.clone(),
                    outcome: DecisionOutcome::Blocked,
                    route: AdviceRoute::Live,
                    selected_count: 0,
                    suppressed_count: 0,
                    sources: Vec::new(),
                    suppression_reasons: vec![REASON_ADVISOR_ERROR.to_string()],
                });
                Vec::new()
            }
        }
    }

    async fn advise_inner(
        &self,
        request: &AdviceRequest,
        config: &AdvisoryConfig,
    ) -> Result<Vec<AdviceItem>> {
        let started = Instant::now();
        let budget_ms = request.budget_ms.unwrap_or(config.budget_ms);
        let query = self.build_query(request);
        let now_s = Utc::now().timestamp();

        // Quick fallback: not enough budget for the full pipeline.
        if budget_ms < config.quick_min_ms {
            return self.quick_path(request, &query, config, now_s).await;
        }

        let deadline = Duration::from_millis(budget_ms.saturating_sub(100).max(50));
        let mut rankings: Vec<(&'static str, f64, Vec<AdviceItem>)> = Vec::new();
        let mut live_failed = 0usize;

        let mut futures = Vec::new();
        for source in self.live_sources.iter().chain(std::iter::once(&self.packet_source)) {
            let source = source.clone();
            let query = query.clone();
            let k = config.per_source_k;
            futures.push(async move {
                let name = source.name();
                let result = tokio::time::timeout(deadline, source.retrieve(&query, k)).await;
                (name, result)
            });
        }

        let results = futures::future::join_all(futures).await;
        let mut packet_items = 0usize;
        for (name, result) in results {
            let weight = match name {
                "cognitive" => config.weight_cognitive,
                "eidos" => config.weight_eidos,
                "semantic" => config.weight_semantic,
                _ => config.weight_packet,
            };
            match result {
                Ok(Ok(items)) => {
                    if name == "packet" {
                        packet_items = items.len();
                    }
                    rankings.push((name, weight, items));
                }
                Ok(Err(e)) => {
                    tracing::warn!(source = name, "Advice source failed: {}", e);
                    live_failed += 1;
                }
                Err(_) => {
                    tracing::warn!(source = name, "Advice source timed out");
                    live_failed += 1;
                }
            }
        }

        // Every live source died but the packet cache answered.
        let route = if live_failed >= self.live_sources.len() && packet_items > 0 {
            AdviceRoute::PacketRelaxedFallback
        } else {
            AdviceRoute::Live
        };

        let source_counts: Vec<SourceCount> = rankings
            .iter()
            .filter(|(_, _, items)| !items.is_empty())
            .map(|(name, _, items)| SourceCount {
                source: name.to_string(),
                items: items.len(),
            })
            .collect();

        let fused = rrf_fuse(rankings);
        let skip_rerank = started.elapsed().as_millis() as u64
            > budget_ms.saturating_sub(config.quick_min_ms);
        let ranked = if skip_rerank {
            fused
        } else {
            rerank(fused, &query, config.rerank_m)
        };
        let selected: Vec<FusedItem> = ranked.into_iter().take(config.max_emit).collect();

        if selected.is_empty() {
            self.ledger.record(&AdviceDecision {
                ts: Utc::now(),
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                outcome: DecisionOutcome::Blocked,
                route,
                selected_count: 0,
                suppressed_count: 0,
                sources: source_counts,
                suppression_reasons: vec!["no_candidates".to_string()],
            });
            return Ok(Vec::new());
        }

        if let Some(reason) = self.suppressor.evaluate(
            config,
            &request.session_id,
            &request.tool,
            &selected,
            now_s,
        ) {
            self.ledger.record(&AdviceDecision {
                ts: Utc::now(),
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                outcome: DecisionOutcome::Blocked,
                route,
                selected_count: 0,
                suppressed_count: selected.len(),
                sources: source_counts,
                suppression_reasons: vec![reason],
            });
            return Ok(Vec::new());
        }

        self.suppressor
            .note_emitted(&request.session_id, &request.tool, &selected, now_s);

        let items: Vec<AdviceItem> = selected.iter().map(|f| f.item.clone()).collect();
        self.packet_cache.store(
            &query.tool,
            &query.arg_head,
            &query.phase,
            items.clone(),
            now_s,
        );

        self.ledger.record(&AdviceDecision {
            ts: Utc::now(),
            session_id: request.session_id.clone(),
            tool: request.tool.clone(),
            outcome: DecisionOutcome::Emitted,
            route,
            selected_count: items.len(),
            suppressed_count: 0,
            sources: source_counts,
            suppression_reasons: Vec::new(),
        });

        for item in &items {
            let entry = AdviceLogEntry {
                ts: Utc::now(),
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                advice_id: item.advice_id.clone(),
                text: item.text.clone(),
                source: item.source,
                score: item.score,
            };
            if let Err(e) = storage::append_jsonl(&self.advice_log, &entry) {
                tracing::warn!("Failed to append advice log: {}", e);
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::AdviceEmitted {
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                advice_ids: items.iter().map(|i| i.advice_id.clone()).collect(),
            });
        }

        Ok(items)
    }

    /// Packet-only answer for calls with almost no remaining budget.
    async fn quick_path(
        &self,
        request: &AdviceRequest,
        query: &AdviceQuery,
        config: &AdvisoryConfig,
        now_s: i64,
    ) -> Result<Vec<AdviceItem>> {
        let (route, packet) = match self
            .packet_cache
            .get_exact(&query.tool, &query.arg_head, &query.phase)
        {
            Some(p) => (AdviceRoute::PacketExact, Some(p)),
            None => (
                AdviceRoute::PacketRelaxed,
                self.packet_cache.get_relaxed(&query.tool),
            ),
        };

        let Some(packet) = packet else {
            self.ledger.record(&AdviceDecision {
                ts: Utc::now(),
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                outcome: DecisionOutcome::Blocked,
                route: AdviceRoute::PacketRelaxed,
                selected_count: 0,
                suppressed_count: 0,
                sources: Vec::new(),
                suppression_reasons: vec!["quick_fallback_empty".to_string()],
            });
            return Ok(Vec::new());
        };

        let selected: Vec<FusedItem> = packet
            .items
            .iter()
            .take(config.max_emit)
            .map(|item| FusedItem {
                item: item.clone(),
                score: item.score,
                sources: vec!["packet"],
            })
            .collect();

        if let Some(reason) = self.suppressor.evaluate(
            config,
            &request.session_id,
            &request.tool,
            &selected,
            now_s,
        ) {
            self.ledger.record(&AdviceDecision {
                ts: Utc::now(),
                session_id: request.session_id.clone(),
                tool: request.tool.clone(),
                outcome: DecisionOutcome::Blocked,
                route,
                selected_count: 0,
                suppressed_count: selected.len(),
                sources: vec![SourceCount {
                    source: "packet".to_string(),
                    items: selected.len(),
                }],
                suppression_reasons: vec![reason],
            });
            return Ok(Vec::new());
        }

        self.suppressor
            .note_emitted(&request.session_id, &request.tool, &selected, now_s);
        let items: Vec<AdviceItem> = selected.into_iter().map(|f| f.item).collect();
        self.ledger.record(&AdviceDecision {
            ts: Utc::now(),
            session_id: request.session_id.clone(),
            tool: request.tool.clone(),
            outcome: DecisionOutcome::Emitted,
            route,
            selected_count: items.len(),
            suppressed_count: 0,
            sources: vec![SourceCount {
                source: "packet".to_string(),
                items: items.len(),
            }],
            suppression_reasons: Vec::new(),
        });
        Ok(items)
    }

    fn build_query(&self, request: &AdviceRequest) -> AdviceQuery {
        // Argument key names carry signal too: a Read {path} call should
        // match path-shaped insights even when the value itself is opaque.
        let mut context = String::new();
        for key in ["command", "path", "file_path", "pattern", "url", "query"] {
            if let Some(Value::String(s)) = request.tool_args.get(key) {
                context.push_str(key);
                context.push(' ');
                context.push_str(s);
                context.push(' ');
            }
        }
        if let Some(extra) = &request.context {
            context.push_str(extra);
        }
        let phase = self
            .eidos
            .active_episode(&request.session_id)
            .map(|e| e.phase.as_str().to_string())
            .unwrap_or_else(|| "explore".to_string());
        AdviceQuery::new(&request.session_id, &request.tool, context.trim(), &phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::{Insight, InsightCategory};
    use crate::config::{CognitiveConfig, EidosConfig};
    use tempfile::tempdir;

    fn advisor_in(dir: &std::path::Path) -> Advisor {
        let paths = DataPaths::new(dir.to_path_buf());
        let cognitive = Arc::new(
            CognitiveStore::load(paths.cognitive_snapshot(), CognitiveConfig::default()).unwrap(),
        );
        let mut insight = Insight::new(
            InsightCategory::Wisdom,
            "File exists at expected path often wrong; use Glob first before Read",
            "seed",
        );
        insight.validations = 100;
        cognitive.insert(insight).unwrap();
        let eidos = Arc::new(EidosStore::open(&paths.eidos_db(), EidosConfig::default()).unwrap());
        Advisor::new(AdvisoryConfig::default(), &paths, cognitive, eidos)
    }

    fn read_request(session: &str) -> AdviceRequest {
        let mut tool_args = Map::new();
        tool_args.insert("path".into(), Value::String("missing.py".into()));
        AdviceRequest {
            session_id: session.into(),
            tool: "Read".into(),
            tool_args,
            context: Some("read a file that may not exist at its path".into()),
            budget_ms: None,
        }
    }

    #[tokio::test]
    async fn test_advise_emits_and_records() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        let items = advisor.advise(&read_request("s1")).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].text.starts_with("File exists at expected path"));

        let entries = advisor.ledger().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, DecisionOutcome::Emitted);
        assert_eq!(entries[0].route, AdviceRoute::Live);
        assert!(entries[0].sources.iter().any(|s| s.source == "cognitive"));
    }

    #[tokio::test]
    async fn test_repeat_advice_blocked_with_ttl_reason() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        let first = advisor.advise(&read_request("s1")).await;
        assert_eq!(first.len(), 1);
        let second = advisor.advise(&read_request("s1")).await;
        assert!(second.is_empty());

        let entries = advisor.ledger().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].outcome, DecisionOutcome::Blocked);
        assert!(entries[1].suppression_reasons[0].contains("TTL 600s"));
    }

    #[tokio::test]
    async fn test_no_candidates_blocked() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        let request = AdviceRequest {
            session_id: "s1".into(),
            tool: "TaskUpdate".into(),
            tool_args: Map::new(),
            context: Some("mark ticket as done".into()),
            budget_ms: None,
        };
        let items = advisor.advise(&request).await;
        assert!(items.is_empty());
        let entries = advisor.ledger().entries();
        assert_eq!(entries[0].outcome, DecisionOutcome::Blocked);
        assert_eq!(entries[0].suppression_reasons, vec!["no_candidates"]);
    }

    #[tokio::test]
    async fn test_quick_fallback_uses_packet() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        // Warm the packet cache with a live call.
        let warm = advisor.advise(&read_request("s1")).await;
        assert_eq!(warm.len(), 1);

        // A different session under quick budget gets the packet answer.
        let mut request = read_request("s2");
        request.budget_ms = Some(100);
        let items = advisor.advise(&request).await;
        assert_eq!(items.len(), 1);

        let entries = advisor.ledger().entries();
        let last = entries.last().unwrap();
        assert!(matches!(
            last.route,
            AdviceRoute::PacketExact | AdviceRoute::PacketRelaxed
        ));
    }

    #[tokio::test]
    async fn test_quick_fallback_empty_is_blocked_not_error() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        let mut request = read_request("s1");
        request.budget_ms = Some(100);
        let items = advisor.advise(&request).await;
        assert!(items.is_empty());
        let entries = advisor.ledger().entries();
        assert_eq!(entries[0].suppression_reasons, vec!["quick_fallback_empty"]);
    }

    #[tokio::test]
    async fn test_advice_log_written() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        advisor.advise(&read_request("s1")).await;
        let log: Vec<AdviceLogEntry> =
            storage::read_jsonl(&DataPaths::new(dir.path().to_path_buf()).advice_log()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool, "Read");
    }

    #[tokio::test]
    async fn test_config_hot_reload() {
        let dir = tempdir().unwrap();
        let advisor = advisor_in(dir.path());
        let mut config = AdvisoryConfig::default();
        config.max_emit = 0;
        advisor.reload_config(config);
        let items = advisor.advise(&read_request("s1")).await;
        assert!(items.is_empty());
    }
}
