//! Advisory Retrieval Sources
//!
//! Four independent sources answer every advise call: the cognitive store,
//! EIDOS distillation triggers, a pluggable semantic scorer, and the packet
//! cache. Each returns locally-scored items; fusion merges them.

use super::packets::PacketCache;
use super::{AdviceItem, AdviceQuery, SourceKind};
use crate::cognitive::{CognitiveStore, Insight};
use crate::eidos::EidosStore;
use crate::errors::Result;
use crate::ralph::{content_tokens, token_set_cosine};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait]
pub trait AdviceSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn retrieve(&self, query: &AdviceQuery, k: usize) -> Result<Vec<AdviceItem>>;
}

fn insight_item(insight: &Insight, score: f64) -> AdviceItem {
    AdviceItem {
        advice_id: uuid::Uuid::new_v4().to_string(),
        text: insight.statement.clone(),
        source: SourceKind::Cognitive,
        score,
        insight_key: Some(insight.key.clone()),
        distillation_id: None,
    }
}

/// Insights ranked by advisory readiness, boosted when the statement
/// mentions the current tool or overlaps the query tokens.
pub struct CognitiveSource {
    store: Arc<CognitiveStore>,
}

impl CognitiveSource {
    pub fn new(store: Arc<CognitiveStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AdviceSource for CognitiveSource {
    fn name(&self) -> &'static str {
        "cognitive"
    }

    async fn retrieve(&self, query: &AdviceQuery, k: usize) -> Result<Vec<AdviceItem>> {
        let tool_lower = query.tool.to_lowercase();
        let mut scored: Vec<(f64, Insight)> = self
            .store
            .snapshot()
            .into_iter()
            .filter_map(|insight| {
                if insight.advisory_readiness <= 0.0 {
                    return None;
                }
                let statement_tokens = content_tokens(&insight.statement);
                let overlap = token_set_cosine(&query.tokens, &statement_tokens);
                let mentions_tool = insight.statement.to_lowercase().contains(&tool_lower);
                if overlap <= 0.0 && !mentions_tool {
                    return None;
                }
                let boost = if mentions_tool { 0.3 } else { 0.0 };
                Some((insight.advisory_readiness * (1.0 + overlap) + boost, insight))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, insight)| insight_item(&insight, score))
            .collect())
    }
}

/// Distillations whose triggers match the current decision tokens.
pub struct EidosSource {
    store: Arc<EidosStore>,
}

impl EidosSource {
    pub fn new(store: Arc<EidosStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AdviceSource for EidosSource {
    fn name(&self) -> &'static str {
        "eidos"
    }

    async fn retrieve(&self, query: &AdviceQuery, k: usize) -> Result<Vec<AdviceItem>> {
        let mut tokens: HashSet<String> = query.tokens.clone();
        tokens.insert(query.tool.to_lowercase());
        let now_ns = crate::events::now_ns();
        Ok(self
            .store
            .match_triggers(&tokens, k, now_ns)
            .into_iter()
            .map(|d| AdviceItem {
                advice_id: uuid::Uuid::new_v4().to_string(),
                text: d.statement.clone(),
                source: SourceKind::Eidos,
                score: d.confidence,
                insight_key: None,
                distillation_id: Some(d.distillation_id),
            })
            .collect())
    }
}

/// Scoring backend for the semantic source. The default is keyword-only;
/// embedding-backed scorers are add-ons that implement the same trait.
pub trait SemanticScorer: Send + Sync {
    fn similarity(&self, query_tokens: &HashSet<String>, statement: &str) -> f64;
}

/// Token-overlap cosine, the fallback used when embeddings are disabled.
pub struct KeywordScorer;

impl SemanticScorer for KeywordScorer {
    fn similarity(&self, query_tokens: &HashSet<String>, statement: &str) -> f64 {
        token_set_cosine(query_tokens, &content_tokens(statement))
    }
}

/// Shallow similarity over insight statements.
pub struct SemanticSource {
    store: Arc<CognitiveStore>,
    scorer: Box<dyn SemanticScorer>,
    min_similarity: f64,
}

impl SemanticSource {
    pub fn keyword(store: Arc<CognitiveStore>) -> Self {
        Self {
            store,
            scorer: Box::new(KeywordScorer),
            min_similarity: 0.15,
        }
    }

    pub fn with_scorer(store: Arc<CognitiveStore>, scorer: Box<dyn SemanticScorer>) -> Self {
        Self {
            store,
            scorer,
            min_similarity: 0.15,
        }
    }
}

#[async_trait]
impl AdviceSource for SemanticSource {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn retrieve(&self, query: &AdviceQuery, k: usize) -> Result<Vec<AdviceItem>> {
        let mut scored: Vec<(f64, Insight)> = self
            .store
            .snapshot()
            .into_iter()
            .filter_map(|insight| {
                let similarity = self.scorer.similarity(&query.tokens, &insight.statement);
                if similarity < self.min_similarity {
                    return None;
                }
                Some((similarity, insight))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, insight)| {
                let mut item = insight_item(&insight, score);
                item.source = SourceKind::Semantic;
                item
            })
            .collect())
    }
}

/// Pre-computed packets for the current tool pattern.
pub struct PacketSource {
    cache: Arc<PacketCache>,
}

impl PacketSource {
    pub fn new(cache: Arc<PacketCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl AdviceSource for PacketSource {
    fn name(&self) -> &'static str {
        "packet"
    }

    async fn retrieve(&self, query: &AdviceQuery, k: usize) -> Result<Vec<AdviceItem>> {
        let packet = self
            .cache
            .get_exact(&query.tool, &query.arg_head, &query.phase)
            .or_else(|| self.cache.get_relaxed(&query.tool));
        Ok(packet
            .map(|p| {
                p.items
                    .into_iter()
                    .take(k)
                    .map(|mut item| {
                        item.source = SourceKind::Packet;
                        item
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::InsightCategory;
    use crate::config::CognitiveConfig;
    use tempfile::tempdir;

    fn seeded_store(dir: &std::path::Path) -> Arc<CognitiveStore> {
        let store = CognitiveStore::load(
            dir.join("cognitive_insights.json"),
            CognitiveConfig::default(),
        )
        .unwrap();
        let mut insight = crate::cognitive::Insight::new(
            InsightCategory::Wisdom,
            "File exists at expected path often wrong; use Glob first",
            "seed",
        );
        insight.validations = 100;
        store.insert(insight).unwrap();
        Arc::new(store)
    }

    fn query(tool: &str, text: &str) -> AdviceQuery {
        AdviceQuery::new("s1", tool, text, "execute")
    }

    #[tokio::test]
    async fn test_cognitive_source_matches_tool_mention() {
        let dir = tempdir().unwrap();
        let source = CognitiveSource::new(seeded_store(dir.path()));
        let items = source.retrieve(&query("Glob", "read missing.py"), 4).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].text.starts_with("File exists at expected path"));
        assert!(items[0].insight_key.is_some());
    }

    #[tokio::test]
    async fn test_cognitive_source_skips_unrelated() {
        let dir = tempdir().unwrap();
        let source = CognitiveSource::new(seeded_store(dir.path()));
        let items = source
            .retrieve(&query("TaskUpdate", "mark the ticket done"), 4)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_semantic_source_keyword_overlap() {
        let dir = tempdir().unwrap();
        let source = SemanticSource::keyword(seeded_store(dir.path()));
        let items = source
            .retrieve(&query("Read", "check file path exists"), 4)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, SourceKind::Semantic);
    }

    #[tokio::test]
    async fn test_packet_source_relaxed_fallback() {
        let cache = Arc::new(PacketCache::new(8));
        cache.store(
            "Read",
            "old/path.rs",
            "execute",
            vec![AdviceItem {
                advice_id: "a1".into(),
                text: "verify the path first".into(),
                source: SourceKind::Cognitive,
                score: 0.8,
                insight_key: None,
                distillation_id: None,
            }],
            0,
        );
        let source = PacketSource::new(cache);
        let items = source
            .retrieve(&query("Read", "new/path.rs"), 4)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, SourceKind::Packet);
    }

    #[test]
    fn test_keyword_scorer_symmetry() {
        let scorer = KeywordScorer;
        let tokens = content_tokens("glob before read");
        let a = scorer.similarity(&tokens, "use glob before read");
        assert!(a > 0.5);
    }
}
