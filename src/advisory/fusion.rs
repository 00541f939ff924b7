//! Rank Fusion & Rerank
//!
//! Per-source rankings are combined with Reciprocal Rank Fusion using
//! configurable source weights. An optional deterministic rerank pass then
//! re-scores the fused head by lexical affinity with the query, standing in
//! for a cross-encoder when no model is available.

use super::{AdviceItem, AdviceQuery};
use crate::ralph::{content_tokens, token_set_cosine};

const RRF_K: f64 = 60.0;

/// A fused candidate with its contributing sources.
#[derive(Debug, Clone)]
pub struct FusedItem {
    pub item: AdviceItem,
    pub score: f64,
    pub sources: Vec<&'static str>,
}

/// Reciprocal Rank Fusion across per-source rankings. Items are identified
/// by their text, so the same statement surfaced by two sources accumulates
/// both contributions and remembers each source.
pub fn rrf_fuse(rankings: Vec<(&'static str, f64, Vec<AdviceItem>)>) -> Vec<FusedItem> {
    let mut fused: Vec<FusedItem> = Vec::new();
    for (source_name, weight, items) in rankings {
        for (rank, item) in items.into_iter().enumerate() {
            let contribution = weight / (RRF_K + rank as f64 + 1.0);
            match fused.iter_mut().find(|f| f.item.text == item.text) {
                Some(existing) => {
                    existing.score += contribution;
                    if !existing.sources.contains(&source_name) {
                        existing.sources.push(source_name);
                    }
                    // Keep the richer attribution when a later source knows
                    // the backing insight or distillation.
                    if existing.item.insight_key.is_none() {
                        existing.item.insight_key = item.insight_key.clone();
                    }
                    if existing.item.distillation_id.is_none() {
                        existing.item.distillation_id = item.distillation_id;
                    }
                }
                None => fused.push(FusedItem {
                    item,
                    score: contribution,
                    sources: vec![source_name],
                }),
            }
        }
    }
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Deterministic lightweight rerank over the fused head: lexical overlap
/// with the query scales the fusion score.
pub fn rerank(mut fused: Vec<FusedItem>, query: &AdviceQuery, m: usize) -> Vec<FusedItem> {
    let head = fused.len().min(m);
    for entry in fused.iter_mut().take(head) {
        let overlap = token_set_cosine(&query.tokens, &content_tokens(&entry.item.text));
        let mentions_tool = entry
            .item
            .text
            .to_lowercase()
            .contains(&query.tool.to_lowercase());
        let boost = 1.0 + overlap + if mentions_tool { 0.25 } else { 0.0 };
        entry.score *= boost;
    }
    fused[..head].sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::SourceKind;

    fn item(text: &str, source: SourceKind) -> AdviceItem {
        AdviceItem {
            advice_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            source,
            score: 0.5,
            insight_key: None,
            distillation_id: None,
        }
    }

    #[test]
    fn test_agreement_accumulates_score() {
        let shared = "use Glob before Read";
        let fused = rrf_fuse(vec![
            ("cognitive", 1.0, vec![item(shared, SourceKind::Cognitive)]),
            ("semantic", 0.6, vec![item(shared, SourceKind::Semantic)]),
            ("eidos", 0.9, vec![item("unrelated tip", SourceKind::Eidos)]),
        ]);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].item.text, shared);
        assert_eq!(fused[0].sources.len(), 2);
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn test_weight_orders_equal_ranks() {
        let fused = rrf_fuse(vec![
            ("cognitive", 1.0, vec![item("from cognitive", SourceKind::Cognitive)]),
            ("semantic", 0.4, vec![item("from semantic", SourceKind::Semantic)]),
        ]);
        assert_eq!(fused[0].item.text, "from cognitive");
    }

    #[test]
    fn test_rank_position_matters() {
        let fused = rrf_fuse(vec![(
            "cognitive",
            1.0,
            vec![
                item("first ranked", SourceKind::Cognitive),
                item("second ranked", SourceKind::Cognitive),
            ],
        )]);
        assert!(fused[0].score > fused[1].score);
        assert_eq!(fused[0].item.text, "first ranked");
    }

    #[test]
    fn test_rerank_prefers_query_overlap() {
        let query = AdviceQuery::new("s1", "Read", "check the file path", "execute");
        let fused = rrf_fuse(vec![(
            "cognitive",
            1.0,
            vec![
                item("unrelated guidance about deploys", SourceKind::Cognitive),
                item("verify the file path before Read", SourceKind::Cognitive),
            ],
        )]);
        let reranked = rerank(fused, &query, 10);
        assert_eq!(reranked[0].item.text, "verify the file path before Read");
    }

    #[test]
    fn test_rerank_is_deterministic() {
        let query = AdviceQuery::new("s1", "Bash", "run the tests", "execute");
        let build = || {
            rrf_fuse(vec![(
                "cognitive",
                1.0,
                vec![
                    item("run tests in a clean tree", SourceKind::Cognitive),
                    item("watch for flaky tests", SourceKind::Cognitive),
                ],
            )])
        };
        let a = rerank(build(), &query, 10);
        let b = rerank(build(), &query, 10);
        let order_a: Vec<&str> = a.iter().map(|f| f.item.text.as_str()).collect();
        let order_b: Vec<&str> = b.iter().map(|f| f.item.text.as_str()).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn test_attribution_merge() {
        let mut backed = item("shared advice", SourceKind::Eidos);
        backed.distillation_id = Some(42);
        let fused = rrf_fuse(vec![
            ("cognitive", 1.0, vec![item("shared advice", SourceKind::Cognitive)]),
            ("eidos", 0.9, vec![backed]),
        ]);
        assert_eq!(fused[0].item.distillation_id, Some(42));
    }
}
