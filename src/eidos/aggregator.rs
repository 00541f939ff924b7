//! Distillation Aggregator
//!
//! Runs on closed episodes with enough sealed steps. Clusters steps by
//! (decision template, tool) and emits distillations once a cluster has
//! enough supporting steps, or immediately for a distinctive failure.
//!
//! Heuristic and sharp-edge confidence follow different formulas, so each
//! distillation kind picks its own model.

use super::{Distillation, DistillationKind, EidosStore, Step, StepEvaluation};
use crate::config::EidosConfig;
use crate::errors::Result;
use crate::ralph::content_tokens;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static TEMPLATE_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"("[^"]*"|'[^']*'|`[^`]*`|/\S+|\d+)"#).unwrap());

/// Strategy for turning cluster evidence into a confidence value.
pub trait ConfidenceModel: Send + Sync {
    fn confidence(&self, supporting: usize, refuting: usize) -> f64;
}

/// Smoothed frequency for heuristics and policies: many consistent
/// observations are needed before confidence approaches 1.
pub struct FrequencyConfidence;

impl ConfidenceModel for FrequencyConfidence {
    fn confidence(&self, supporting: usize, refuting: usize) -> f64 {
        let n = (supporting + refuting) as f64;
        if n == 0.0 {
            return 0.0;
        }
        (supporting as f64 / (n + 2.0)).min(0.95)
    }
}

/// Severity-weighted model for sharp edges and anti-patterns: a single
/// distinctive failure already carries signal.
pub struct SeverityConfidence;

impl ConfidenceModel for SeverityConfidence {
    fn confidence(&self, supporting: usize, _refuting: usize) -> f64 {
        (0.6 + 0.1 * supporting as f64).min(0.9)
    }
}

/// Strip volatile detail from a decision so equivalent choices cluster.
pub fn decision_template(decision: &str) -> String {
    let scrubbed = TEMPLATE_NOISE.replace_all(decision, "<arg>");
    scrubbed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Aggregator {
    config: EidosConfig,
}

impl Aggregator {
    pub fn new(config: EidosConfig) -> Self {
        Self { config }
    }

    /// Distill one closed episode. Skips episodes with too few sealed
    /// steps; a cluster that errors is skipped without touching the store.
    pub fn distill(&self, store: &EidosStore, episode_id: &str) -> Result<Vec<i64>> {
        let steps = store.sealed_steps(episode_id);
        if steps.len() < self.config.min_steps {
            return Ok(Vec::new());
        }

        let mut clusters: BTreeMap<(String, String), Vec<&Step>> = BTreeMap::new();
        for step in &steps {
            let tool = step.tool.clone().unwrap_or_else(|| "unknown".to_string());
            clusters
                .entry((decision_template(&step.decision), tool))
                .or_default()
                .push(step);
        }

        let now_ns = steps
            .iter()
            .filter_map(|s| s.sealed_ns)
            .max()
            .unwrap_or_default();

        let mut created = Vec::new();
        for ((template, tool), cluster) in clusters {
            match self.distill_cluster(&template, &tool, &cluster, now_ns) {
                Some(distillation) => match store.record_distillation(&distillation) {
                    Ok(id) => created.push(id),
                    Err(e) => {
                        tracing::warn!(tool = %tool, "Skipping cluster after store error: {}", e);
                    }
                },
                None => continue,
            }
        }
        Ok(created)
    }

    fn distill_cluster(
        &self,
        template: &str,
        tool: &str,
        cluster: &[&Step],
        now_ns: i64,
    ) -> Option<Distillation> {
        let passed: Vec<&Step> = cluster
            .iter()
            .copied()
            .filter(|s| s.evaluation == StepEvaluation::Passed)
            .collect();
        let failed: Vec<&Step> = cluster
            .iter()
            .copied()
            .filter(|s| s.evaluation == StepEvaluation::Failed)
            .collect();

        let (kind, statement, supporting): (DistillationKind, String, Vec<&Step>) =
            if passed.len() >= self.config.validate_min && failed.is_empty() {
                (
                    DistillationKind::Heuristic,
                    format!(
                        "{} is dependable here: {} consecutive successes for '{}'",
                        tool,
                        passed.len(),
                        template
                    ),
                    passed,
                )
            } else if failed.len() >= self.config.validate_min {
                (
                    DistillationKind::AntiPattern,
                    format!(
                        "{} keeps failing for '{}': {} of {} attempts failed",
                        tool,
                        template,
                        failed.len(),
                        cluster.len()
                    ),
                    failed,
                )
            } else if let Some(failure) = distinctive_failure(&failed) {
                (
                    DistillationKind::SharpEdge,
                    format!(
                        "{} hit '{}' when asked to {}",
                        tool,
                        failure.outcome.as_deref().unwrap_or("failure"),
                        template
                    ),
                    failed,
                )
            } else {
                return None;
            };

        let model: &dyn ConfidenceModel = match kind {
            DistillationKind::Heuristic | DistillationKind::Policy => &FrequencyConfidence,
            DistillationKind::SharpEdge | DistillationKind::AntiPattern => &SeverityConfidence,
        };
        let refuting = cluster.len() - supporting.len();
        let confidence = model.confidence(supporting.len(), refuting);

        let mut triggers: Vec<String> = content_tokens(template).into_iter().collect();
        triggers.push(tool.to_lowercase());
        triggers.sort();
        triggers.dedup();

        Some(Distillation {
            distillation_id: 0,
            kind,
            statement,
            confidence,
            validation_count: supporting.len() as i64,
            contradiction_count: refuting as i64,
            times_retrieved: 0,
            times_used: 0,
            times_helped: 0,
            source_step_ids: supporting.iter().map(|s| s.step_id.clone()).collect(),
            domains: vec![tool.to_lowercase()],
            triggers,
            created_at_ns: now_ns,
            last_reinforced_ns: now_ns,
        })
    }
}

/// A lone failure is worth a sharp edge only when it carries a distinctive
/// outcome, not a generic abandonment.
fn distinctive_failure<'a>(failed: &[&'a Step]) -> Option<&'a Step> {
    if failed.len() != 1 {
        return None;
    }
    let step = failed[0];
    let outcome = step.outcome.as_deref()?;
    if outcome.starts_with("abandoned") || outcome == "failure" {
        return None;
    }
    Some(step)
}
