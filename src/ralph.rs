//! Meta-Ralph Quality Gate
//!
//! Scores every candidate insight on six dimensions (0-2 each) and issues a
//! verdict. Only `quality` verdicts advance to the cognitive store; every
//! verdict is appended to a bounded roast-history file for observability.
//!
//! Dedup uses token-set cosine over normalized statements with stop words
//! removed. Issue reasons come from a fixed closed vocabulary, never prose.

use crate::capture::PendingMemory;
use crate::config::RalphConfig;
use crate::storage;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

static GUIDANCE_VERBS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(use|avoid|prefer|check|run|verify|always|never|ensure|don't|do not|must|keep|wait)\b")
        .unwrap()
});

static CONTRAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(instead of|rather than|not .{1,40} but|over using)\b").unwrap()
});

static REASONING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(because|since|so that|due to|otherwise|which means)\b").unwrap()
});

static WEAK_REASONING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(to (avoid|prevent|ensure|keep)|leads to)\b").unwrap());

static OUTCOME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(fail(s|ed|ure)?|error|success|crash(es|ed)?|broke|fixed|works|wrong|timeout)\b")
        .unwrap()
});

static WEAK_OUTCOME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(should|will|can cause|may)\b").unwrap());

static PRIMITIVE_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(import |from \S+ import|print\(|console\.log|#include|let |const |use \S+;?$)")
        .unwrap()
});

static CONCRETE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"("[^"]+"|'[^']+'|`[^`]+`|\b\w+_\w+\b|\b[A-Z][a-z]+[A-Z]\w*\b|\b[A-Z]{2,}\b|/\S+|\b\d+(\.\d+)?\b)"#)
        .unwrap()
});

static SECRET_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password\s*[=:]|api[_-]?key\s*[=:]|secret\s*[=:]|bearer\s+\S{12,}|token\s*[=:]\s*\S{8,})")
        .unwrap()
});

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "is", "are", "was", "be", "to", "of", "in", "on", "at", "for", "and",
        "or", "it", "this", "that", "with", "as", "by", "from", "when", "then", "than", "so",
        "do", "does", "not", "no",
    ]
    .into_iter()
    .collect()
});

/// Per-dimension scores, each 0-2
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoastScores {
    pub actionability: u8,
    pub novelty: u8,
    pub reasoning: u8,
    pub specificity: u8,
    pub outcome_linked: u8,
    pub ethics: u8,
}

impl RoastScores {
    pub fn total(&self) -> u8 {
        self.actionability
            + self.novelty
            + self.reasoning
            + self.specificity
            + self.outcome_linked
            + self.ethics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Primitive,
    Duplicate,
    NeedsWork,
    Quality,
}

/// Closed vocabulary of rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoastIssue {
    NoActionableGuidance,
    SeemsObvious,
    NoReasoningProvided,
    NotOutcomeLinked,
    TooGeneric,
    AlreadyExists,
    PrimitivePattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub scores: RoastScores,
    pub total: u8,
    pub verdict: VerdictKind,
    pub issues: Vec<RoastIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_version: Option<String>,
}

impl Verdict {
    pub fn is_quality(&self) -> bool {
        self.verdict == VerdictKind::Quality
    }
}

/// One roast-history line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoastRecord {
    pub at: chrono::DateTime<Utc>,
    pub session_id: String,
    pub source_event_id: String,
    pub category: String,
    pub statement: String,
    pub total: u8,
    pub verdict: VerdictKind,
    pub issues: Vec<RoastIssue>,
}

pub struct MetaRalph {
    config: RalphConfig,
    history_path: Option<PathBuf>,
}

impl MetaRalph {
    pub fn new(config: RalphConfig) -> Self {
        Self {
            config,
            history_path: None,
        }
    }

    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    /// Roast one candidate against the statements already in the cognitive
    /// store. Records the verdict in the history file when configured.
    pub fn roast(&self, candidate: &PendingMemory, existing: &[String]) -> Verdict {
        let statement = candidate.text.trim();
        let scores = self.score(statement);
        let total = scores.total();

        let mut issues = Vec::new();
        if scores.actionability == 0 {
            issues.push(RoastIssue::NoActionableGuidance);
        }
        if scores.novelty == 0 {
            if PRIMITIVE_CODE.is_match(statement) || statement.split_whitespace().count() <= 2 {
                issues.push(RoastIssue::PrimitivePattern);
            } else {
                issues.push(RoastIssue::SeemsObvious);
            }
        }
        if scores.reasoning == 0 {
            issues.push(RoastIssue::NoReasoningProvided);
        }
        if scores.outcome_linked == 0 {
            issues.push(RoastIssue::NotOutcomeLinked);
        }
        if scores.specificity == 0 {
            issues.push(RoastIssue::TooGeneric);
        }

        let primitive_flagged = issues.contains(&RoastIssue::PrimitivePattern);
        let verdict = if total <= self.config.primitive_max
            || (primitive_flagged && total <= self.config.needs_work_max)
        {
            VerdictKind::Primitive
        } else if total <= self.config.needs_work_max {
            VerdictKind::NeedsWork
        } else if total <= self.config.review_max {
            // Mid-band candidates must clear dedup to pass.
            if self.is_duplicate(statement, existing) {
                issues.push(RoastIssue::AlreadyExists);
                VerdictKind::Duplicate
            } else {
                VerdictKind::Quality
            }
        } else {
            VerdictKind::Quality
        };

        let refined = refine(statement);
        let verdict = Verdict {
            scores,
            total,
            verdict,
            issues,
            refined_version: if refined != statement {
                Some(refined)
            } else {
                None
            },
        };

        if let Some(path) = &self.history_path {
            let record = RoastRecord {
                at: Utc::now(),
                session_id: candidate.session_id.clone(),
                source_event_id: candidate.source_event_id.clone(),
                category: candidate.category.as_str().to_string(),
                statement: statement.chars().take(200).collect(),
                total,
                verdict: verdict.verdict,
                issues: verdict.issues.clone(),
            };
            if let Err(e) =
                storage::append_jsonl_bounded(path, &record, self.config.roast_history_max)
            {
                tracing::warn!("Failed to append roast history: {}", e);
            }
        }

        verdict
    }

    fn score(&self, statement: &str) -> RoastScores {
        let word_count = statement.split_whitespace().count();

        let actionability = if GUIDANCE_VERBS.is_match(statement) {
            if word_count >= 6 {
                2
            } else {
                1
            }
        } else {
            0
        };

        let novelty = if PRIMITIVE_CODE.is_match(statement) || word_count <= 2 {
            0
        } else if CONTRAST.is_match(statement) {
            2
        } else {
            1
        };

        let reasoning = if REASONING.is_match(statement) {
            2
        } else if WEAK_REASONING.is_match(statement) {
            1
        } else {
            0
        };

        let concrete = CONCRETE_TOKEN.find_iter(statement).count();
        let specificity = match concrete {
            0 => 0,
            1 => 1,
            _ => 2,
        };

        let outcome_linked = if OUTCOME.is_match(statement) {
            2
        } else if WEAK_OUTCOME.is_match(statement) {
            1
        } else {
            0
        };

        let ethics = if SECRET_LIKE.is_match(statement) { 0 } else { 2 };

        RoastScores {
            actionability,
            novelty,
            reasoning,
            specificity,
            outcome_linked,
            ethics,
        }
    }

    fn is_duplicate(&self, statement: &str, existing: &[String]) -> bool {
        let tokens = content_tokens(statement);
        if tokens.is_empty() {
            return false;
        }
        existing.iter().any(|other| {
            token_set_cosine(&tokens, &content_tokens(other)) >= self.config.dedup_threshold
        })
    }
}

/// Lowercased content words with stop words removed
pub fn content_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Set-based cosine similarity between two token sets
pub fn token_set_cosine(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    shared / ((a.len() as f64).sqrt() * (b.len() as f64).sqrt())
}

/// Compress whitespace and trailing punctuation into a stable statement form
fn refine(statement: &str) -> String {
    let collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', ' '])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemoryCategory;

    fn candidate(text: &str) -> PendingMemory {
        PendingMemory {
            text: text.to_string(),
            category: MemoryCategory::Wisdom,
            score: 0.8,
            session_id: "s1".to_string(),
            source_event_id: "e1".to_string(),
            created_at: Utc::now(),
        }
    }

    fn ralph() -> MetaRalph {
        MetaRalph::new(RalphConfig::default())
    }

    #[test]
    fn test_trivial_code_rejected() {
        let verdict = ralph().roast(&candidate("import sys"), &[]);
        assert!(matches!(
            verdict.verdict,
            VerdictKind::Primitive | VerdictKind::NeedsWork
        ));
        assert!(verdict.issues.contains(&RoastIssue::PrimitivePattern));
    }

    #[test]
    fn test_rich_insight_passes() {
        let verdict = ralph().roast(
            &candidate("Always run cargo_check before committing because CI fails on warnings"),
            &[],
        );
        assert_eq!(verdict.verdict, VerdictKind::Quality);
        assert!(verdict.total >= 6);
    }

    #[test]
    fn test_duplicate_detected_in_mid_band() {
        let existing = vec!["use the staging database for test runs".to_string()];
        // Mid-band statement: guidance verb + specific token, no reasoning.
        let verdict = ralph().roast(&candidate("use the staging_database for test runs"), &existing);
        if verdict.total >= 4 && verdict.total <= 5 {
            assert_eq!(verdict.verdict, VerdictKind::Duplicate);
            assert!(verdict.issues.contains(&RoastIssue::AlreadyExists));
        }
    }

    #[test]
    fn test_high_band_bypasses_dedup() {
        let statement =
            "Never force-push to main_branch because the release pipeline breaks downstream";
        let existing = vec![statement.to_string()];
        let verdict = ralph().roast(&candidate(statement), &existing);
        assert_eq!(verdict.verdict, VerdictKind::Quality);
    }

    #[test]
    fn test_issue_vocabulary_closed() {
        let verdict = ralph().roast(&candidate("things happen sometimes maybe"), &[]);
        assert!(!verdict.issues.is_empty());
        // Serialization must produce the fixed snake_case names.
        let json = serde_json::to_string(&verdict.issues).unwrap();
        assert!(json.contains("no_actionable_guidance") || json.contains("too_generic"));
    }

    #[test]
    fn test_secret_content_zeroes_ethics() {
        let verdict = ralph().roast(
            &candidate("always export api_key=sk-live-abcdef123456 before running deploys"),
            &[],
        );
        assert_eq!(verdict.scores.ethics, 0);
    }

    #[test]
    fn test_refined_version_compresses_whitespace() {
        let verdict = ralph().roast(&candidate("use   Glob \n  before Read."), &[]);
        assert_eq!(
            verdict.refined_version.as_deref(),
            Some("use Glob before Read")
        );
    }

    #[test]
    fn test_token_set_cosine_identical() {
        let a = content_tokens("check the build output");
        assert!((token_set_cosine(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_token_set_cosine_disjoint() {
        let a = content_tokens("alpha beta gamma");
        let b = content_tokens("delta epsilon zeta");
        assert_eq!(token_set_cosine(&a, &b), 0.0);
    }

    #[test]
    fn test_roast_history_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roasts.jsonl");
        let config = RalphConfig {
            roast_history_max: 5,
            ..RalphConfig::default()
        };
        let ralph = MetaRalph::new(config).with_history(path.clone());
        for n in 0..20 {
            ralph.roast(&candidate(&format!("candidate number {}", n)), &[]);
        }
        let records: Vec<RoastRecord> = storage::read_jsonl(&path).unwrap();
        assert!(records.len() <= 10);
    }

    #[test]
    fn test_verdict_bands() {
        let ralph = ralph();
        // Zero-signal statement scores only the ethics floor.
        let low = ralph.roast(&candidate("ok"), &[]);
        assert_eq!(low.verdict, VerdictKind::Primitive);
    }
}
