//! Episodic Intelligence (EIDOS)
//!
//! Session-scoped predict-act-evaluate tracking. Every session owns at most
//! one active episode and at most one open step; sealed steps feed the
//! aggregator, which distills recurring patterns into retrievable rules.

mod aggregator;
mod store;

pub use aggregator::{
    decision_template, Aggregator, ConfidenceModel, FrequencyConfidence, SeverityConfidence,
};
pub use store::EidosStore;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    Explore,
    Execute,
    Consolidate,
}

impl EpisodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodePhase::Explore => "explore",
            EpisodePhase::Execute => "execute",
            EpisodePhase::Consolidate => "consolidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explore" => Some(EpisodePhase::Explore),
            "execute" => Some(EpisodePhase::Execute),
            "consolidate" => Some(EpisodePhase::Consolidate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Success,
    Failure,
    Abandoned,
    Active,
}

impl EpisodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeOutcome::Success => "success",
            EpisodeOutcome::Failure => "failure",
            EpisodeOutcome::Abandoned => "abandoned",
            EpisodeOutcome::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(EpisodeOutcome::Success),
            "failure" => Some(EpisodeOutcome::Failure),
            "abandoned" => Some(EpisodeOutcome::Abandoned),
            "active" => Some(EpisodeOutcome::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ToolCall,
    Response,
    Wait,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ToolCall => "tool_call",
            ActionKind::Response => "response",
            ActionKind::Wait => "wait",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(ActionKind::ToolCall),
            "response" => Some(ActionKind::Response),
            "wait" => Some(ActionKind::Wait),
            _ => None,
        }
    }
}

/// Step evaluation: open (`?`) until the matching post_tool arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvaluation {
    Open,
    Passed,
    Failed,
}

impl StepEvaluation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepEvaluation::Open => "?",
            StepEvaluation::Passed => "passed",
            StepEvaluation::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "?" => Some(StepEvaluation::Open),
            "passed" => Some(StepEvaluation::Passed),
            "failed" => Some(StepEvaluation::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub session_id: String,
    pub goal: String,
    pub phase: EpisodePhase,
    pub outcome: EpisodeOutcome,
    pub started_ns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_ns: Option<i64>,
    pub step_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub episode_id: String,
    pub session_id: String,
    pub decision: String,
    pub action_kind: ActionKind,
    pub prediction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub evaluation: StepEvaluation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub opened_ns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_ns: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationKind {
    Heuristic,
    Policy,
    SharpEdge,
    AntiPattern,
}

impl DistillationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistillationKind::Heuristic => "heuristic",
            DistillationKind::Policy => "policy",
            DistillationKind::SharpEdge => "sharp_edge",
            DistillationKind::AntiPattern => "anti_pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heuristic" => Some(DistillationKind::Heuristic),
            "policy" => Some(DistillationKind::Policy),
            "sharp_edge" => Some(DistillationKind::SharpEdge),
            "anti_pattern" => Some(DistillationKind::AntiPattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distillation {
    pub distillation_id: i64,
    pub kind: DistillationKind,
    pub statement: String,
    pub confidence: f64,
    pub validation_count: i64,
    pub contradiction_count: i64,
    pub times_retrieved: i64,
    pub times_used: i64,
    pub times_helped: i64,
    pub source_step_ids: Vec<String>,
    pub domains: Vec<String>,
    /// Normalized intent phrases and tool names matched by the retriever
    pub triggers: Vec<String>,
    pub created_at_ns: i64,
    pub last_reinforced_ns: i64,
}

impl Distillation {
    /// Confidence after decay: halves every `halflife_s` without
    /// reinforcement.
    pub fn effective_confidence(&self, now_ns: i64, halflife_s: u64) -> f64 {
        if halflife_s == 0 {
            return self.confidence;
        }
        let age_s = ((now_ns - self.last_reinforced_ns).max(0) as f64) / 1e9;
        self.confidence * 0.5_f64.powf(age_s / halflife_s as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_string_roundtrips() {
        for phase in [
            EpisodePhase::Explore,
            EpisodePhase::Execute,
            EpisodePhase::Consolidate,
        ] {
            assert_eq!(EpisodePhase::parse(phase.as_str()), Some(phase));
        }
        for outcome in [
            EpisodeOutcome::Success,
            EpisodeOutcome::Failure,
            EpisodeOutcome::Abandoned,
            EpisodeOutcome::Active,
        ] {
            assert_eq!(EpisodeOutcome::parse(outcome.as_str()), Some(outcome));
        }
        for eval in [
            StepEvaluation::Open,
            StepEvaluation::Passed,
            StepEvaluation::Failed,
        ] {
            assert_eq!(StepEvaluation::parse(eval.as_str()), Some(eval));
        }
    }

    #[test]
    fn test_open_evaluation_symbol() {
        assert_eq!(StepEvaluation::Open.as_str(), "?");
    }

    #[test]
    fn test_effective_confidence_decays() {
        let distillation = Distillation {
            distillation_id: 1,
            kind: DistillationKind::Heuristic,
            statement: "x".into(),
            confidence: 0.8,
            validation_count: 5,
            contradiction_count: 0,
            times_retrieved: 0,
            times_used: 0,
            times_helped: 0,
            source_step_ids: vec![],
            domains: vec![],
            triggers: vec![],
            created_at_ns: 0,
            last_reinforced_ns: 0,
        };
        let halflife_s = 3600;
        let one_halflife_later = 3600 * 1_000_000_000;
        let decayed = distillation.effective_confidence(one_halflife_later, halflife_s);
        assert!((decayed - 0.4).abs() < 1e-6);
        // Fresh distillations keep their full confidence.
        assert!((distillation.effective_confidence(0, halflife_s) - 0.8).abs() < 1e-9);
    }
}
