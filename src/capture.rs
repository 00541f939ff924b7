//! Memory Capture
//!
//! Scans event text for explicit intent markers and high-signal patterns,
//! scoring each candidate 0-1 with keyword/regex rules and structural cues.
//! Candidates above the configured threshold become pending memories, which
//! feed the quality gate.

use crate::config::MemoryConfig;
use crate::events::{Event, EventKind};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static EXPLICIT_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(remember|don't forget|note that|keep in mind|always|never)\b").unwrap()
});

static CORRECTION_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bno[,.]|\bactually\b|that's (wrong|incorrect)|should have|instead of|not what i)").unwrap()
});

static LEARNED_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i learned|learned that|lesson|turns out|realized that|til\b)").unwrap()
});

static COMPLETION_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(task (complete|finished|done)|completed successfully|summary:)").unwrap()
});

static META_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(strategy|approach|next time|in future|pattern|workflow)\b").unwrap()
});

static SELF_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(i (tend to|keep|often|should)|my (mistake|error))\b").unwrap());

/// Target bucket for a captured memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Wisdom,
    SelfAwareness,
    UserUnderstanding,
    MetaLearning,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Wisdom => "wisdom",
            MemoryCategory::SelfAwareness => "self_awareness",
            MemoryCategory::UserUnderstanding => "user_understanding",
            MemoryCategory::MetaLearning => "meta_learning",
        }
    }
}

/// A scored candidate awaiting the quality gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMemory {
    pub text: String,
    pub category: MemoryCategory,
    pub score: f64,
    pub session_id: String,
    pub source_event_id: String,
    pub created_at: DateTime<Utc>,
}

pub struct MemoryCapture {
    threshold: f64,
    min_chars: usize,
    max_chars: usize,
}

impl MemoryCapture {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            threshold: config.mem_threshold,
            min_chars: config.patch_min_chars,
            max_chars: config.patch_max_chars,
        }
    }

    /// Extract pending memories from one event. Returns an empty vec for
    /// events with no capturable text or below-threshold scores.
    pub fn scan(&self, event: &Event) -> Vec<PendingMemory> {
        let Some(text) = event.text.as_deref() else {
            return Vec::new();
        };
        let text = text.trim();
        if text.chars().count() < self.min_chars {
            return Vec::new();
        }

        let score = self.score(event, text);
        if score < self.threshold {
            return Vec::new();
        }

        let clipped: String = text.chars().take(self.max_chars).collect();
        vec![PendingMemory {
            text: clipped,
            category: categorize(text),
            score,
            session_id: event.session_id.clone(),
            source_event_id: event.event_id.clone(),
            created_at: Utc::now(),
        }]
    }

    /// Below-threshold fallback for user prompts: the quality gate still
    /// sees the candidate and records why it was rejected.
    pub fn raw_candidate(&self, event: &Event) -> Option<PendingMemory> {
        if event.kind != EventKind::UserPrompt {
            return None;
        }
        let text = event.text.as_deref()?.trim();
        if text.is_empty() || text.chars().count() > self.max_chars {
            return None;
        }
        Some(PendingMemory {
            text: text.to_string(),
            category: categorize(text),
            score: self.score(event, text),
            session_id: event.session_id.clone(),
            source_event_id: event.event_id.clone(),
            created_at: Utc::now(),
        })
    }

    fn score(&self, event: &Event, text: &str) -> f64 {
        let mut score: f64 = match event.kind {
            EventKind::UserPrompt => 0.3,
            EventKind::PostToolFailure => 0.45,
            EventKind::PostTool => 0.15,
            EventKind::PreTool => 0.1,
        };

        if EXPLICIT_MARKERS.is_match(text) {
            score += 0.3;
        }
        if CORRECTION_MARKERS.is_match(text) {
            score += 0.25;
        }
        if LEARNED_MARKERS.is_match(text) {
            score += 0.2;
        }
        if COMPLETION_MARKERS.is_match(text) {
            score += 0.15;
        }

        // The ingest scorer already weighed the raw event; fold it in.
        score += 0.2 * event.importance;

        score.clamp(0.0, 1.0)
    }
}

fn categorize(text: &str) -> MemoryCategory {
    if CORRECTION_MARKERS.is_match(text) {
        MemoryCategory::UserUnderstanding
    } else if SELF_MARKERS.is_match(text) || LEARNED_MARKERS.is_match(text) {
        MemoryCategory::SelfAwareness
    } else if META_MARKERS.is_match(text) {
        MemoryCategory::MetaLearning
    } else {
        MemoryCategory::Wisdom
    }
}
