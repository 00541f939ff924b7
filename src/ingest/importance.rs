//! Ingest Importance Scoring
//!
//! Rule-based scorer run on every accepted event. Downstream sampling keys
//! off this value, so failures and explicit memory markers bias high.

use crate::events::{Event, EventKind};
use once_cell::sync::Lazy;
use regex::Regex;

static MEMORY_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(remember|don't forget|note that|always|never|important)\b").unwrap()
});

static CORRECTION_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bno[,.]|\bactually\b|that's (wrong|incorrect)|should have)").unwrap()
});

static ERROR_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|failed|panic|exception|traceback|denied)\b").unwrap()
});

pub struct ImportanceScorer;

impl ImportanceScorer {
    pub fn score(event: &Event) -> f64 {
        let mut score: f64 = match event.kind {
            EventKind::PostToolFailure => 0.7,
            EventKind::UserPrompt => 0.5,
            EventKind::PreTool => 0.2,
            EventKind::PostTool => 0.2,
        };

        if let Some(text) = &event.text {
            if MEMORY_MARKERS.is_match(text) {
                score += 0.3;
            }
            if CORRECTION_MARKERS.is_match(text) {
                score += 0.2;
            }
            if ERROR_MARKERS.is_match(text) {
                score += 0.1;
            }
        }
        if event.success == Some(false) {
            score += 0.2;
        }

        score.clamp(0.0, 1.0)
    }
}
