//! Advice Suppression
//!
//! Ordered first-match-wins rules deciding whether fused advice may be
//! shown. An identical repeat is reported against the advice TTL; the
//! per-tool cooldown covers non-identical advice for a recently advised
//! tool. Remaining rules bound volume and require cross-source agreement
//! when the gate is enabled.

use super::fusion::FusedItem;
use crate::config::AdvisoryConfig;
use crate::ralph::content_tokens;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Reason rendered into the decision ledger when advice is blocked.
pub const REASON_ADVISOR_ERROR: &str = "advisor_error";

#[derive(Default)]
struct SuppressState {
    /// (session, tool) -> last emission, unix seconds
    last_tool_emit: HashMap<(String, String), i64>,
    /// (session, advice text) -> last shown, unix seconds
    recent_advice: HashMap<(String, String), i64>,
    /// session -> (minute bucket, emissions in bucket)
    session_budget: HashMap<String, (i64, usize)>,
    /// session -> active generic advice text
    active_generic: HashMap<String, (String, i64)>,
}

pub struct Suppressor {
    state: Mutex<SuppressState>,
}

impl Suppressor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SuppressState::default()),
        }
    }

    /// Apply the rule chain to the selected items. Returns the rendered
    /// suppression reason for the first matching rule, or None when the
    /// advice may be emitted.
    pub fn evaluate(
        &self,
        config: &AdvisoryConfig,
        session_id: &str,
        tool: &str,
        selected: &[FusedItem],
        now_s: i64,
    ) -> Option<String> {
        let mut state = self.state.lock();
        prune(&mut state, config, now_s);

        // Identical advice inside the TTL window.
        for entry in selected {
            let key = (session_id.to_string(), entry.item.text.clone());
            if let Some(shown_at) = state.recent_advice.get(&key) {
                let ago = now_s - shown_at;
                if ago < config.advice_ttl_s as i64 {
                    return Some(format!("shown {}s ago (TTL {}s)", ago, config.advice_ttl_s));
                }
            }
        }

        // Fresh advice for a tool still on cooldown.
        let key = (session_id.to_string(), tool.to_string());
        if let Some(last) = state.last_tool_emit.get(&key) {
            let ago = now_s - last;
            if ago < config.tool_cooldown_s as i64 {
                return Some(format!(
                    "tool {} on cooldown ({}s of {}s)",
                    tool, ago, config.tool_cooldown_s
                ));
            }
        }

        // Per-session volume budget.
        let bucket = now_s / 60;
        if let Some((active_bucket, count)) = state.session_budget.get(session_id) {
            if *active_bucket == bucket && *count >= config.session_budget_per_min {
                return Some(format!(
                    "session budget exhausted ({} per minute)",
                    config.session_budget_per_min
                ));
            }
        }

        // Generic advice while another generic pattern is still active.
        if state.active_generic.contains_key(session_id)
            && selected.iter().any(|entry| is_generic(&entry.item.text))
        {
            return Some("generic advice already active".to_string());
        }

        // Agreement gate: require distinct-source quorum.
        if config.agreement_gate {
            let distinct = selected
                .iter()
                .flat_map(|entry| entry.sources.iter())
                .collect::<std::collections::HashSet<_>>()
                .len();
            if distinct < config.min_sources {
                return Some(format!(
                    "agreement gate: {} of {} sources",
                    distinct, config.min_sources
                ));
            }
        }

        None
    }

    /// Record a successful emission so later calls see cooldowns, TTLs, and
    /// budget consumption.
    pub fn note_emitted(
        &self,
        session_id: &str,
        tool: &str,
        emitted: &[FusedItem],
        now_s: i64,
    ) {
        let mut state = self.state.lock();
        state
            .last_tool_emit
            .insert((session_id.to_string(), tool.to_string()), now_s);
        for entry in emitted {
            state
                .recent_advice
                .insert((session_id.to_string(), entry.item.text.clone()), now_s);
            if is_generic(&entry.item.text) {
                state
                    .active_generic
                    .insert(session_id.to_string(), (entry.item.text.clone(), now_s));
            }
        }
        let bucket = now_s / 60;
        let slot = state
            .session_budget
            .entry(session_id.to_string())
            .or_insert((bucket, 0));
        if slot.0 == bucket {
            slot.1 += 1;
        } else {
            *slot = (bucket, 1);
        }
    }
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(state: &mut SuppressState, config: &AdvisoryConfig, now_s: i64) {
    let ttl = config.advice_ttl_s as i64;
    state.recent_advice.retain(|_, at| now_s - *at < ttl);
    state
        .active_generic
        .retain(|_, (_, at)| now_s - *at < ttl);
    let cooldown = config.tool_cooldown_s as i64;
    state
        .last_tool_emit
        .retain(|_, at| now_s - *at < cooldown.max(ttl));
}

/// Advice with almost no concrete content is treated as generic.
fn is_generic(text: &str) -> bool {
    content_tokens(text).len() <= 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{AdviceItem, SourceKind};

    fn fused(text: &str, sources: Vec<&'static str>) -> FusedItem {
        FusedItem {
            item: AdviceItem {
                advice_id: uuid::Uuid::new_v4().to_string(),
                text: text.into(),
                source: SourceKind::Cognitive,
                score: 1.0,
                insight_key: None,
                distillation_id: None,
            },
            score: 1.0,
            sources,
        }
    }

    fn config() -> AdvisoryConfig {
        AdvisoryConfig::default()
    }

    #[test]
    fn test_first_emission_allowed() {
        let suppressor = Suppressor::new();
        let items = vec![fused("use Glob before Read on fuzzy paths", vec!["cognitive"])];
        assert!(suppressor
            .evaluate(&config(), "s1", "Read", &items, 1000)
            .is_none());
    }

    #[test]
    fn test_identical_repeat_reports_ttl() {
        let suppressor = Suppressor::new();
        let items = vec![fused("use Glob before Read on fuzzy paths", vec!["cognitive"])];
        suppressor.note_emitted("s1", "Read", &items, 1000);

        let reason = suppressor
            .evaluate(&config(), "s1", "Read", &items, 1012)
            .unwrap();
        assert_eq!(reason, "shown 12s ago (TTL 600s)");
    }

    #[test]
    fn test_fresh_advice_hits_tool_cooldown() {
        let suppressor = Suppressor::new();
        let first = vec![fused("use Glob before Read on fuzzy paths", vec!["cognitive"])];
        suppressor.note_emitted("s1", "Read", &first, 1000);

        let different = vec![fused("prefer absolute paths for Read tool calls", vec!["cognitive"])];
        let reason = suppressor
            .evaluate(&config(), "s1", "Read", &different, 1010)
            .unwrap();
        assert!(reason.contains("cooldown"));
    }

    #[test]
    fn test_cooldown_expires() {
        let suppressor = Suppressor::new();
        let first = vec![fused("use Glob before Read on fuzzy paths", vec!["cognitive"])];
        suppressor.note_emitted("s1", "Read", &first, 1000);

        let different = vec![fused("prefer absolute paths for Read tool calls", vec!["cognitive"])];
        assert!(suppressor
            .evaluate(&config(), "s1", "Read", &different, 1040)
            .is_none());
    }

    #[test]
    fn test_session_budget() {
        let suppressor = Suppressor::new();
        let mk = |n: u32| vec![fused(&format!("distinct advisory statement number {}", n), vec!["cognitive"])];
        suppressor.note_emitted("s1", "Bash", &mk(1), 1000);
        suppressor.note_emitted("s1", "Grep", &mk(2), 1005);

        // Third emission in the same minute for yet another tool.
        let reason = suppressor
            .evaluate(&config(), "s1", "Write", &mk(3), 1010)
            .unwrap();
        assert!(reason.contains("budget"));
    }

    #[test]
    fn test_budget_resets_next_minute() {
        let suppressor = Suppressor::new();
        let mk = |n: u32| vec![fused(&format!("distinct advisory statement number {}", n), vec!["cognitive"])];
        suppressor.note_emitted("s1", "Bash", &mk(1), 1000);
        suppressor.note_emitted("s1", "Grep", &mk(2), 1005);
        assert!(suppressor
            .evaluate(&config(), "s1", "Write", &mk(3), 1075)
            .is_none());
    }

    #[test]
    fn test_agreement_gate_blocks_single_source() {
        let mut config = config();
        config.agreement_gate = true;
        config.min_sources = 2;
        let suppressor = Suppressor::new();
        let items = vec![fused("watch the build cache during dependency bumps", vec!["cognitive"])];
        let reason = suppressor
            .evaluate(&config, "s1", "Bash", &items, 1000)
            .unwrap();
        assert!(reason.contains("agreement gate"));
    }

    #[test]
    fn test_agreement_gate_passes_quorum() {
        let mut config = config();
        config.agreement_gate = true;
        config.min_sources = 2;
        let suppressor = Suppressor::new();
        let items = vec![fused(
            "watch the build cache during dependency bumps",
            vec!["cognitive", "semantic"],
        )];
        assert!(suppressor.evaluate(&config, "s1", "Bash", &items, 1000).is_none());
    }

    #[test]
    fn test_generic_active_suppressed() {
        let suppressor = Suppressor::new();
        let generic = vec![fused("be careful", vec!["cognitive"])];
        suppressor.note_emitted("s1", "Bash", &generic, 1000);

        // Another generic pattern for a different tool, past its cooldown.
        let another = vec![fused("take care here", vec!["cognitive"])];
        let reason = suppressor
            .evaluate(&config(), "s1", "Write", &another, 1100)
            .unwrap();
        assert_eq!(reason, "generic advice already active");
    }

    #[test]
    fn test_identical_advice_other_session_allowed() {
        let suppressor = Suppressor::new();
        let items = vec![fused("use Glob before Read on fuzzy paths", vec!["cognitive"])];
        suppressor.note_emitted("s1", "Read", &items, 1000);
        assert!(suppressor
            .evaluate(&config(), "s2", "Read", &items, 1012)
            .is_none());
    }

    #[test]
    fn test_sessions_do_not_share_budget() {
        let suppressor = Suppressor::new();
        let mk = |n: u32| vec![fused(&format!("distinct advisory statement number {}", n), vec!["cognitive"])];
        suppressor.note_emitted("s1", "Bash", &mk(1), 1000);
        suppressor.note_emitted("s1", "Grep", &mk(2), 1005);
        assert!(suppressor
            .evaluate(&config(), "s2", "Write", &mk(3), 1010)
            .is_none());
    }
}
