//! Configuration Management
//!
//! Loads and manages daemon configuration from TOML files.
//! Configuration includes:
//! - Daemon settings (bind port, body limits, worker pool)
//! - Pipeline behavior (batch sizing, importance sampling, backpressure)
//! - Quality gate thresholds and dedup sensitivity
//! - Store tunables (reliability half-life, session timeouts)
//! - Advisory retrieval, fusion, and suppression knobs
//!
//! Environment variables override file values after load; the advisory
//! section is additionally hot-reloadable at runtime via a published
//! snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KaitConfig {
    /// Data root; all persisted state lives below this directory
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Lite mode: run only ingest + pipeline, skip pulse/watchdog loops
    #[serde(default)]
    pub lite: bool,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub ralph: RalphConfig,

    #[serde(default)]
    pub cognitive: CognitiveConfig,

    #[serde(default)]
    pub eidos: EidosConfig,

    #[serde(default)]
    pub advisory: AdvisoryConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Loopback bind address; non-loopback binds are refused
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted body size for POST /events
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Bounded connection pool size
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
    /// Bearer token; normally resolved from KAITD_TOKEN or the token file
    #[serde(skip)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum events read per cycle
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    /// Sleep between cycles when the queue is empty
    #[serde(default = "default_cycle_idle_ms")]
    pub cycle_idle_ms: u64,
    /// Events below this importance are sampled
    #[serde(default = "default_sample_floor")]
    pub sample_floor: f64,
    /// Keep rate for sampled low-importance events
    #[serde(default = "default_low_keep_rate")]
    pub low_keep_rate: f64,
    /// Queue depth at which batch size doubles
    #[serde(default = "default_soft_pressure")]
    pub soft_pressure: u64,
    /// Queue depth at which ingest returns 429
    #[serde(default = "default_hard_pressure")]
    pub hard_pressure: u64,
    /// Rotate the queue file once it reaches this size
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Candidates below this score are dropped
    #[serde(default = "default_mem_threshold")]
    pub mem_threshold: f64,
    /// Candidate text sizing bounds
    #[serde(default = "default_patch_min_chars")]
    pub patch_min_chars: usize,
    #[serde(default = "default_patch_max_chars")]
    pub patch_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    /// Verdict bands over the 0-12 total: <= primitive_max is primitive,
    /// <= needs_work_max is needs_work, <= review_max goes through dedup
    #[serde(default = "default_primitive_max")]
    pub primitive_max: u8,
    #[serde(default = "default_needs_work_max")]
    pub needs_work_max: u8,
    #[serde(default = "default_review_max")]
    pub review_max: u8,
    /// Token-set cosine threshold for duplicate detection
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    /// Roast history retention
    #[serde(default = "default_roast_history_max")]
    pub roast_history_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitiveConfig {
    /// Recency half-life for advisory readiness decay
    #[serde(default = "default_reliability_halflife_s")]
    pub reliability_halflife_s: u64,
    /// Evidence / counter-example ring capacity
    #[serde(default = "default_evidence_ring")]
    pub evidence_ring: usize,
    /// Statement length cap
    #[serde(default = "default_statement_max_chars")]
    pub statement_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EidosConfig {
    /// Open steps older than this are force-sealed as abandoned
    #[serde(default = "default_step_timeout_s")]
    pub step_timeout_s: u64,
    /// Sessions idle this long have their episode closed
    #[serde(default = "default_session_timeout_s")]
    pub session_timeout_s: u64,
    /// Minimum sealed steps before the aggregator considers an episode
    #[serde(default = "default_min_steps")]
    pub min_steps: usize,
    /// Cluster support needed to emit a distillation
    #[serde(default = "default_validate_min")]
    pub validate_min: usize,
    /// Distillation confidence half-life without reinforcement
    #[serde(default = "default_confidence_halflife_s")]
    pub confidence_halflife_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Full call budget; advise never blocks the caller past this
    #[serde(default = "default_advise_budget_ms")]
    pub budget_ms: u64,
    /// Below this remaining budget, skip rerank and the semantic source
    #[serde(default = "default_quick_min_ms")]
    pub quick_min_ms: u64,
    /// Items fetched per source before fusion
    #[serde(default = "default_per_source_k")]
    pub per_source_k: usize,
    /// Items surviving fusion that the reranker scores
    #[serde(default = "default_rerank_m")]
    pub rerank_m: usize,
    /// Maximum items returned per call
    #[serde(default = "default_max_emit")]
    pub max_emit: usize,
    /// Per-tool advice cooldown
    #[serde(default = "default_tool_cooldown_s")]
    pub tool_cooldown_s: u64,
    /// Identical advice suppressed within this window
    #[serde(default = "default_advice_ttl_s")]
    pub advice_ttl_s: u64,
    /// Max emissions per session per minute
    #[serde(default = "default_session_budget_per_min")]
    pub session_budget_per_min: usize,
    /// Require agreement from multiple sources before emitting
    #[serde(default)]
    pub agreement_gate: bool,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    /// Reciprocal-rank-fusion weights per source
    #[serde(default = "default_weight_cognitive")]
    pub weight_cognitive: f64,
    #[serde(default = "default_weight_eidos")]
    pub weight_eidos: f64,
    #[serde(default = "default_weight_semantic")]
    pub weight_semantic: f64,
    #[serde(default = "default_weight_packet")]
    pub weight_packet: f64,
    /// Disable embedding retrieval, keyword fallback only
    #[serde(default = "default_true")]
    pub keyword_semantic_only: bool,
    /// Packet cache capacity
    #[serde(default = "default_packet_capacity")]
    pub packet_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// A different tool within this window signals `ignored`
    #[serde(default = "default_exposure_timeout_s")]
    pub exposure_timeout_s: u64,
    /// Exposures expire entirely after this long
    #[serde(default = "default_exposure_expiry_s")]
    pub exposure_expiry_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Minimum seconds between promotion passes
    #[serde(default = "default_promotion_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_promote_reliability")]
    pub promote_reliability: f64,
    #[serde(default = "default_promote_validations")]
    pub promote_validations: u64,
    #[serde(default = "default_demotion_threshold")]
    pub demotion_threshold: f64,
}

impl Default for KaitConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            lite: false,
            daemon: DaemonConfig::default(),
            pipeline: PipelineConfig::default(),
            memory: MemoryConfig::default(),
            ralph: RalphConfig::default(),
            cognitive: CognitiveConfig::default(),
            eidos: EidosConfig::default(),
            advisory: AdvisoryConfig::default(),
            feedback: FeedbackConfig::default(),
            promotion: PromotionConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            worker_pool: default_worker_pool(),
            token: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max: default_batch_max(),
            cycle_idle_ms: default_cycle_idle_ms(),
            sample_floor: default_sample_floor(),
            low_keep_rate: default_low_keep_rate(),
            soft_pressure: default_soft_pressure(),
            hard_pressure: default_hard_pressure(),
            rotate_bytes: default_rotate_bytes(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mem_threshold: default_mem_threshold(),
            patch_min_chars: default_patch_min_chars(),
            patch_max_chars: default_patch_max_chars(),
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            primitive_max: default_primitive_max(),
            needs_work_max: default_needs_work_max(),
            review_max: default_review_max(),
            dedup_threshold: default_dedup_threshold(),
            roast_history_max: default_roast_history_max(),
        }
    }
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            reliability_halflife_s: default_reliability_halflife_s(),
            evidence_ring: default_evidence_ring(),
            statement_max_chars: default_statement_max_chars(),
        }
    }
}

impl Default for EidosConfig {
    fn default() -> Self {
        Self {
            step_timeout_s: default_step_timeout_s(),
            session_timeout_s: default_session_timeout_s(),
            min_steps: default_min_steps(),
            validate_min: default_validate_min(),
            confidence_halflife_s: default_confidence_halflife_s(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            budget_ms: default_advise_budget_ms(),
            quick_min_ms: default_quick_min_ms(),
            per_source_k: default_per_source_k(),
            rerank_m: default_rerank_m(),
            max_emit: default_max_emit(),
            tool_cooldown_s: default_tool_cooldown_s(),
            advice_ttl_s: default_advice_ttl_s(),
            session_budget_per_min: default_session_budget_per_min(),
            agreement_gate: false,
            min_sources: default_min_sources(),
            weight_cognitive: default_weight_cognitive(),
            weight_eidos: default_weight_eidos(),
            weight_semantic: default_weight_semantic(),
            weight_packet: default_weight_packet(),
            keyword_semantic_only: true,
            packet_capacity: default_packet_capacity(),
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            exposure_timeout_s: default_exposure_timeout_s(),
            exposure_expiry_s: default_exposure_expiry_s(),
        }
    }
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            interval_s: default_promotion_interval_s(),
            promote_reliability: default_promote_reliability(),
            promote_validations: default_promote_validations(),
            demotion_threshold: default_demotion_threshold(),
        }
    }
}

fn default_data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kait")
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_worker_pool() -> usize {
    32
}
fn default_batch_max() -> usize {
    1000
}
fn default_cycle_idle_ms() -> u64 {
    250
}
fn default_sample_floor() -> f64 {
    0.3
}
fn default_low_keep_rate() -> f64 {
    0.25
}
fn default_soft_pressure() -> u64 {
    5_000
}
fn default_hard_pressure() -> u64 {
    20_000
}
fn default_rotate_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_mem_threshold() -> f64 {
    0.5
}
fn default_patch_min_chars() -> usize {
    12
}
fn default_patch_max_chars() -> usize {
    500
}
fn default_primitive_max() -> u8 {
    1
}
fn default_needs_work_max() -> u8 {
    3
}
fn default_review_max() -> u8 {
    5
}
fn default_dedup_threshold() -> f64 {
    0.85
}
fn default_roast_history_max() -> usize {
    2000
}
fn default_reliability_halflife_s() -> u64 {
    14 * 24 * 3600
}
fn default_evidence_ring() -> usize {
    10
}
fn default_statement_max_chars() -> usize {
    500
}
fn default_step_timeout_s() -> u64 {
    120
}
fn default_session_timeout_s() -> u64 {
    30 * 60
}
fn default_min_steps() -> usize {
    5
}
fn default_validate_min() -> usize {
    5
}
fn default_confidence_halflife_s() -> u64 {
    7 * 24 * 3600
}
fn default_advise_budget_ms() -> u64 {
    1500
}
fn default_quick_min_ms() -> u64 {
    900
}
fn default_per_source_k() -> usize {
    8
}
fn default_rerank_m() -> usize {
    12
}
fn default_max_emit() -> usize {
    2
}
fn default_tool_cooldown_s() -> u64 {
    30
}
fn default_advice_ttl_s() -> u64 {
    600
}
fn default_session_budget_per_min() -> usize {
    2
}
fn default_min_sources() -> usize {
    2
}
fn default_weight_cognitive() -> f64 {
    1.0
}
fn default_weight_eidos() -> f64 {
    0.9
}
fn default_weight_semantic() -> f64 {
    0.6
}
fn default_weight_packet() -> f64 {
    0.8
}
fn default_packet_capacity() -> usize {
    256
}
fn default_exposure_timeout_s() -> u64 {
    30
}
fn default_exposure_expiry_s() -> u64 {
    300
}
fn default_promotion_interval_s() -> u64 {
    3600
}
fn default_promote_reliability() -> f64 {
    0.80
}
fn default_promote_validations() -> u64 {
    5
}
fn default_demotion_threshold() -> f64 {
    0.65
}
fn default_true() -> bool {
    true
}

impl KaitConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: KaitConfig = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p.display()))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => {
                let mut loaded = None;
                for p in Self::default_paths() {
                    if let Ok(content) = std::fs::read_to_string(&p) {
                        loaded = Some(toml::from_str(&content).with_context(|| {
                            format!("Failed to parse config at {}", p.display())
                        })?);
                        break;
                    }
                }
                loaded.unwrap_or_default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("kait.toml")];
        if let Some(cfg) = dirs::config_dir() {
            paths.push(cfg.join("kait").join("config.toml"));
        }
        paths
    }

    /// Apply the closed set of environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("DATA_ROOT") {
            if !root.is_empty() {
                self.data_root = PathBuf::from(root);
            }
        }
        if let Ok(v) = std::env::var("KAIT_LITE") {
            self.lite = v == "1";
        }
        if let Ok(v) = std::env::var("KAIT_EMBEDDINGS") {
            self.advisory.keyword_semantic_only = v == "0";
        }
        if let Ok(v) = std::env::var("KAIT_ADVISORY_AGREEMENT_GATE") {
            self.advisory.agreement_gate = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("KAIT_ADVISORY_MIN_SOURCES") {
            match v.parse() {
                Ok(n) => self.advisory.min_sources = n,
                Err(_) => warn!("Ignoring non-numeric KAIT_ADVISORY_MIN_SOURCES"),
            }
        }
        if let Ok(v) = std::env::var("KAIT_PIPELINE_LOW_KEEP_RATE") {
            match v.parse::<f64>() {
                Ok(rate) => self.pipeline.low_keep_rate = rate.clamp(0.0, 1.0),
                Err(_) => warn!("Ignoring non-numeric KAIT_PIPELINE_LOW_KEEP_RATE"),
            }
        }
        if let Ok(v) = std::env::var("KAIT_MEMORY_PATCH_MAX_CHARS") {
            match v.parse() {
                Ok(n) => self.memory.patch_max_chars = n,
                Err(_) => warn!("Ignoring non-numeric KAIT_MEMORY_PATCH_MAX_CHARS"),
            }
        }
        if let Ok(v) = std::env::var("KAIT_MEMORY_PATCH_MIN_CHARS") {
            match v.parse() {
                Ok(n) => self.memory.patch_min_chars = n,
                Err(_) => warn!("Ignoring non-numeric KAIT_MEMORY_PATCH_MIN_CHARS"),
            }
        }
        if let Ok(token) = std::env::var("KAITD_TOKEN") {
            if !token.is_empty() {
                self.daemon.token = Some(token);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ralph.primitive_max >= self.ralph.needs_work_max
            || self.ralph.needs_work_max >= self.ralph.review_max
        {
            anyhow::bail!("Verdict bands must be strictly increasing");
        }
        if !(0.0..=1.0).contains(&self.pipeline.low_keep_rate) {
            anyhow::bail!("low_keep_rate must be within [0, 1]");
        }
        if self.promotion.demotion_threshold >= self.promotion.promote_reliability {
            anyhow::bail!("demotion_threshold must sit below promote_reliability");
        }
        Ok(())
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(self.data_root.clone())
    }
}

/// Resolved locations of every persisted file below the data root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }
    pub fn queue_file(&self) -> PathBuf {
        self.queue_dir().join("events.jsonl")
    }
    pub fn queue_overflow(&self) -> PathBuf {
        self.queue_dir().join("events.overflow.jsonl")
    }
    pub fn queue_rotated(&self) -> PathBuf {
        self.queue_dir().join("events.rotated.jsonl")
    }
    pub fn queue_state(&self) -> PathBuf {
        self.queue_dir().join("state.json")
    }
    pub fn cognitive_snapshot(&self) -> PathBuf {
        self.root.join("cognitive_insights.json")
    }
    pub fn eidos_db(&self) -> PathBuf {
        self.root.join("eidos.db")
    }
    pub fn decision_ledger(&self) -> PathBuf {
        self.root.join("advisory_decision_ledger.jsonl")
    }
    pub fn feedback_log(&self) -> PathBuf {
        self.root.join("advisor").join("implicit_feedback.jsonl")
    }
    pub fn advice_log(&self) -> PathBuf {
        self.root.join("advisor").join("advice_log.jsonl")
    }
    pub fn promotion_log(&self) -> PathBuf {
        self.root.join("promotion_log.jsonl")
    }
    pub fn roast_history(&self) -> PathBuf {
        self.root.join("ralph_roasts.jsonl")
    }
    pub fn pipeline_stats(&self) -> PathBuf {
        self.root.join("pipeline_stats.json")
    }
    pub fn processed_ids(&self) -> PathBuf {
        self.root.join("processed_ids.json")
    }
    pub fn token_file(&self) -> PathBuf {
        self.root.join("kaitd.token")
    }
    pub fn heartbeat(&self, worker: &str) -> PathBuf {
        self.root.join(format!("{}.heartbeat.json", worker))
    }
    /// Guidance file target for promoted insights
    pub fn guidance_file(&self, name: &str) -> PathBuf {
        self.root.join("guidance").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KaitConfig::default();
        assert_eq!(config.daemon.port, 8787);
        assert_eq!(config.pipeline.batch_max, 1000);
        assert_eq!(config.pipeline.low_keep_rate, 0.25);
        assert_eq!(config.memory.mem_threshold, 0.5);
        assert_eq!(config.ralph.dedup_threshold, 0.85);
        assert_eq!(config.advisory.max_emit, 2);
        assert_eq!(config.advisory.tool_cooldown_s, 30);
        assert_eq!(config.advisory.advice_ttl_s, 600);
        assert_eq!(config.feedback.exposure_timeout_s, 30);
        assert_eq!(config.promotion.interval_s, 3600);
        assert_eq!(config.promotion.demotion_threshold, 0.65);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: KaitConfig = toml::from_str(
            r#"
            [pipeline]
            batch_max = 50

            [advisory]
            agreement_gate = true
            min_sources = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.batch_max, 50);
        assert!(config.advisory.agreement_gate);
        assert_eq!(config.advisory.min_sources, 3);
        // Untouched sections keep defaults
        assert_eq!(config.daemon.port, 8787);
    }

    #[test]
    fn test_validate_rejects_inverted_bands() {
        let mut config = KaitConfig::default();
        config.ralph.primitive_max = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_keep_rate() {
        let mut config = KaitConfig::default();
        config.pipeline.low_keep_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_layout() {
        let paths = DataPaths::new(PathBuf::from("/tmp/kait-test"));
        assert!(paths.queue_file().ends_with("queue/events.jsonl"));
        assert!(paths
            .feedback_log()
            .ends_with("advisor/implicit_feedback.jsonl"));
        assert!(paths
            .heartbeat("kaitd")
            .ends_with("kaitd.heartbeat.json"));
    }

    #[test]
    fn test_verdict_bands_default_shape() {
        let config = KaitConfig::default();
        assert!(config.ralph.primitive_max < config.ralph.needs_work_max);
        assert!(config.ralph.needs_work_max < config.ralph.review_max);
        assert_eq!(config.ralph.review_max, 5);
    }
}
