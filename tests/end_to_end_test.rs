//! End-to-end flows through the full runtime: events enter over the HTTP
//! surface, the pipeline distributes them, and the stores, ledger, and logs
//! reflect the outcome.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kait::advisory::{AdviceDecision, AdviceLogEntry, DecisionOutcome};
use kait::cognitive::{Insight, InsightCategory};
use kait::config::KaitConfig;
use kait::eidos::DistillationKind;
use kait::events::now_ns;
use kait::feedback::{FeedbackEntry, FeedbackSignal};
use kait::ingest::{router, AppState};
use kait::promotion::{PromotionAction, PromotionRecord};
use kait::runtime::Runtime;
use kait::storage;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

struct Harness {
    _dir: TempDir,
    runtime: Arc<Runtime>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = KaitConfig::default();
        config.data_root = dir.path().to_path_buf();
        let runtime = Arc::new(Runtime::new(config).unwrap());
        Self { _dir: dir, runtime }
    }

    fn app(&self) -> axum::Router {
        let state = AppState {
            queue: self.runtime.queue.clone(),
            paths: self.runtime.paths.clone(),
            token: self.runtime.token().to_string(),
            depth_gauge: self.runtime.depth_gauge.clone(),
            hard_pressure: self.runtime.config.pipeline.hard_pressure,
            workers: Arc::new(tokio::sync::Semaphore::new(
                self.runtime.config.daemon.worker_pool,
            )),
        };
        router(state, self.runtime.config.daemon.max_body_bytes)
    }

    async fn post(&self, body: &str) -> StatusCode {
        let response = self
            .app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events")
                    .header(
                        "authorization",
                        format!("Bearer {}", self.runtime.token()),
                    )
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    async fn drain(&self) {
        loop {
            let outcome = self.runtime.pipeline.cycle().await.unwrap();
            if outcome.processed == 0 && outcome.skipped == 0 {
                break;
            }
        }
    }

    fn seed_path_insight(&self) -> String {
        let mut insight = Insight::new(
            InsightCategory::Wisdom,
            "File exists at expected path often wrong; use Glob first",
            "seed",
        );
        insight.validations = 100;
        let key = insight.key.clone();
        self.runtime.cognitive.insert(insight).unwrap();
        key
    }

    fn ledger(&self) -> Vec<AdviceDecision> {
        storage::read_jsonl(&self.runtime.paths.decision_ledger()).unwrap()
    }

    fn feedback_log(&self) -> Vec<FeedbackEntry> {
        storage::read_jsonl(&self.runtime.paths.feedback_log()).unwrap()
    }
}

fn pre_tool_read(session: &str) -> String {
    format!(
        r#"{{"session_id":"{}","kind":"pre_tool","tool":"Read","tool_args":{{"path":"missing.py"}}}}"#,
        session
    )
}

#[tokio::test]
async fn scenario_a_pre_tool_advice_emission() {
    let harness = Harness::new();
    let key = harness.seed_path_insight();
    assert!(!key.is_empty());

    assert_eq!(harness.post(&pre_tool_read("s1")).await, StatusCode::ACCEPTED);
    assert_eq!(harness.runtime.queue.depth(), 1);

    harness.drain().await;
    assert_eq!(harness.runtime.queue.depth(), 0);

    let ledger = harness.ledger();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].outcome, DecisionOutcome::Emitted);
    assert_eq!(ledger[0].tool, "Read");
    assert!(ledger[0].sources.iter().any(|s| s.source == "cognitive"));

    let advice: Vec<AdviceLogEntry> =
        storage::read_jsonl(&harness.runtime.paths.advice_log()).unwrap();
    assert!(advice[0].text.starts_with("File exists at expected path"));
}

#[tokio::test]
async fn scenario_b_feedback_validates_insight() {
    let harness = Harness::new();
    let key = harness.seed_path_insight();

    harness.post(&pre_tool_read("s1")).await;
    harness.drain().await;

    harness
        .post(r#"{"session_id":"s1","kind":"post_tool","tool":"Read","success":true}"#)
        .await;
    harness.drain().await;

    let insight = harness.runtime.cognitive.get(&key).unwrap();
    assert_eq!(insight.validations, 101);

    let feedback = harness.feedback_log();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].tool, "Read");
    assert_eq!(feedback[0].signal, FeedbackSignal::Followed);
    assert!(feedback[0].success);
}

#[tokio::test]
async fn scenario_c_contradiction_on_failure() {
    let harness = Harness::new();
    let key = harness.seed_path_insight();

    harness.post(&pre_tool_read("s1")).await;
    harness.drain().await;

    harness
        .post(r#"{"session_id":"s1","kind":"post_tool_failure","tool":"Read"}"#)
        .await;
    harness.drain().await;

    let insight = harness.runtime.cognitive.get(&key).unwrap();
    assert_eq!(insight.contradictions, 1);
    assert!((insight.reliability - 100.0 / 101.0).abs() < 1e-9);

    let feedback = harness.feedback_log();
    assert_eq!(feedback[0].signal, FeedbackSignal::Unhelpful);
    assert!(!feedback[0].success);
}

#[tokio::test]
async fn scenario_c_demotion_after_reliability_collapse() {
    let harness = Harness::new();
    let mut insight = Insight::new(
        InsightCategory::Wisdom,
        "an insight promoted then repeatedly contradicted",
        "seed",
    );
    insight.validations = 6;
    let key = insight.key.clone();
    harness.runtime.cognitive.insert(insight).unwrap();

    harness.runtime.promotion.run_pass().unwrap();
    assert!(harness.runtime.cognitive.get(&key).unwrap().promoted);

    for n in 0..5 {
        harness
            .runtime
            .cognitive
            .contradict(&key, &format!("c{}", n))
            .unwrap();
    }
    harness.runtime.promotion.run_pass().unwrap();

    let demoted = harness.runtime.cognitive.get(&key).unwrap();
    assert!(!demoted.promoted);

    let records: Vec<PromotionRecord> =
        storage::read_jsonl(&harness.runtime.paths.promotion_log()).unwrap();
    let demotion = records
        .iter()
        .find(|r| r.action == PromotionAction::Demoted)
        .unwrap();
    assert_eq!(demotion.reason.as_deref(), Some("reliability_degraded"));
}

#[tokio::test]
async fn scenario_d_trivial_learning_rejected() {
    let harness = Harness::new();
    harness
        .post(r#"{"session_id":"s1","kind":"user_prompt","text":"import sys"}"#)
        .await;
    harness.drain().await;

    assert!(harness.runtime.cognitive.is_empty());

    let roasts: Vec<kait::ralph::RoastRecord> =
        storage::read_jsonl(&harness.runtime.paths.roast_history()).unwrap();
    assert_eq!(roasts.len(), 1);
    assert!(matches!(
        roasts[0].verdict,
        kait::ralph::VerdictKind::Primitive | kait::ralph::VerdictKind::NeedsWork
    ));
}

#[tokio::test]
async fn scenario_e_episode_distillation() {
    let harness = Harness::new();
    for _ in 0..10 {
        harness
            .post(r#"{"session_id":"s5","kind":"pre_tool","tool":"TaskUpdate","tool_args":{"query":"mark task done"}}"#)
            .await;
        harness.drain().await;
        harness
            .post(r#"{"session_id":"s5","kind":"post_tool","tool":"TaskUpdate","success":true}"#)
            .await;
        harness.drain().await;
    }

    // Idle past the session timeout closes the episode.
    let episode = harness.runtime.eidos.active_episode("s5").unwrap();
    assert_eq!(episode.step_count, 10);
    let far_future = now_ns()
        + (harness.runtime.config.eidos.session_timeout_s as i64 + 60) * 1_000_000_000;
    let closed = harness.runtime.eidos.age_out(far_future).unwrap();
    assert_eq!(closed, vec![episode.episode_id.clone()]);

    let aggregator = kait::eidos::Aggregator::new(harness.runtime.config.eidos.clone());
    aggregator
        .distill(&harness.runtime.eidos, &episode.episode_id)
        .unwrap();

    let distillations = harness.runtime.eidos.distillations();
    assert_eq!(distillations.len(), 1);
    let d = &distillations[0];
    assert_eq!(d.kind, DistillationKind::Heuristic);
    assert!(d.statement.contains("TaskUpdate"));
    assert!(d.confidence >= 0.7);
    assert!(d.source_step_ids.len() >= 5);
}

#[tokio::test]
async fn scenario_f_advisory_suppression() {
    let harness = Harness::new();
    harness.seed_path_insight();

    harness.post(&pre_tool_read("s1")).await;
    harness.drain().await;
    // Same pre_tool pattern again within the cooldown window.
    harness.post(&pre_tool_read("s1")).await;
    harness.drain().await;

    let ledger = harness.ledger();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].outcome, DecisionOutcome::Emitted);
    assert_eq!(ledger[1].outcome, DecisionOutcome::Blocked);
    let reason = &ledger[1].suppression_reasons[0];
    assert!(
        reason.contains("(TTL 600s)"),
        "unexpected reason: {}",
        reason
    );
}

#[tokio::test]
async fn unauthorized_post_rejected() {
    let harness = Harness::new();
    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .body(Body::from(pre_tool_read("s1")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_endpoint_tracks_pipeline() {
    let harness = Harness::new();
    harness.post(&pre_tool_read("s1")).await;
    harness.drain().await;

    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status["queue_depth"], 0);
    assert!(status["last_cycle_age_s"].is_i64());
    assert_eq!(status["components"]["kaitd"]["status"], "ok");
}

#[tokio::test]
async fn promotion_consistency_with_guidance_file() {
    let harness = Harness::new();
    let mut insight = Insight::new(
        InsightCategory::Wisdom,
        "a reliably validated piece of guidance",
        "seed",
    );
    insight.validations = 9;
    let key = insight.key.clone();
    harness.runtime.cognitive.insert(insight).unwrap();
    harness.runtime.promotion.run_pass().unwrap();

    let content =
        std::fs::read_to_string(harness.runtime.paths.guidance_file("CLAUDE.md")).unwrap();
    assert!(content.contains(&key));

    // Everything in the file satisfies the promotion invariant.
    let promoted = harness.runtime.cognitive.get(&key).unwrap();
    assert!(promoted.reliability >= 0.80);
    assert!(promoted.validations >= 5);
}
