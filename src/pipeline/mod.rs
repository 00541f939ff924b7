//! Batch Pipeline
//!
//! Single scheduler loop owning the queue's read side. Each cycle reads a
//! batch, partitions by priority, fans every surviving event out to the
//! sinks in order, then commits the offset and persists cycle stats. A
//! cycle that fails leaves the offset untouched so the batch replays;
//! sinks are idempotent keyed by event id.

mod stats;

pub use stats::PipelineStats;

use crate::advisory::{AdviceRequest, Advisor};
use crate::capture::MemoryCapture;
use crate::cognitive::CognitiveStore;
use crate::config::{DataPaths, KaitConfig, PipelineConfig};
use crate::eidos::{Aggregator, EidosStore};
use crate::errors::{ErrorClass, KaitError, Result};
use crate::events::{Event, EventKind, Priority, QueueEntry};
use crate::feedback::FeedbackMatcher;
use crate::heartbeat::HeartbeatWriter;
use crate::queue::EventQueue;
use crate::ralph::MetaRalph;
use crate::storage;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

const PROCESSED_RING: usize = 10_000;

/// Per-event result a sink reports back to the scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkReport {
    pub insights_created: u64,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_event(&self, event: &Event) -> Result<SinkReport>;
}

/// Pluggable observer slot for the chips subsystem. The OSS build ships a
/// no-op implementation.
pub trait ChipsObserver: Send + Sync {
    fn observe(&self, event: &Event);
}

pub struct NoopChips;

impl ChipsObserver for NoopChips {
    fn observe(&self, event: &Event) {
        tracing::trace!(kind = event.kind.as_str(), "chips observer (noop)");
    }
}

/// Memory capture feeding the quality gate; quality verdicts land in the
/// cognitive store.
pub struct MemorySink {
    capture: MemoryCapture,
    ralph: MetaRalph,
    cognitive: Arc<CognitiveStore>,
}

impl MemorySink {
    pub fn new(capture: MemoryCapture, ralph: MetaRalph, cognitive: Arc<CognitiveStore>) -> Self {
        Self {
            capture,
            ralph,
            cognitive,
        }
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn on_event(&self, event: &Event) -> Result<SinkReport> {
        let mut candidates = self.capture.scan(event);
        if candidates.is_empty() {
            if let Some(raw) = self.capture.raw_candidate(event) {
                candidates.push(raw);
            }
        }

        let mut report = SinkReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }

        let existing = self.cognitive.statements();
        for candidate in candidates {
            let verdict = self.ralph.roast(&candidate, &existing);
            if !verdict.is_quality() {
                continue;
            }
            let statement = verdict
                .refined_version
                .as_deref()
                .unwrap_or(candidate.text.as_str());
            match self.cognitive.upsert(
                candidate.category.into(),
                statement,
                "meta_ralph",
                &candidate.source_event_id,
            ) {
                Ok(_) => report.insights_created += 1,
                Err(e) if e.class() == ErrorClass::Transient => {
                    tracing::warn!("Cognitive upsert failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

/// Episode and step state transitions.
pub struct EidosSink {
    store: Arc<EidosStore>,
    aggregator: Aggregator,
}

impl EidosSink {
    pub fn new(store: Arc<EidosStore>, aggregator: Aggregator) -> Self {
        Self { store, aggregator }
    }

    /// Sweep timeouts and distill any episodes that closed.
    pub fn sweep(&self, now_ns: i64) -> Result<usize> {
        let closed = self.store.age_out(now_ns)?;
        let mut distilled = 0;
        for episode_id in &closed {
            match self.aggregator.distill(&self.store, episode_id) {
                Ok(created) => distilled += created.len(),
                Err(e) => {
                    tracing::warn!(episode = %episode_id, "Aggregator error, cluster skipped: {}", e);
                }
            }
        }
        Ok(distilled)
    }
}

#[async_trait]
impl EventSink for EidosSink {
    fn name(&self) -> &'static str {
        "eidos"
    }

    async fn on_event(&self, event: &Event) -> Result<SinkReport> {
        self.store.observe(event)?;
        Ok(SinkReport::default())
    }
}

pub struct ChipsSink {
    observer: Box<dyn ChipsObserver>,
}

impl ChipsSink {
    pub fn new(observer: Box<dyn ChipsObserver>) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl EventSink for ChipsSink {
    fn name(&self) -> &'static str {
        "chips"
    }

    async fn on_event(&self, event: &Event) -> Result<SinkReport> {
        self.observer.observe(event);
        Ok(SinkReport::default())
    }
}

/// Pre-tool advice plus exposure registration.
pub struct AdvisorySink {
    advisor: Arc<Advisor>,
    feedback: Arc<FeedbackMatcher>,
}

impl AdvisorySink {
    pub fn new(advisor: Arc<Advisor>, feedback: Arc<FeedbackMatcher>) -> Self {
        Self { advisor, feedback }
    }
}

#[async_trait]
impl EventSink for AdvisorySink {
    fn name(&self) -> &'static str {
        "advisory"
    }

    async fn on_event(&self, event: &Event) -> Result<SinkReport> {
        if event.kind != EventKind::PreTool {
            return Ok(SinkReport::default());
        }
        let Some(tool) = event.tool.clone() else {
            return Ok(SinkReport::default());
        };
        let request = AdviceRequest {
            session_id: event.session_id.clone(),
            tool: tool.clone(),
            tool_args: event.tool_args.clone(),
            context: event.text.clone(),
            budget_ms: None,
        };
        let items = self.advisor.advise(&request).await;
        if !items.is_empty() {
            self.feedback.record_exposure(
                &event.session_id,
                &tool,
                &items,
                event.ts_ns / 1_000_000_000,
            );
        }
        Ok(SinkReport::default())
    }
}

/// Pairs processed outcomes against pending exposures.
pub struct FeedbackSink {
    matcher: Arc<FeedbackMatcher>,
}

impl FeedbackSink {
    pub fn new(matcher: Arc<FeedbackMatcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl EventSink for FeedbackSink {
    fn name(&self) -> &'static str {
        "feedback"
    }

    async fn on_event(&self, event: &Event) -> Result<SinkReport> {
        self.matcher.observe(event);
        Ok(SinkReport::default())
    }
}

/// Already-processed event ids, bounded, persisted so crash replays are
/// detected and skipped.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessedIds {
    ring: VecDeque<String>,
    #[serde(skip)]
    index: HashSet<String>,
}

impl ProcessedIds {
    fn load(path: &PathBuf) -> Self {
        let mut loaded: ProcessedIds = storage::read_json_or_default(path).unwrap_or_default();
        loaded.index = loaded.ring.iter().cloned().collect();
        loaded
    }

    fn contains(&self, event_id: &str) -> bool {
        self.index.contains(event_id)
    }

    fn insert(&mut self, event_id: String) {
        if self.index.insert(event_id.clone()) {
            self.ring.push_back(event_id);
            while self.ring.len() > PROCESSED_RING {
                if let Some(evicted) = self.ring.pop_front() {
                    self.index.remove(&evicted);
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleOutcome {
    pub processed: usize,
    pub skipped: usize,
    /// Events that bypassed the capture path via importance sampling
    pub sampled: usize,
    pub insights_created: u64,
}

pub struct Pipeline {
    queue: Arc<EventQueue>,
    sinks: Vec<Box<dyn EventSink>>,
    config: PipelineConfig,
    stats_path: PathBuf,
    processed_path: PathBuf,
    processed: Mutex<ProcessedIds>,
    depth_gauge: Arc<AtomicU64>,
    heartbeat: Mutex<HeartbeatWriter>,
}

impl Pipeline {
    pub fn new(
        queue: Arc<EventQueue>,
        sinks: Vec<Box<dyn EventSink>>,
        config: PipelineConfig,
        paths: &DataPaths,
        depth_gauge: Arc<AtomicU64>,
    ) -> Self {
        let processed_path = paths.processed_ids();
        Self {
            queue,
            sinks,
            config,
            stats_path: paths.pipeline_stats(),
            processed: Mutex::new(ProcessedIds::load(&processed_path)),
            processed_path,
            depth_gauge,
            heartbeat: Mutex::new(HeartbeatWriter::new(paths.clone(), "kaitd")),
        }
    }

    /// Build the standard sink chain from a full runtime's parts.
    pub fn standard_sinks(
        config: &KaitConfig,
        paths: &DataPaths,
        cognitive: Arc<CognitiveStore>,
        eidos: Arc<EidosStore>,
        advisor: Arc<Advisor>,
        feedback: Arc<FeedbackMatcher>,
    ) -> Vec<Box<dyn EventSink>> {
        vec![
            Box::new(MemorySink::new(
                MemoryCapture::new(&config.memory),
                MetaRalph::new(config.ralph.clone()).with_history(paths.roast_history()),
                cognitive,
            )),
            Box::new(EidosSink::new(
                eidos,
                Aggregator::new(config.eidos.clone()),
            )),
            Box::new(ChipsSink::new(Box::new(NoopChips))),
            Box::new(AdvisorySink::new(advisor, feedback.clone())),
            Box::new(FeedbackSink::new(feedback)),
        ]
    }

    /// One scheduler cycle. The queue offset only advances when every
    /// surviving event has passed through every sink.
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let started = Instant::now();
        self.queue.rotate_if_needed()?;

        let depth = self.queue.depth();
        self.depth_gauge.store(depth, Ordering::Relaxed);

        let batch_max = if depth > self.config.soft_pressure {
            self.config.batch_max * 2
        } else {
            self.config.batch_max
        };

        let (mut entries, cursor) = self.queue.read_batch(batch_max)?;
        if entries.is_empty() {
            let merged = self.queue.merge_overflow()?;
            if merged > 0 {
                tracing::debug!(merged, "Merged overflow sidecar");
            }
            let mut stats = PipelineStats::load(&self.stats_path).unwrap_or_default();
            stats.empty_cycles += 1;
            stats.last_cycle_at = Some(chrono::Utc::now());
            if let Err(e) = stats.persist(&self.stats_path) {
                tracing::warn!("Failed to persist pipeline stats: {}", e);
            }
            self.heartbeat.lock().beat();
            return Ok(CycleOutcome::default());
        }

        // HIGH first, then MEDIUM, then LOW; stable within a class.
        entries.sort_by_key(|entry| entry.priority);

        let mut outcome = CycleOutcome::default();
        for entry in &entries {
            let event = &entry.event;
            {
                let processed = self.processed.lock();
                if processed.contains(&event.event_id) {
                    outcome.skipped += 1;
                    continue;
                }
            }
            // Importance sampling bounds the capture/roast path; the state
            // machine sinks still see every event.
            let sampled_out = !self.keep(entry);
            if sampled_out {
                outcome.sampled += 1;
            }

            for sink in &self.sinks {
                if sampled_out && sink.name() == "memory" {
                    continue;
                }
                match sink.on_event(event).await {
                    Ok(report) => outcome.insights_created += report.insights_created,
                    Err(e) => match e.class() {
                        ErrorClass::Fatal => return Err(e),
                        class => {
                            tracing::warn!(
                                sink = sink.name(),
                                event_id = %event.event_id,
                                ?class,
                                "Sink error, continuing: {}",
                                e
                            );
                        }
                    },
                }
            }
            outcome.processed += 1;
            self.processed.lock().insert(event.event_id.clone());
        }

        self.queue.commit(&cursor)?;
        self.persist_processed();

        let mut stats = PipelineStats::load(&self.stats_path).unwrap_or_default();
        stats.cycles += 1;
        stats.events_processed += outcome.processed as u64;
        stats.insights_created += outcome.insights_created;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats.last_cycle_at = Some(chrono::Utc::now());
        if let Err(e) = stats.persist(&self.stats_path) {
            tracing::warn!("Failed to persist pipeline stats: {}", e);
        }
        self.heartbeat.lock().beat_with(Some(format!(
            "processed {} events",
            outcome.processed
        )));

        Ok(outcome)
    }

    /// Importance sampling: low-importance events survive at the keep rate.
    /// The decision hashes the event id so replays make the same choice.
    fn keep(&self, entry: &QueueEntry) -> bool {
        if entry.event.importance >= self.config.sample_floor
            || entry.priority == Priority::High
        {
            return true;
        }
        let mut hasher = Sha256::new();
        hasher.update(entry.event.event_id.as_bytes());
        let digest = hasher.finalize();
        let bucket = u16::from_be_bytes([digest[0], digest[1]]) as f64 / u16::MAX as f64;
        bucket < self.config.low_keep_rate
    }

    fn persist_processed(&self) {
        let processed = self.processed.lock();
        if let Err(e) = storage::write_json_atomic(&self.processed_path, &*processed) {
            tracing::warn!("Failed to persist processed ids: {}", e);
        }
    }

    pub fn queue_depth(&self) -> u64 {
        self.depth_gauge.load(Ordering::Relaxed)
    }

    /// Scheduler loop: run cycles until shutdown flips. A cycle that fails
    /// or panics leaves the offset untouched, so the batch retries.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        use futures::FutureExt;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = std::panic::AssertUnwindSafe(self.cycle())
                .catch_unwind()
                .await;
            let idle = match result {
                Ok(Ok(outcome)) => outcome.processed == 0 && outcome.skipped == 0,
                Ok(Err(e)) => {
                    tracing::error!("Pipeline cycle failed: {}", e);
                    if e.class() == ErrorClass::Fatal {
                        break;
                    }
                    true
                }
                Err(_) => {
                    tracing::error!("Pipeline cycle panicked, batch skipped");
                    true
                }
            };
            let wait = if idle {
                std::time::Duration::from_millis(self.config.cycle_idle_ms)
            } else {
                std::time::Duration::from_millis(5)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Pipeline scheduler stopped");
    }
}
