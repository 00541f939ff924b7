//! Runtime Assembly
//!
//! The capability bundle: one value owning one handle per store, the queue,
//! the advisor, and every background worker. Components receive their
//! dependencies at construction; there is no process-wide mutable state.

use crate::advisory::Advisor;
use crate::bus::EventBus;
use crate::cognitive::CognitiveStore;
use crate::config::{DataPaths, KaitConfig};
use crate::eidos::{Aggregator, EidosStore};
use crate::errors::{KaitError, Result};
use crate::events::now_ns;
use crate::feedback::FeedbackMatcher;
use crate::heartbeat::HeartbeatWriter;
use crate::ingest;
use crate::pipeline::Pipeline;
use crate::promotion::PromotionLoop;
use crate::queue::EventQueue;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Runtime {
    pub config: KaitConfig,
    pub paths: DataPaths,
    pub queue: Arc<EventQueue>,
    pub cognitive: Arc<CognitiveStore>,
    pub eidos: Arc<EidosStore>,
    pub advisor: Arc<Advisor>,
    pub feedback: Arc<FeedbackMatcher>,
    pub promotion: Arc<PromotionLoop>,
    pub pipeline: Arc<Pipeline>,
    pub bus: EventBus,
    pub depth_gauge: Arc<AtomicU64>,
    token: String,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: KaitConfig) -> Result<Self> {
        let paths = config.paths();
        ensure_writable(&paths)?;

        let token = ingest::resolve_token(&config, &paths)?;
        let bus = EventBus::new();

        let queue = Arc::new(EventQueue::open(&paths, config.pipeline.rotate_bytes)?);
        let cognitive = Arc::new(
            CognitiveStore::load(paths.cognitive_snapshot(), config.cognitive.clone())?
                .with_bus(bus.clone()),
        );
        let eidos = Arc::new(
            EidosStore::open(&paths.eidos_db(), config.eidos.clone())?.with_bus(bus.clone()),
        );
        let advisor = Arc::new(
            Advisor::new(
                config.advisory.clone(),
                &paths,
                cognitive.clone(),
                eidos.clone(),
            )
            .with_bus(bus.clone()),
        );
        let feedback = Arc::new(FeedbackMatcher::new(
            config.feedback.clone(),
            cognitive.clone(),
            eidos.clone(),
            paths.feedback_log(),
        ));
        let promotion = Arc::new(PromotionLoop::new(
            cognitive.clone(),
            paths.clone(),
            config.promotion.clone(),
        ));

        let depth_gauge = Arc::new(AtomicU64::new(0));
        let sinks = Pipeline::standard_sinks(
            &config,
            &paths,
            cognitive.clone(),
            eidos.clone(),
            advisor.clone(),
            feedback.clone(),
        );
        let pipeline = Arc::new(Pipeline::new(
            queue.clone(),
            sinks,
            config.pipeline.clone(),
            &paths,
            depth_gauge.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            paths,
            queue,
            cognitive,
            eidos,
            advisor,
            feedback,
            promotion,
            pipeline,
            bus,
            depth_gauge,
            token,
            shutdown_tx,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Startup recovery: fold the overflow sidecar back in and age out
    /// anything orphaned while the daemon was down.
    pub fn recover(&self) -> Result<()> {
        let merged = self.queue.merge_overflow()?;
        if merged > 0 {
            tracing::info!(merged, "Recovered overflow events");
        }
        let closed = self.eidos.age_out(now_ns())?;
        if !closed.is_empty() {
            let aggregator = Aggregator::new(self.config.eidos.clone());
            for episode_id in &closed {
                if let Err(e) = aggregator.distill(&self.eidos, episode_id) {
                    tracing::warn!(episode = %episode_id, "Recovery distillation skipped: {}", e);
                }
            }
            tracing::info!(episodes = closed.len(), "Closed orphaned episodes");
        }
        Ok(())
    }

    /// Run every worker until shutdown. Returns the first fatal error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.recover()?;

        let mut tasks = Vec::new();

        // Pipeline scheduler owns the queue read side.
        tasks.push(tokio::spawn(
            self.pipeline.clone().run(self.shutdown_tx.subscribe()),
        ));

        // Timer-driven EIDOS sweep: timeouts, episode closure, distillation.
        {
            let runtime = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let aggregator = Aggregator::new(runtime.config.eidos.clone());
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                        _ = shutdown.changed() => break,
                    }
                    match runtime.eidos.age_out(now_ns()) {
                        Ok(closed) => {
                            for episode_id in &closed {
                                if let Err(e) = aggregator.distill(&runtime.eidos, episode_id) {
                                    tracing::warn!(
                                        episode = %episode_id,
                                        "Distillation skipped: {}",
                                        e
                                    );
                                }
                            }
                        }
                        Err(e) => tracing::warn!("EIDOS sweep failed: {}", e),
                    }
                }
            }));
        }

        if !self.config.lite {
            // Promotion loop, one pass at a time on its timer.
            {
                let runtime = self.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                            _ = shutdown.changed() => break,
                        }
                        let now_s = chrono::Utc::now().timestamp();
                        if let Err(e) = runtime.promotion.run_once(now_s) {
                            tracing::warn!("Promotion pass failed: {}", e);
                        }
                    }
                }));
            }

            // Advisory heartbeat for the status surface.
            {
                let paths = self.paths.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                tasks.push(tokio::spawn(async move {
                    let mut heartbeat = HeartbeatWriter::new(paths, "advisory");
                    loop {
                        heartbeat.beat();
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
        }

        // Reload signal republishes the advisory config snapshot.
        #[cfg(unix)]
        {
            let runtime = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let Ok(mut hangup) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                else {
                    return;
                };
                loop {
                    tokio::select! {
                        _ = hangup.recv() => {}
                        _ = shutdown.changed() => break,
                    }
                    match KaitConfig::load(None) {
                        Ok(fresh) => {
                            runtime.advisor.reload_config(fresh.advisory);
                            tracing::info!("Advisory config reloaded");
                        }
                        Err(e) => tracing::warn!("Config reload failed: {}", e),
                    }
                }
            }));
        }

        // The ingest surface runs on the main task so bind errors surface
        // as the daemon's exit status.
        let serve_result = ingest::serve(
            self.config.clone(),
            self.paths.clone(),
            self.queue.clone(),
            self.depth_gauge.clone(),
            self.token.clone(),
            self.shutdown_tx.subscribe(),
        )
        .await;

        let _ = self.shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        self.final_flush();
        serve_result
    }

    /// Drain on the way out: open steps become abandoned and the promotion
    /// state reflects the final reliability numbers.
    fn final_flush(&self) {
        match self.eidos.seal_all_open(now_ns()) {
            Ok(sealed) if sealed > 0 => {
                tracing::info!(sealed, "Sealed open steps at shutdown");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to seal open steps: {}", e),
        }
        if !self.config.lite {
            if let Err(e) = self.promotion.run_pass() {
                tracing::warn!("Final promotion pass failed: {}", e);
            }
        }
    }
}

fn ensure_writable(paths: &DataPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.root)
        .map_err(|_| KaitError::DataRootNotWritable(paths.root.clone()))?;
    let probe = paths.root.join(".write_probe");
    std::fs::write(&probe, b"ok").map_err(|_| KaitError::DataRootNotWritable(paths.root.clone()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
