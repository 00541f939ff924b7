//! EIDOS SQLite Store
//!
//! Single-writer relational store for episodes, steps, and distillations.
//! WAL mode with NORMAL synchronous keeps seals cheap; every public
//! operation serializes through one connection guarded by a mutex, matching
//! the one-writer-per-store rule.

use super::{
    ActionKind, Distillation, DistillationKind, Episode, EpisodeOutcome, EpisodePhase, Step,
    StepEvaluation,
};
use crate::bus::{BusEvent, EventBus};
use crate::config::EidosConfig;
use crate::errors::{KaitError, Result, StoreError};
use crate::events::{Event, EventKind};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::path::Path;

const SCHEMA_VERSION: i64 = 1;

pub struct EidosStore {
    conn: Mutex<Connection>,
    config: EidosConfig,
    bus: Option<EventBus>,
}

impl EidosStore {
    pub fn open(path: &Path, config: EidosConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Database)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(StoreError::Database)?;

        let found: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(StoreError::Database)?;
        if found > SCHEMA_VERSION {
            return Err(KaitError::Store(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            }));
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                episode_id   TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL,
                goal         TEXT NOT NULL,
                phase        TEXT NOT NULL,
                outcome      TEXT NOT NULL,
                started_ns   INTEGER NOT NULL,
                ended_ns     INTEGER,
                step_count   INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_session
                ON episodes(session_id, outcome);

            CREATE TABLE IF NOT EXISTS steps (
                step_id      TEXT PRIMARY KEY,
                episode_id   TEXT NOT NULL REFERENCES episodes(episode_id),
                session_id   TEXT NOT NULL,
                decision     TEXT NOT NULL,
                action_kind  TEXT NOT NULL,
                prediction   TEXT NOT NULL,
                outcome      TEXT,
                evaluation   TEXT NOT NULL,
                tool         TEXT,
                opened_ns    INTEGER NOT NULL,
                sealed_ns    INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_steps_session_eval
                ON steps(session_id, evaluation);
            CREATE INDEX IF NOT EXISTS idx_steps_episode
                ON steps(episode_id);

            CREATE TABLE IF NOT EXISTS distillations (
                distillation_id    INTEGER PRIMARY KEY AUTOINCREMENT,
                kind               TEXT NOT NULL,
                statement          TEXT NOT NULL UNIQUE,
                confidence         REAL NOT NULL,
                validation_count   INTEGER NOT NULL DEFAULT 0,
                contradiction_count INTEGER NOT NULL DEFAULT 0,
                times_retrieved    INTEGER NOT NULL DEFAULT 0,
                times_used         INTEGER NOT NULL DEFAULT 0,
                times_helped       INTEGER NOT NULL DEFAULT 0,
                source_step_ids    TEXT NOT NULL,
                domains            TEXT NOT NULL,
                triggers           TEXT NOT NULL,
                created_at_ns      INTEGER NOT NULL,
                last_reinforced_ns INTEGER NOT NULL
            );",
        )
        .map_err(StoreError::Database)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(StoreError::Database)?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            bus: None,
        })
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Apply one event to the episode/step state machines.
    pub fn observe(&self, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::UserPrompt => {
                self.seal_stale_step(&event.session_id, event.ts_ns)?;
                let goal = event
                    .text
                    .as_deref()
                    .unwrap_or("untitled session")
                    .chars()
                    .take(200)
                    .collect::<String>();
                self.ensure_episode(&event.session_id, &goal, event.ts_ns)?;
            }
            EventKind::PreTool => {
                let episode_id = self.ensure_episode(
                    &event.session_id,
                    &format!("session {}", event.session_id),
                    event.ts_ns,
                )?;
                // At most one open step per session: any leftover open step
                // is abandoned before a new one starts.
                self.force_seal_open(&event.session_id, "superseded", event.ts_ns)?;
                self.open_new_step(&episode_id, event)?;
            }
            EventKind::PostTool => {
                self.seal_matching_step(event, StepEvaluation::Passed)?;
            }
            EventKind::PostToolFailure => {
                self.seal_matching_step(event, StepEvaluation::Failed)?;
            }
        }
        Ok(())
    }

    fn ensure_episode(&self, session_id: &str, goal: &str, ts_ns: i64) -> Result<String> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT episode_id FROM episodes
                 WHERE session_id = ?1 AND outcome = 'active' LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .ok();
        if let Some(id) = existing {
            return Ok(id);
        }
        let episode_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO episodes (episode_id, session_id, goal, phase, outcome, started_ns)
             VALUES (?1, ?2, ?3, 'explore', 'active', ?4)",
            params![episode_id, session_id, goal, ts_ns],
        )
        .map_err(StoreError::Database)?;
        Ok(episode_id)
    }

    fn open_new_step(&self, episode_id: &str, event: &Event) -> Result<()> {
        let tool = event.tool.as_deref().unwrap_or("unknown");
        let arg_head = arg_head(event);
        let decision = if arg_head.is_empty() {
            format!("call {}", tool)
        } else {
            format!("call {} on {}", tool, arg_head)
        };
        let prediction = format!("{} completes without error", tool);
        let step_id = uuid::Uuid::new_v4().to_string();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO steps (step_id, episode_id, session_id, decision, action_kind,
                                prediction, evaluation, tool, opened_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '?', ?7, ?8)",
            params![
                step_id,
                episode_id,
                event.session_id,
                decision,
                ActionKind::ToolCall.as_str(),
                prediction,
                tool,
                event.ts_ns
            ],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }

    fn seal_matching_step(&self, event: &Event, evaluation: StepEvaluation) -> Result<()> {
        let outcome_text = match evaluation {
            StepEvaluation::Passed => "success",
            StepEvaluation::Failed => "failure",
            StepEvaluation::Open => return Ok(()),
        };
        let sealed = {
            let conn = self.conn.lock();
            let open: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT step_id, episode_id, tool FROM steps
                     WHERE session_id = ?1 AND evaluation = '?' LIMIT 1",
                    params![event.session_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .ok();
            let Some((step_id, episode_id, step_tool)) = open else {
                return Ok(());
            };
            // Only the matching tool's observation seals the step; a
            // different tool means the outcome belongs elsewhere.
            if let (Some(step_tool), Some(event_tool)) = (&step_tool, &event.tool) {
                if step_tool != event_tool {
                    return Ok(());
                }
            }
            let detail = event
                .text
                .clone()
                .unwrap_or_else(|| outcome_text.to_string());
            conn.execute(
                "UPDATE steps SET evaluation = ?1, outcome = ?2, sealed_ns = ?3
                 WHERE step_id = ?4",
                params![evaluation.as_str(), detail, event.ts_ns, step_id],
            )
            .map_err(StoreError::Database)?;
            conn.execute(
                "UPDATE episodes SET step_count = step_count + 1, phase = 'execute'
                 WHERE episode_id = ?1",
                params![episode_id],
            )
            .map_err(StoreError::Database)?;
            (event.session_id.clone(), step_id)
        };

        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::StepSealed {
                session_id: sealed.0,
                step_id: sealed.1,
                outcome: outcome_text.to_string(),
            });
        }
        Ok(())
    }

    /// Abandon any open step older than the step timeout.
    fn seal_stale_step(&self, session_id: &str, now_ns: i64) -> Result<()> {
        let cutoff = now_ns - (self.config.step_timeout_s as i64) * 1_000_000_000;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE steps SET evaluation = 'failed', outcome = 'abandoned', sealed_ns = ?1
             WHERE session_id = ?2 AND evaluation = '?' AND opened_ns < ?3",
            params![now_ns, session_id, cutoff],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }

    fn force_seal_open(&self, session_id: &str, reason: &str, now_ns: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE steps SET evaluation = 'failed', outcome = ?1, sealed_ns = ?2
             WHERE session_id = ?3 AND evaluation = '?'",
            params![format!("abandoned: {}", reason), now_ns, session_id],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Shutdown path: every open step across all sessions is sealed as
    /// abandoned.
    pub fn seal_all_open(&self, now_ns: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let sealed = conn
            .execute(
                "UPDATE steps SET evaluation = 'failed', outcome = 'abandoned', sealed_ns = ?1
                 WHERE evaluation = '?'",
                params![now_ns],
            )
            .map_err(StoreError::Database)?;
        Ok(sealed)
    }

    /// Timeout sweep: abandon stale open steps and close idle episodes.
    /// Returns the ids of episodes closed by this pass, ready for the
    /// aggregator.
    pub fn age_out(&self, now_ns: i64) -> Result<Vec<String>> {
        let step_cutoff = now_ns - (self.config.step_timeout_s as i64) * 1_000_000_000;
        let session_cutoff = now_ns - (self.config.session_timeout_s as i64) * 1_000_000_000;

        let idle: Vec<String> = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE steps SET evaluation = 'failed', outcome = 'abandoned', sealed_ns = ?1
                 WHERE evaluation = '?' AND opened_ns < ?2",
                params![now_ns, step_cutoff],
            )
            .map_err(StoreError::Database)?;

            let mut stmt = conn
                .prepare(
                    "SELECT e.episode_id FROM episodes e
                     WHERE e.outcome = 'active'
                       AND COALESCE(
                             (SELECT MAX(COALESCE(s.sealed_ns, s.opened_ns))
                              FROM steps s WHERE s.episode_id = e.episode_id),
                             e.started_ns) < ?1",
                )
                .map_err(StoreError::Database)?;
            let ids = stmt
                .query_map(params![session_cutoff], |row| row.get(0))
                .map_err(StoreError::Database)?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        for episode_id in &idle {
            self.close_episode(episode_id, now_ns)?;
        }
        Ok(idle)
    }

    /// Close one episode: consolidate phase, outcome from the sealed-step
    /// majority, step_count recomputed from the sealed steps themselves.
    pub fn close_episode(&self, episode_id: &str, now_ns: i64) -> Result<()> {
        let conn = self.conn.lock();
        let (passed, failed): (i64, i64) = conn
            .query_row(
                "SELECT
                   COALESCE(SUM(CASE WHEN evaluation = 'passed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN evaluation = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM steps WHERE episode_id = ?1",
                params![episode_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StoreError::Database)?;

        let outcome = if passed == 0 && failed == 0 {
            EpisodeOutcome::Abandoned
        } else if passed >= failed {
            EpisodeOutcome::Success
        } else {
            EpisodeOutcome::Failure
        };

        conn.execute(
            "UPDATE episodes
             SET phase = 'consolidate', outcome = ?1, ended_ns = ?2, step_count = ?3
             WHERE episode_id = ?4",
            params![outcome.as_str(), now_ns, passed + failed, episode_id],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn active_episode(&self, session_id: &str) -> Option<Episode> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT episode_id, session_id, goal, phase, outcome, started_ns, ended_ns, step_count
             FROM episodes WHERE session_id = ?1 AND outcome = 'active' LIMIT 1",
            params![session_id],
            row_to_episode,
        )
        .ok()
    }

    pub fn episode(&self, episode_id: &str) -> Option<Episode> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT episode_id, session_id, goal, phase, outcome, started_ns, ended_ns, step_count
             FROM episodes WHERE episode_id = ?1",
            params![episode_id],
            row_to_episode,
        )
        .ok()
    }

    pub fn open_step(&self, session_id: &str) -> Option<Step> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT step_id, episode_id, session_id, decision, action_kind, prediction,
                    outcome, evaluation, tool, opened_ns, sealed_ns
             FROM steps WHERE session_id = ?1 AND evaluation = '?' LIMIT 1",
            params![session_id],
            row_to_step,
        )
        .ok()
    }

    pub fn open_step_count(&self, session_id: &str) -> i64 {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE session_id = ?1 AND evaluation = '?'",
            params![session_id],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    pub fn sealed_steps(&self, episode_id: &str) -> Vec<Step> {
        let conn = self.conn.lock();
        let Ok(mut stmt) = conn.prepare(
            "SELECT step_id, episode_id, session_id, decision, action_kind, prediction,
                    outcome, evaluation, tool, opened_ns, sealed_ns
             FROM steps WHERE episode_id = ?1 AND evaluation != '?'
             ORDER BY opened_ns",
        ) else {
            return Vec::new();
        };
        stmt.query_map(params![episode_id], row_to_step)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Insert a distillation or reinforce the existing one with the same
    /// statement.
    pub fn record_distillation(&self, distillation: &Distillation) -> Result<i64> {
        let created = {
            let conn = self.conn.lock();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT distillation_id FROM distillations WHERE statement = ?1",
                    params![distillation.statement],
                    |row| row.get(0),
                )
                .ok();
            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE distillations
                         SET validation_count = validation_count + ?1,
                             confidence = MAX(confidence, ?2),
                             last_reinforced_ns = ?3
                         WHERE distillation_id = ?4",
                        params![
                            distillation.validation_count.max(1),
                            distillation.confidence,
                            distillation.last_reinforced_ns,
                            id
                        ],
                    )
                    .map_err(StoreError::Database)?;
                    return Ok(id);
                }
                None => {
                    conn.execute(
                        "INSERT INTO distillations
                         (kind, statement, confidence, validation_count, contradiction_count,
                          times_retrieved, times_used, times_helped,
                          source_step_ids, domains, triggers, created_at_ns, last_reinforced_ns)
                         VALUES (?1, ?2, ?3, ?4, 0, 0, 0, 0, ?5, ?6, ?7, ?8, ?8)",
                        params![
                            distillation.kind.as_str(),
                            distillation.statement,
                            distillation.confidence,
                            distillation.validation_count,
                            serde_json::to_string(&distillation.source_step_ids)
                                .unwrap_or_else(|_| "[]".into()),
                            serde_json::to_string(&distillation.domains)
                                .unwrap_or_else(|_| "[]".into()),
                            serde_json::to_string(&distillation.triggers)
                                .unwrap_or_else(|_| "[]".into()),
                            distillation.created_at_ns,
                        ],
                    )
                    .map_err(StoreError::Database)?;
                    conn.last_insert_rowid()
                }
            }
        };

        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::DistillationCreated {
                distillation_id: created,
                kind: distillation.kind.as_str().to_string(),
            });
        }
        Ok(created)
    }

    pub fn distillations(&self) -> Vec<Distillation> {
        let conn = self.conn.lock();
        let Ok(mut stmt) = conn.prepare(
            "SELECT distillation_id, kind, statement, confidence, validation_count,
                    contradiction_count, times_retrieved, times_used, times_helped,
                    source_step_ids, domains, triggers, created_at_ns, last_reinforced_ns
             FROM distillations ORDER BY distillation_id",
        ) else {
            return Vec::new();
        };
        stmt.query_map([], row_to_distillation)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Distillations whose triggers overlap the query tokens, strongest
    /// first. Bumps `times_retrieved` on every hit.
    pub fn match_triggers(&self, tokens: &HashSet<String>, k: usize, now_ns: i64) -> Vec<Distillation> {
        let halflife = self.config.confidence_halflife_s;
        let mut hits: Vec<(f64, Distillation)> = self
            .distillations()
            .into_iter()
            .filter_map(|d| {
                let overlap = d
                    .triggers
                    .iter()
                    .filter(|t| tokens.contains(t.as_str()))
                    .count();
                if overlap == 0 {
                    return None;
                }
                let score = overlap as f64 * d.effective_confidence(now_ns, halflife);
                Some((score, d))
            })
            .collect();
        hits.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let selected: Vec<Distillation> = hits.into_iter().take(k).map(|(_, d)| d).collect();

        if !selected.is_empty() {
            let conn = self.conn.lock();
            for d in &selected {
                let _ = conn.execute(
                    "UPDATE distillations SET times_retrieved = times_retrieved + 1
                     WHERE distillation_id = ?1",
                    params![d.distillation_id],
                );
            }
        }
        selected
    }

    /// Record that emitted advice backed by this distillation was used, and
    /// whether it helped.
    pub fn record_usage(&self, distillation_id: i64, helped: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE distillations
             SET times_used = times_used + 1,
                 times_helped = times_helped + CASE WHEN ?1 THEN 1 ELSE 0 END,
                 validation_count = validation_count + CASE WHEN ?1 THEN 1 ELSE 0 END,
                 contradiction_count = contradiction_count + CASE WHEN ?1 THEN 0 ELSE 1 END
             WHERE distillation_id = ?2",
            params![helped, distillation_id],
        )
        .map_err(StoreError::Database)?;
        Ok(())
    }
}

fn arg_head(event: &Event) -> String {
    for key in ["command", "path", "file_path", "pattern", "url", "query"] {
        if let Some(value) = event.tool_args.get(key) {
            if let Some(s) = value.as_str() {
                return s.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
            }
        }
    }
    String::new()
}

fn row_to_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let phase: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    Ok(Episode {
        episode_id: row.get(0)?,
        session_id: row.get(1)?,
        goal: row.get(2)?,
        phase: EpisodePhase::parse(&phase).unwrap_or(EpisodePhase::Explore),
        outcome: EpisodeOutcome::parse(&outcome).unwrap_or(EpisodeOutcome::Active),
        started_ns: row.get(5)?,
        ended_ns: row.get(6)?,
        step_count: row.get(7)?,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<Step> {
    let action_kind: String = row.get(4)?;
    let evaluation: String = row.get(7)?;
    Ok(Step {
        step_id: row.get(0)?,
        episode_id: row.get(1)?,
        session_id: row.get(2)?,
        decision: row.get(3)?,
        action_kind: ActionKind::parse(&action_kind).unwrap_or(ActionKind::ToolCall),
        prediction: row.get(5)?,
        outcome: row.get(6)?,
        evaluation: StepEvaluation::parse(&evaluation).unwrap_or(StepEvaluation::Open),
        tool: row.get(8)?,
        opened_ns: row.get(9)?,
        sealed_ns: row.get(10)?,
    })
}

fn row_to_distillation(row: &Row<'_>) -> rusqlite::Result<Distillation> {
    let kind: String = row.get(1)?;
    let source_step_ids: String = row.get(9)?;
    let domains: String = row.get(10)?;
    let triggers: String = row.get(11)?;
    Ok(Distillation {
        distillation_id: row.get(0)?,
        kind: DistillationKind::parse(&kind).unwrap_or(DistillationKind::Heuristic),
        statement: row.get(2)?,
        confidence: row.get(3)?,
        validation_count: row.get(4)?,
        contradiction_count: row.get(5)?,
        times_retrieved: row.get(6)?,
        times_used: row.get(7)?,
        times_helped: row.get(8)?,
        source_step_ids: serde_json::from_str(&source_step_ids).unwrap_or_default(),
        domains: serde_json::from_str(&domains).unwrap_or_default(),
        triggers: serde_json::from_str(&triggers).unwrap_or_default(),
        created_at_ns: row.get(12)?,
        last_reinforced_ns: row.get(13)?,
    })
}
