#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use memory_gate_core::{
    belief_status_transition, contested_confidence, cosine_similarity, decayed_confidence,
    episode_strength, format_rfc3339, hash_text, parse_rfc3339_utc, reinforced_confidence, Belief,
    BeliefCandidate, BeliefId, BeliefNamespace, BeliefStatus, DimensionBreakdown, Episode,
    EpisodeId, EpisodeMeta, GovernanceRuleset, IdentityScreen, PolicyAction, RetrievedEpisode,
    RiskDecision, RiskScore, Task, TaskCommand, TaskEvent, TaskEventType, TaskId, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use time::OffsetDateTime;

const GATE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_GATE_V1: &str = r"
CREATE TABLE IF NOT EXISTS governance_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episodes (
  episode_id TEXT PRIMARY KEY,
  ts TEXT NOT NULL,
  user_text TEXT NOT NULL,
  final_text TEXT NOT NULL,
  embedding BLOB NOT NULL,
  meta_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS semantic_beliefs (
  belief_id TEXT PRIMARY KEY,
  namespace TEXT NOT NULL CHECK (
    namespace IN ('pref.format', 'pref.tone', 'project.context', 'project.stack', 'constraint')
  ),
  key TEXT NOT NULL UNIQUE,
  value_json TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  status TEXT NOT NULL CHECK (status IN ('active', 'contested', 'stale', 'deprecated')),
  reinforcement_count INTEGER NOT NULL DEFAULT 0,
  negative_signal_count INTEGER NOT NULL DEFAULT 0,
  created_ts TEXT NOT NULL,
  updated_ts TEXT NOT NULL,
  last_reinforced_ts TEXT
);

CREATE TABLE IF NOT EXISTS belief_evidence (
  belief_id TEXT NOT NULL,
  episode_id TEXT NOT NULL,
  signal REAL NOT NULL,
  ts TEXT NOT NULL,
  PRIMARY KEY (belief_id, episode_id),
  FOREIGN KEY (belief_id) REFERENCES semantic_beliefs(belief_id)
);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open', 'in_progress', 'blocked', 'done', 'archived')),
  priority INTEGER NOT NULL DEFAULT 1,
  created_ts TEXT NOT NULL,
  updated_ts TEXT NOT NULL
);

-- task_id is a soft reference: reset/delete events legitimately outlive
-- their task, and orphan detection is handled by the integrity check.
CREATE TABLE IF NOT EXISTS task_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT,
  ts TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('create', 'update', 'delete', 'reset')),
  before_json TEXT,
  after_json TEXT,
  rationale TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_task_events_no_update
BEFORE UPDATE ON task_events
BEGIN
  SELECT RAISE(FAIL, 'task_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_task_events_no_delete
BEFORE DELETE ON task_events
BEGIN
  SELECT RAISE(FAIL, 'task_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_task_events_task_seq
  ON task_events(task_id, event_seq);

CREATE TABLE IF NOT EXISTS risk_decisions (
  decision_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  episode_id TEXT NOT NULL UNIQUE,
  ts TEXT NOT NULL,
  draft_total INTEGER NOT NULL CHECK (draft_total BETWEEN 0 AND 10),
  draft_breakdown_json TEXT NOT NULL,
  draft_triggers_json TEXT NOT NULL,
  final_total INTEGER NOT NULL CHECK (final_total BETWEEN 0 AND 10),
  final_breakdown_json TEXT NOT NULL,
  final_triggers_json TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('none', 'soft_rewrite', 'hard_rewrite', 'block')),
  degraded INTEGER NOT NULL DEFAULT 0 CHECK (degraded IN (0, 1)),
  draft_hash TEXT NOT NULL,
  final_hash TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_risk_decisions_no_update
BEFORE UPDATE ON risk_decisions
BEGIN
  SELECT RAISE(FAIL, 'risk_decisions is immutable');
END;

CREATE INDEX IF NOT EXISTS idx_semantic_beliefs_status
  ON semantic_beliefs(status, confidence DESC);
";

pub struct SqliteMemoryStore {
    conn: Connection,
    screen: IdentityScreen,
}

/// Everything one resolved turn persists, committed atomically: the
/// episode, its risk decision, and any explicit belief/task mutations.
#[derive(Debug)]
pub struct TurnWriteback<'a> {
    pub user_text: &'a str,
    pub draft_text: &'a str,
    pub final_text: &'a str,
    pub embedding: &'a [f32],
    pub draft_score: &'a RiskScore,
    pub final_score: &'a RiskScore,
    pub action: PolicyAction,
    pub degraded: bool,
    pub belief_candidates: &'a [BeliefCandidate],
    pub task_command: Option<&'a TaskCommand>,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct TurnCommit {
    pub episode_id: EpisodeId,
    pub decision_seq: i64,
    pub belief_outcomes: Vec<BeliefWriteOutcome>,
    pub task_outcome: Option<TaskWriteOutcome>,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BeliefWriteOutcome {
    Created { key: String, confidence: f32 },
    Reinforced { key: String, confidence: f32 },
    AlreadyEvidenced { key: String },
    Contested { key: String, confidence: f32 },
    Skipped { key: String, reason: String },
    Rejected { key: String, reason: String },
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskWriteOutcome {
    Created { task: Task },
    Rejected { title: String, reason: String },
}

#[derive(Debug, Clone, Copy, serde::Serialize, PartialEq, Eq)]
pub struct DecayReport {
    pub examined: usize,
    pub marked_stale: usize,
    pub deprecated: usize,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct DecisionTrace {
    pub episode_id: EpisodeId,
    pub timestamp: OffsetDateTime,
    pub user_text: String,
    pub final_text: String,
    pub decision: RiskDecision,
}

#[derive(Debug, Clone, Copy, serde::Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub issues: Vec<IntegrityIssue>,
}

impl SqliteMemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let screen = IdentityScreen::new().map_err(|err| anyhow!(err.to_string()))?;
        Ok(Self { conn, screen })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_GATE_V1)
            .context("failed to apply memory gate schema")?;

        let now = format_rfc3339(memory_gate_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![GATE_MIGRATION_VERSION, now],
            )
            .context("failed to register schema migration")?;

        self.upsert_ruleset(&GovernanceRuleset::v1())?;
        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &GovernanceRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_rfc3339(memory_gate_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO governance_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        Ok(())
    }

    /// Loads the highest-versioned persisted ruleset.
    pub fn latest_ruleset(&self) -> Result<GovernanceRuleset> {
        let json: String = self
            .conn
            .query_row(
                "SELECT ruleset_json FROM governance_rulesets
                 ORDER BY ruleset_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query rulesets")?
            .ok_or_else(|| anyhow!("no governance ruleset present; run migrate first"))?;

        let value: Value = serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
        GovernanceRuleset::from_json(&value).map_err(|err| anyhow!(err.to_string()))
    }

    // ------------------------------------------------------------------
    // Turn writeback
    // ------------------------------------------------------------------

    /// Persists one resolved turn atomically. Every table mutation the
    /// turn produces commits together or not at all, so an audited
    /// decision can never exist without its episode (or vice versa) and a
    /// cancelled turn leaves no partial belief or task state.
    pub fn commit_turn(
        &mut self,
        writeback: &TurnWriteback<'_>,
        now: OffsetDateTime,
        ruleset: &GovernanceRuleset,
    ) -> Result<TurnCommit> {
        if writeback.action != PolicyAction::None && writeback.final_text == writeback.draft_text {
            return Err(anyhow!(
                "final text MUST NOT be the rejected draft when action is {}",
                writeback.action
            ));
        }

        let screen = &self.screen;
        let tx = self
            .conn
            .transaction()
            .context("failed to start turn transaction")?;

        let episode_id = EpisodeId::new();
        let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let meta = EpisodeMeta::default();

        tx.execute(
            "INSERT INTO episodes(episode_id, ts, user_text, final_text, embedding, meta_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                episode_id.to_string(),
                ts,
                writeback.user_text,
                writeback.final_text,
                embedding_to_blob(writeback.embedding),
                serde_json::to_string(&meta).context("failed to serialize episode meta")?,
            ],
        )
        .context("failed to insert episode")?;

        tx.execute(
            "INSERT INTO risk_decisions(
                episode_id, ts,
                draft_total, draft_breakdown_json, draft_triggers_json,
                final_total, final_breakdown_json, final_triggers_json,
                action, degraded, draft_hash, final_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                episode_id.to_string(),
                ts,
                i64::from(writeback.draft_score.total),
                serde_json::to_string(&writeback.draft_score.breakdown)
                    .context("failed to serialize draft breakdown")?,
                serde_json::to_string(&writeback.draft_score.triggers)
                    .context("failed to serialize draft triggers")?,
                i64::from(writeback.final_score.total),
                serde_json::to_string(&writeback.final_score.breakdown)
                    .context("failed to serialize final breakdown")?,
                serde_json::to_string(&writeback.final_score.triggers)
                    .context("failed to serialize final triggers")?,
                writeback.action.as_str(),
                i32::from(writeback.degraded),
                hash_text(writeback.draft_text),
                hash_text(writeback.final_text),
            ],
        )
        .context("failed to insert risk decision")?;
        let decision_seq = tx.last_insert_rowid();

        let mut belief_outcomes = Vec::with_capacity(writeback.belief_candidates.len());
        for candidate in writeback.belief_candidates {
            belief_outcomes.push(apply_belief_candidate_conn(
                &tx, screen, candidate, episode_id, now, ruleset,
            )?);
        }

        let task_outcome = match writeback.task_command {
            Some(TaskCommand::Create { title }) => Some(create_task_conn(
                &tx,
                screen,
                title,
                "explicit user task creation",
                now,
            )?),
            None => None,
        };

        tx.commit().context("failed to commit turn transaction")?;

        Ok(TurnCommit {
            episode_id,
            decision_seq,
            belief_outcomes,
            task_outcome,
        })
    }

    // ------------------------------------------------------------------
    // Episodic store
    // ------------------------------------------------------------------

    /// Retrieves the `k` most relevant episodes for a query embedding,
    /// ranking by cosine similarity weighted with decay-adjusted strength,
    /// and bumps the access counters of everything returned in the same
    /// transaction.
    pub fn retrieve(
        &mut self,
        query_embedding: &[f32],
        k: usize,
        now: OffsetDateTime,
        ruleset: &GovernanceRuleset,
    ) -> Result<Vec<RetrievedEpisode>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start retrieval transaction")?;

        let episodes = load_episodes_conn(&tx, None)?;
        let mut scored: Vec<RetrievedEpisode> = episodes
            .into_iter()
            .map(|episode| {
                let similarity = cosine_similarity(query_embedding, &episode.embedding);
                let strength = episode_strength(&episode.meta, episode.timestamp, now, ruleset);
                RetrievedEpisode {
                    similarity,
                    strength,
                    relevance: similarity * strength,
                    episode,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        for retrieved in &mut scored {
            let meta = &mut retrieved.episode.meta;
            meta.access_count = meta.access_count.saturating_add(1);
            meta.last_access_ts = Some(now);
            tx.execute(
                "UPDATE episodes SET meta_json = ?1 WHERE episode_id = ?2",
                params![
                    serde_json::to_string(meta).context("failed to serialize episode meta")?,
                    retrieved.episode.id.to_string(),
                ],
            )
            .context("failed to bump episode access")?;
        }

        tx.commit().context("failed to commit retrieval")?;
        Ok(scored)
    }

    pub fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        let mut stmt = self.conn.prepare(
            "SELECT episode_id, ts, user_text, final_text, embedding, meta_json
             FROM episodes WHERE episode_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id.to_string()], parse_episode_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read episode")?)),
            None => Ok(None),
        }
    }

    pub fn list_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        let mut stmt = self.conn.prepare(
            "SELECT episode_id, ts, user_text, final_text, embedding, meta_json
             FROM episodes ORDER BY ts DESC, episode_id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], parse_episode_row)?;
        collect_rows(rows)
    }

    pub fn count_episodes(&self) -> Result<usize> {
        count_rows(&self.conn, "episodes")
    }

    /// Deletes one episode and cascades to its risk decision. Explicit
    /// user command only.
    pub fn delete_episode(&mut self, id: EpisodeId) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;
        tx.execute(
            "DELETE FROM risk_decisions WHERE episode_id = ?1",
            params![id.to_string()],
        )
        .context("failed to delete risk decisions for episode")?;
        let deleted = tx
            .execute(
                "DELETE FROM episodes WHERE episode_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete episode")?;
        tx.commit().context("failed to commit episode delete")?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Semantic belief store
    // ------------------------------------------------------------------

    /// Applies one belief candidate outside a turn (used by tests and the
    /// governance surface; the turn pipeline goes through `commit_turn`).
    pub fn apply_belief_candidate(
        &mut self,
        candidate: &BeliefCandidate,
        episode_id: EpisodeId,
        now: OffsetDateTime,
        ruleset: &GovernanceRuleset,
    ) -> Result<BeliefWriteOutcome> {
        let screen = &self.screen;
        let tx = self
            .conn
            .transaction()
            .context("failed to start belief transaction")?;
        let outcome = apply_belief_candidate_conn(&tx, screen, candidate, episode_id, now, ruleset)?;
        tx.commit().context("failed to commit belief write")?;
        Ok(outcome)
    }

    /// Lists beliefs with confidence decayed as of `as_of`; stored raw
    /// confidence is never rewritten by reads.
    pub fn list_beliefs(
        &self,
        limit: usize,
        include_deprecated: bool,
        as_of: OffsetDateTime,
        ruleset: &GovernanceRuleset,
    ) -> Result<Vec<Belief>> {
        let mut query = "SELECT belief_id, namespace, key, value_json, confidence, status,
                    reinforcement_count, negative_signal_count, created_ts, updated_ts,
                    last_reinforced_ts
             FROM semantic_beliefs"
            .to_string();
        if !include_deprecated {
            query.push_str(" WHERE status != 'deprecated'");
        }
        query.push_str(" ORDER BY confidence DESC, updated_ts DESC LIMIT ");
        query.push_str(&limit.to_string());

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_belief_row)?;
        let mut beliefs = collect_rows(rows)?;

        for belief in &mut beliefs {
            belief.evidence_episode_ids = self.belief_evidence(belief.id)?;
            let reference = belief.last_reinforced_ts.unwrap_or(belief.created_ts);
            let age_days = memory_gate_core::days_since(reference, as_of);
            belief.confidence = decayed_confidence(belief.confidence, age_days, ruleset);
        }

        Ok(beliefs)
    }

    /// Fetches one belief by key with its stored (undecayed) confidence.
    pub fn get_belief(&self, key: &str) -> Result<Option<Belief>> {
        let mut stmt = self.conn.prepare(
            "SELECT belief_id, namespace, key, value_json, confidence, status,
                    reinforcement_count, negative_signal_count, created_ts, updated_ts,
                    last_reinforced_ts
             FROM semantic_beliefs WHERE key = ?1",
        )?;
        let mut rows = stmt.query_map(params![key], parse_belief_row)?;
        match rows.next() {
            Some(row) => {
                let mut belief = row.context("failed to read belief")?;
                belief.evidence_episode_ids = self.belief_evidence(belief.id)?;
                Ok(Some(belief))
            }
            None => Ok(None),
        }
    }

    pub fn count_beliefs(&self) -> Result<usize> {
        count_rows(&self.conn, "semantic_beliefs")
    }

    /// Status-only decay pass: confidence stays a pure function of the
    /// stored value and elapsed time, while aged beliefs are marked stale
    /// or deprecated.
    pub fn run_belief_decay(
        &mut self,
        now: OffsetDateTime,
        ruleset: &GovernanceRuleset,
    ) -> Result<DecayReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start decay transaction")?;

        let beliefs = {
            let mut stmt = tx.prepare(
                "SELECT belief_id, namespace, key, value_json, confidence, status,
                        reinforcement_count, negative_signal_count, created_ts, updated_ts,
                        last_reinforced_ts
                 FROM semantic_beliefs WHERE status != 'deprecated'",
            )?;
            let rows = stmt.query_map([], parse_belief_row)?;
            collect_rows(rows)?
        };

        let mut report = DecayReport {
            examined: beliefs.len(),
            marked_stale: 0,
            deprecated: 0,
        };
        let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        for belief in beliefs {
            let reference = belief.last_reinforced_ts.unwrap_or(belief.created_ts);
            let age_days = memory_gate_core::days_since(reference, now);
            let effective = decayed_confidence(belief.confidence, age_days, ruleset);
            let contested_age = memory_gate_core::days_since(belief.updated_ts, now);

            let next_status = if effective < ruleset.belief_deprecate_confidence {
                BeliefStatus::Deprecated
            } else if belief.status == BeliefStatus::Contested
                && contested_age >= ruleset.belief_contested_grace_days
            {
                BeliefStatus::Deprecated
            } else if belief.status == BeliefStatus::Active
                && age_days >= ruleset.belief_stale_days
            {
                BeliefStatus::Stale
            } else {
                belief.status
            };

            if next_status != belief.status {
                tx.execute(
                    "UPDATE semantic_beliefs SET status = ?1, updated_ts = ?2 WHERE belief_id = ?3",
                    params![next_status.as_str(), ts, belief.id.to_string()],
                )
                .context("failed to update belief status")?;
                match next_status {
                    BeliefStatus::Stale => report.marked_stale += 1,
                    BeliefStatus::Deprecated => report.deprecated += 1,
                    BeliefStatus::Active | BeliefStatus::Contested => {}
                }
            }
        }

        tx.commit().context("failed to commit decay pass")?;
        Ok(report)
    }

    /// Explicit user deletion path: marks the belief deprecated and floors
    /// its confidence.
    pub fn deprecate_belief(&self, key: &str, ruleset: &GovernanceRuleset) -> Result<bool> {
        let ts = format_rfc3339(memory_gate_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        let updated = self
            .conn
            .execute(
                "UPDATE semantic_beliefs
                 SET status = 'deprecated', confidence = ?1, updated_ts = ?2
                 WHERE key = ?3",
                params![f64::from(ruleset.belief_confidence_floor), ts, key],
            )
            .context("failed to deprecate belief")?;
        Ok(updated > 0)
    }

    /// Deletes beliefs whose key contains the pattern. Governance surface.
    pub fn delete_beliefs_matching(&mut self, pattern: &str) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start belief delete transaction")?;
        tx.execute(
            "DELETE FROM belief_evidence WHERE belief_id IN (
                SELECT belief_id FROM semantic_beliefs WHERE key LIKE '%' || ?1 || '%'
             )",
            params![pattern],
        )
        .context("failed to delete belief evidence")?;
        let deleted = tx
            .execute(
                "DELETE FROM semantic_beliefs WHERE key LIKE '%' || ?1 || '%'",
                params![pattern],
            )
            .context("failed to delete beliefs")?;
        tx.commit().context("failed to commit belief delete")?;
        Ok(deleted)
    }

    fn belief_evidence(&self, belief_id: BeliefId) -> Result<Vec<EpisodeId>> {
        let mut stmt = self.conn.prepare(
            "SELECT episode_id FROM belief_evidence WHERE belief_id = ?1 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![belief_id.to_string()], |row| {
            let raw: String = row.get(0)?;
            EpisodeId::parse(&raw).map_err(|err| invalid_data(0, err.to_string()))
        })?;
        collect_rows(rows)
    }

    // ------------------------------------------------------------------
    // Task board
    // ------------------------------------------------------------------

    pub fn create_task(
        &mut self,
        title: &str,
        rationale: &str,
        now: OffsetDateTime,
    ) -> Result<TaskWriteOutcome> {
        let screen = &self.screen;
        let tx = self
            .conn
            .transaction()
            .context("failed to start task transaction")?;
        let outcome = create_task_conn(&tx, screen, title, rationale, now)?;
        tx.commit().context("failed to commit task creation")?;
        Ok(outcome)
    }

    pub fn set_task_status(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        rationale: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start task transaction")?;

        let Some(before) = get_task_conn(&tx, task_id)? else {
            return Ok(false);
        };

        let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        tx.execute(
            "UPDATE tasks SET status = ?1, updated_ts = ?2 WHERE task_id = ?3",
            params![status.as_str(), ts, task_id.to_string()],
        )
        .context("failed to update task status")?;

        let after = get_task_conn(&tx, task_id)?
            .ok_or_else(|| anyhow!("task vanished during status update"))?;

        append_task_event_conn(
            &tx,
            Some(task_id),
            TaskEventType::Update,
            Some(task_to_json(&before)?),
            Some(task_to_json(&after)?),
            rationale,
            now,
        )?;

        tx.commit().context("failed to commit task update")?;
        Ok(true)
    }

    pub fn delete_task(
        &mut self,
        task_id: TaskId,
        rationale: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start task transaction")?;

        let Some(before) = get_task_conn(&tx, task_id)? else {
            return Ok(false);
        };

        append_task_event_conn(
            &tx,
            Some(task_id),
            TaskEventType::Delete,
            Some(task_to_json(&before)?),
            None,
            rationale,
            now,
        )?;
        tx.execute(
            "DELETE FROM tasks WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .context("failed to delete task")?;

        tx.commit().context("failed to commit task delete")?;
        Ok(true)
    }

    /// Clears the board immediately and idempotently: one reset event per
    /// cleared task, and a single board-level marker when there was
    /// nothing left to clear.
    pub fn reset_all(&mut self, rationale: &str, now: OffsetDateTime) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reset transaction")?;

        let tasks = list_tasks_conn(&tx, true)?;
        for task in &tasks {
            append_task_event_conn(
                &tx,
                Some(task.task_id),
                TaskEventType::Reset,
                Some(task_to_json(task)?),
                None,
                rationale,
                now,
            )?;
            tx.execute(
                "DELETE FROM tasks WHERE task_id = ?1",
                params![task.task_id.to_string()],
            )
            .context("failed to delete task during reset")?;
        }

        if tasks.is_empty() {
            append_task_event_conn(&tx, None, TaskEventType::Reset, None, None, rationale, now)?;
        }

        tx.commit().context("failed to commit reset")?;
        Ok(tasks.len())
    }

    pub fn list_tasks(&self, include_archived: bool) -> Result<Vec<Task>> {
        list_tasks_conn(&self.conn, include_archived)
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        get_task_conn(&self.conn, task_id)
    }

    pub fn count_tasks(&self) -> Result<usize> {
        count_rows(&self.conn, "tasks")
    }

    /// Full audit history for one task.
    pub fn task_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, task_id, ts, event_type, before_json, after_json, rationale
             FROM task_events WHERE task_id = ?1 ORDER BY event_seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], parse_task_event_row)?;
        collect_rows(rows)
    }

    pub fn list_task_events(&self, limit: usize) -> Result<Vec<TaskEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, task_id, ts, event_type, before_json, after_json, rationale
             FROM task_events ORDER BY event_seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], parse_task_event_row)?;
        collect_rows(rows)
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub fn list_decisions(&self, limit: usize) -> Result<Vec<RiskDecision>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_seq, episode_id, ts, draft_total, draft_breakdown_json,
                    draft_triggers_json, final_total, final_breakdown_json,
                    final_triggers_json, action, degraded, draft_hash, final_hash
             FROM risk_decisions ORDER BY decision_seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], parse_decision_row)?;
        collect_rows(rows)
    }

    pub fn decision_for_episode(&self, episode_id: EpisodeId) -> Result<Option<RiskDecision>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_seq, episode_id, ts, draft_total, draft_breakdown_json,
                    draft_triggers_json, final_total, final_breakdown_json,
                    final_triggers_json, action, degraded, draft_hash, final_hash
             FROM risk_decisions WHERE episode_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![episode_id.to_string()], parse_decision_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read risk decision")?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Governance surface
    // ------------------------------------------------------------------

    /// Full memory snapshot: episodes, beliefs, and tasks. Raw embeddings
    /// are never exported.
    pub fn export_snapshot(&self, now: OffsetDateTime) -> Result<Value> {
        let episodes = self.list_episodes(50)?;
        let beliefs = self.list_beliefs(50, true, now, &self.latest_ruleset()?)?;
        let tasks = self.list_tasks(true)?;

        let exported_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let episodes_json: Vec<Value> = episodes
            .iter()
            .map(|episode| {
                Ok(json!({
                    "id": episode.id.to_string(),
                    "ts": format_rfc3339(episode.timestamp)
                        .map_err(|err| anyhow!(err.to_string()))?,
                    "user": truncate_chars(&episode.user_text, 120),
                    "final": truncate_chars(&episode.final_text, 120),
                    "access_count": episode.meta.access_count,
                }))
            })
            .collect::<Result<_>>()?;
        let beliefs_json: Vec<Value> = beliefs
            .iter()
            .map(|belief| {
                json!({
                    "key": belief.key,
                    "namespace": belief.namespace.as_str(),
                    "value": belief.value,
                    "confidence": belief.confidence,
                    "status": belief.status.as_str(),
                })
            })
            .collect();
        let tasks_json: Vec<Value> = tasks
            .iter()
            .map(|task| {
                json!({
                    "id": task.task_id.to_string(),
                    "title": task.title,
                    "status": task.status.as_str(),
                    "priority": task.priority,
                })
            })
            .collect();

        Ok(json!({
            "exported_at": exported_at,
            "episodes": episodes_json,
            "beliefs": beliefs_json,
            "tasks": tasks_json,
        }))
    }

    /// Traces one episode's gating decision: both score breakdowns, the
    /// triggers, and the resolved action.
    pub fn trace_decision(&self, episode_id: EpisodeId) -> Result<Option<DecisionTrace>> {
        let Some(episode) = self.get_episode(episode_id)? else {
            return Ok(None);
        };
        let decision = self.decision_for_episode(episode_id)?.ok_or_else(|| {
            anyhow!("episode {episode_id} has no risk decision; integrity violation")
        })?;
        Ok(Some(DecisionTrace {
            episode_id,
            timestamp: episode.timestamp,
            user_text: episode.user_text,
            final_text: episode.final_text,
            decision,
        }))
    }

    /// Scans for referential integrity violations between the audit
    /// tables and their parents.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut issues = Vec::new();

        let orphan_decisions: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM risk_decisions d
             LEFT JOIN episodes e ON e.episode_id = d.episode_id
             WHERE e.episode_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        if orphan_decisions > 0 {
            issues.push(IntegrityIssue {
                code: "orphan_risk_decisions".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("{orphan_decisions} risk decisions without a parent episode"),
            });
        }

        let unaudited_episodes: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM episodes e
             LEFT JOIN risk_decisions d ON d.episode_id = e.episode_id
             WHERE d.episode_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        if unaudited_episodes > 0 {
            issues.push(IntegrityIssue {
                code: "unaudited_episodes".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("{unaudited_episodes} episodes without a risk decision"),
            });
        }

        let orphan_task_events: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM task_events ev
             WHERE ev.task_id IS NOT NULL
               AND ev.task_id NOT IN (SELECT task_id FROM tasks)
               AND ev.task_id NOT IN (
                 SELECT task_id FROM task_events
                 WHERE event_type IN ('delete', 'reset') AND task_id IS NOT NULL
               )",
            [],
            |row| row.get(0),
        )?;
        if orphan_task_events > 0 {
            issues.push(IntegrityIssue {
                code: "orphan_task_events".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!(
                    "{orphan_task_events} task events reference a missing task with no terminal event"
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IntegrityIssueSeverity::Error);
        Ok(IntegrityReport { healthy, issues })
    }
}

// ----------------------------------------------------------------------
// Connection-level helpers (shared between owned transactions and the
// turn transaction)
// ----------------------------------------------------------------------

fn apply_belief_candidate_conn(
    conn: &Connection,
    screen: &IdentityScreen,
    candidate: &BeliefCandidate,
    episode_id: EpisodeId,
    now: OffsetDateTime,
    ruleset: &GovernanceRuleset,
) -> Result<BeliefWriteOutcome> {
    let key = candidate.key.as_str();

    let Some(namespace) = BeliefNamespace::from_key(key) else {
        tracing::info!(key, "belief candidate rejected: namespace not in allow-list");
        return Ok(BeliefWriteOutcome::Rejected {
            key: key.to_string(),
            reason: "namespace_not_allowed".to_string(),
        });
    };
    if namespace != candidate.namespace {
        tracing::info!(key, "belief candidate rejected: namespace mismatch");
        return Ok(BeliefWriteOutcome::Rejected {
            key: key.to_string(),
            reason: "namespace_not_allowed".to_string(),
        });
    }

    let value_text =
        serde_json::to_string(&candidate.value).context("failed to serialize belief value")?;
    if screen.is_risky(key) || screen.is_risky(&value_text) {
        tracing::info!(key, "belief candidate rejected: identity or trait language");
        return Ok(BeliefWriteOutcome::Rejected {
            key: key.to_string(),
            reason: "identity_risk".to_string(),
        });
    }

    let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    let existing = conn
        .query_row(
            "SELECT belief_id, value_json, confidence, status,
                    reinforcement_count, negative_signal_count
             FROM semantic_beliefs WHERE key = ?1",
            params![key],
            |row| {
                let belief_id: String = row.get(0)?;
                let value_json: String = row.get(1)?;
                let confidence: f64 = row.get(2)?;
                let status: String = row.get(3)?;
                let reinforcement_count: i64 = row.get(4)?;
                let negative_signal_count: i64 = row.get(5)?;
                Ok((
                    belief_id,
                    value_json,
                    confidence,
                    status,
                    reinforcement_count,
                    negative_signal_count,
                ))
            },
        )
        .optional()
        .context("failed to query existing belief")?;

    let Some((belief_id_raw, value_json, confidence, status_raw, reinforcement_count, negative_count)) =
        existing
    else {
        if candidate.signal <= 0.0 {
            return Ok(BeliefWriteOutcome::Skipped {
                key: key.to_string(),
                reason: "negative signal without an existing belief".to_string(),
            });
        }
        let belief_id = BeliefId::new();
        let confidence = ruleset.belief_initial_confidence;
        conn.execute(
            "INSERT INTO semantic_beliefs(
                belief_id, namespace, key, value_json, confidence, status,
                reinforcement_count, negative_signal_count, created_ts, updated_ts,
                last_reinforced_ts
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', 1, 0, ?6, ?6, ?6)",
            params![
                belief_id.to_string(),
                candidate.namespace.as_str(),
                key,
                serde_json::to_string(&candidate.value)
                    .context("failed to serialize belief value")?,
                f64::from(confidence),
                ts,
            ],
        )
        .context("failed to insert belief")?;
        insert_evidence_conn(conn, &belief_id.to_string(), episode_id, candidate.signal, &ts)?;
        return Ok(BeliefWriteOutcome::Created {
            key: key.to_string(),
            confidence,
        });
    };

    #[allow(clippy::cast_possible_truncation)]
    let confidence = confidence as f32;
    let status = BeliefStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("invalid stored belief status '{status_raw}'"))?;
    let existing_value: Value =
        serde_json::from_str(&value_json).context("invalid stored belief value JSON")?;
    let negative_count = u32::try_from(negative_count).unwrap_or(u32::MAX);

    if existing_value != candidate.value {
        // A contradicting explicit statement contests the belief; the
        // stored value is never silently overwritten.
        let new_negative = negative_count.saturating_add(1);
        let new_confidence = contested_confidence(confidence, ruleset);
        let new_status = if new_confidence < ruleset.belief_deprecate_confidence
            || status == BeliefStatus::Deprecated
        {
            BeliefStatus::Deprecated
        } else {
            BeliefStatus::Contested
        };
        conn.execute(
            "UPDATE semantic_beliefs
             SET confidence = ?1, status = ?2, updated_ts = ?3, negative_signal_count = ?4
             WHERE belief_id = ?5",
            params![
                f64::from(new_confidence),
                new_status.as_str(),
                ts,
                i64::from(new_negative),
                belief_id_raw,
            ],
        )
        .context("failed to contest belief")?;
        insert_evidence_conn(conn, &belief_id_raw, episode_id, -0.5, &ts)?;
        return Ok(BeliefWriteOutcome::Contested {
            key: key.to_string(),
            confidence: new_confidence,
        });
    }

    let already_evidenced: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM belief_evidence WHERE belief_id = ?1 AND episode_id = ?2",
            params![belief_id_raw, episode_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query belief evidence")?;
    if already_evidenced.is_some() {
        // Reinforcement requires a second independent statement; the same
        // episode cannot vouch twice.
        return Ok(BeliefWriteOutcome::AlreadyEvidenced {
            key: key.to_string(),
        });
    }

    if candidate.signal <= 0.0 {
        return Ok(BeliefWriteOutcome::Skipped {
            key: key.to_string(),
            reason: "non-positive signal".to_string(),
        });
    }

    let new_confidence = reinforced_confidence(confidence, ruleset);
    let new_status = belief_status_transition(new_confidence, status, negative_count, ruleset);
    let new_reinforcement = reinforcement_count.saturating_add(1);
    conn.execute(
        "UPDATE semantic_beliefs
         SET confidence = ?1, status = ?2, updated_ts = ?3, last_reinforced_ts = ?3,
             reinforcement_count = ?4
         WHERE belief_id = ?5",
        params![
            f64::from(new_confidence),
            new_status.as_str(),
            ts,
            new_reinforcement,
            belief_id_raw,
        ],
    )
    .context("failed to reinforce belief")?;
    insert_evidence_conn(conn, &belief_id_raw, episode_id, candidate.signal, &ts)?;

    Ok(BeliefWriteOutcome::Reinforced {
        key: key.to_string(),
        confidence: new_confidence,
    })
}

fn insert_evidence_conn(
    conn: &Connection,
    belief_id: &str,
    episode_id: EpisodeId,
    signal: f32,
    ts: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO belief_evidence(belief_id, episode_id, signal, ts)
         VALUES (?1, ?2, ?3, ?4)",
        params![belief_id, episode_id.to_string(), f64::from(signal), ts],
    )
    .context("failed to insert belief evidence")?;
    Ok(())
}

fn create_task_conn(
    conn: &Connection,
    screen: &IdentityScreen,
    title: &str,
    rationale: &str,
    now: OffsetDateTime,
) -> Result<TaskWriteOutcome> {
    let title = title.trim();
    if title.is_empty() {
        return Ok(TaskWriteOutcome::Rejected {
            title: title.to_string(),
            reason: "empty_title".to_string(),
        });
    }
    if screen.is_risky(title) {
        tracing::info!(title, "task rejected: identity or trait language");
        return Ok(TaskWriteOutcome::Rejected {
            title: title.to_string(),
            reason: "identity_risk".to_string(),
        });
    }

    let task = Task {
        task_id: TaskId::new(),
        title: title.to_string(),
        status: TaskStatus::Open,
        priority: 1,
        created_ts: now,
        updated_ts: now,
    };
    let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO tasks(task_id, title, status, priority, created_ts, updated_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            task.task_id.to_string(),
            task.title,
            task.status.as_str(),
            task.priority,
            ts,
        ],
    )
    .context("failed to insert task")?;

    append_task_event_conn(
        conn,
        Some(task.task_id),
        TaskEventType::Create,
        None,
        Some(task_to_json(&task)?),
        rationale,
        now,
    )?;

    Ok(TaskWriteOutcome::Created { task })
}

fn append_task_event_conn(
    conn: &Connection,
    task_id: Option<TaskId>,
    event_type: TaskEventType,
    before: Option<Value>,
    after: Option<Value>,
    rationale: &str,
    now: OffsetDateTime,
) -> Result<i64> {
    let ts = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO task_events(task_id, ts, event_type, before_json, after_json, rationale)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            task_id.map(|id| id.to_string()),
            ts,
            event_type.as_str(),
            before
                .map(|value| serde_json::to_string(&value))
                .transpose()
                .context("failed to serialize before image")?,
            after
                .map(|value| serde_json::to_string(&value))
                .transpose()
                .context("failed to serialize after image")?,
            rationale,
        ],
    )
    .context("failed to append task event")?;
    Ok(conn.last_insert_rowid())
}

fn list_tasks_conn(conn: &Connection, include_archived: bool) -> Result<Vec<Task>> {
    let mut query = "SELECT task_id, title, status, priority, created_ts, updated_ts
         FROM tasks"
        .to_string();
    if !include_archived {
        query.push_str(" WHERE status != 'archived'");
    }
    query.push_str(" ORDER BY priority DESC, updated_ts DESC");

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], parse_task_row)?;
    collect_rows(rows)
}

fn get_task_conn(conn: &Connection, task_id: TaskId) -> Result<Option<Task>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, title, status, priority, created_ts, updated_ts
         FROM tasks WHERE task_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![task_id.to_string()], parse_task_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row.context("failed to read task")?)),
        None => Ok(None),
    }
}

fn load_episodes_conn(conn: &Connection, limit: Option<usize>) -> Result<Vec<Episode>> {
    let mut query = "SELECT episode_id, ts, user_text, final_text, embedding, meta_json
         FROM episodes ORDER BY ts ASC, episode_id ASC"
        .to_string();
    if let Some(raw_limit) = limit {
        query.push_str(" LIMIT ");
        query.push_str(&raw_limit.to_string());
    }
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], parse_episode_row)?;
    collect_rows(rows)
}

fn task_to_json(task: &Task) -> Result<Value> {
    serde_json::to_value(task).context("failed to serialize task image")
}

// ----------------------------------------------------------------------
// Row parsing
// ----------------------------------------------------------------------

fn parse_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let id_raw: String = row.get(0)?;
    let ts_raw: String = row.get(1)?;
    let user_text: String = row.get(2)?;
    let final_text: String = row.get(3)?;
    let blob: Vec<u8> = row.get(4)?;
    let meta_json: String = row.get(5)?;

    let id = EpisodeId::parse(&id_raw).map_err(|err| invalid_data(0, err.to_string()))?;
    let timestamp = parse_ts_column(1, &ts_raw)?;
    // Malformed metadata degrades to defaults; it never fails the read.
    let meta: EpisodeMeta = serde_json::from_str(&meta_json).unwrap_or_else(|err| {
        tracing::warn!(episode_id = %id, %err, "malformed episode metadata, using defaults");
        EpisodeMeta::default()
    });

    Ok(Episode {
        id,
        timestamp,
        user_text,
        final_text,
        embedding: embedding_from_blob(&blob),
        meta,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn parse_belief_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Belief> {
    let id_raw: String = row.get(0)?;
    let namespace_raw: String = row.get(1)?;
    let key: String = row.get(2)?;
    let value_json: String = row.get(3)?;
    let confidence: f64 = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let reinforcement_count: i64 = row.get(6)?;
    let negative_signal_count: i64 = row.get(7)?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;
    let reinforced_raw: Option<String> = row.get(10)?;

    let id = BeliefId::parse(&id_raw).map_err(|err| invalid_data(0, err.to_string()))?;
    let namespace = BeliefNamespace::parse(&namespace_raw)
        .ok_or_else(|| invalid_data(1, format!("invalid belief namespace '{namespace_raw}'")))?;
    let value: Value = serde_json::from_str(&value_json)
        .map_err(|err| invalid_data(3, format!("invalid belief value JSON: {err}")))?;
    let status = BeliefStatus::parse(&status_raw)
        .ok_or_else(|| invalid_data(5, format!("invalid belief status '{status_raw}'")))?;

    Ok(Belief {
        id,
        namespace,
        key,
        value,
        confidence: confidence as f32,
        status,
        reinforcement_count: u32::try_from(reinforcement_count).unwrap_or(u32::MAX),
        negative_signal_count: u32::try_from(negative_signal_count).unwrap_or(u32::MAX),
        evidence_episode_ids: Vec::new(),
        created_ts: parse_ts_column(8, &created_raw)?,
        updated_ts: parse_ts_column(9, &updated_raw)?,
        last_reinforced_ts: parse_optional_ts(10, reinforced_raw)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_raw: String = row.get(0)?;
    let title: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let priority: i64 = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;

    Ok(Task {
        task_id: TaskId::parse(&id_raw).map_err(|err| invalid_data(0, err.to_string()))?,
        title,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| invalid_data(2, format!("invalid task status '{status_raw}'")))?,
        priority,
        created_ts: parse_ts_column(4, &created_raw)?,
        updated_ts: parse_ts_column(5, &updated_raw)?,
    })
}

fn parse_task_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEvent> {
    let event_seq: i64 = row.get(0)?;
    let task_raw: Option<String> = row.get(1)?;
    let ts_raw: String = row.get(2)?;
    let type_raw: String = row.get(3)?;
    let before_raw: Option<String> = row.get(4)?;
    let after_raw: Option<String> = row.get(5)?;
    let rationale: String = row.get(6)?;

    let task_id = match task_raw {
        Some(raw) => {
            Some(TaskId::parse(&raw).map_err(|err| invalid_data(1, err.to_string()))?)
        }
        None => None,
    };
    let event_type = TaskEventType::parse(&type_raw)
        .ok_or_else(|| invalid_data(3, format!("invalid task event type '{type_raw}'")))?;

    Ok(TaskEvent {
        event_seq,
        task_id,
        timestamp: parse_ts_column(2, &ts_raw)?,
        event_type,
        before: parse_optional_json(4, before_raw)?,
        after: parse_optional_json(5, after_raw)?,
        rationale,
    })
}

fn parse_decision_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RiskDecision> {
    let decision_seq: i64 = row.get(0)?;
    let episode_raw: String = row.get(1)?;
    let ts_raw: String = row.get(2)?;
    let draft_total: i64 = row.get(3)?;
    let draft_breakdown_raw: String = row.get(4)?;
    let draft_triggers_raw: String = row.get(5)?;
    let final_total: i64 = row.get(6)?;
    let final_breakdown_raw: String = row.get(7)?;
    let final_triggers_raw: String = row.get(8)?;
    let action_raw: String = row.get(9)?;
    let degraded: i64 = row.get(10)?;
    let draft_hash: String = row.get(11)?;
    let final_hash: String = row.get(12)?;

    let episode_id =
        EpisodeId::parse(&episode_raw).map_err(|err| invalid_data(1, err.to_string()))?;
    let draft_breakdown: DimensionBreakdown = serde_json::from_str(&draft_breakdown_raw)
        .map_err(|err| invalid_data(4, format!("invalid draft breakdown JSON: {err}")))?;
    let draft_triggers: Vec<String> = serde_json::from_str(&draft_triggers_raw)
        .map_err(|err| invalid_data(5, format!("invalid draft triggers JSON: {err}")))?;
    let final_breakdown: DimensionBreakdown = serde_json::from_str(&final_breakdown_raw)
        .map_err(|err| invalid_data(7, format!("invalid final breakdown JSON: {err}")))?;
    let final_triggers: Vec<String> = serde_json::from_str(&final_triggers_raw)
        .map_err(|err| invalid_data(8, format!("invalid final triggers JSON: {err}")))?;
    let action = PolicyAction::parse(&action_raw)
        .ok_or_else(|| invalid_data(9, format!("invalid action '{action_raw}'")))?;

    Ok(RiskDecision {
        decision_seq,
        episode_id,
        draft_total: u8::try_from(draft_total).unwrap_or(u8::MAX),
        draft_breakdown,
        draft_triggers,
        final_total: u8::try_from(final_total).unwrap_or(u8::MAX),
        final_breakdown,
        final_triggers,
        action,
        degraded: degraded != 0,
        draft_hash,
        final_hash,
        timestamp: parse_ts_column(2, &ts_raw)?,
    })
}

fn parse_ts_column(index: usize, value: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(value).map_err(|err| invalid_data(index, err.to_string()))
}

fn parse_optional_ts(
    index: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    value
        .map(|raw| parse_ts_column(index, &raw))
        .transpose()
}

fn parse_optional_json(index: usize, value: Option<String>) -> rusqlite::Result<Option<Value>> {
    value
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|err| invalid_data(index, format!("invalid JSON payload: {err}")))
        })
        .transpose()
}

fn invalid_data(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn collect_rows<T, I>(rows: I) -> Result<Vec<T>>
where
    I: Iterator<Item = rusqlite::Result<T>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to read row")?);
    }
    Ok(out)
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).context("negative row count")
}

#[must_use]
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

#[must_use]
pub fn embedding_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn store() -> SqliteMemoryStore {
        let store = must_ok(SqliteMemoryStore::open_in_memory());
        must_ok(store.migrate());
        store
    }

    fn ruleset() -> GovernanceRuleset {
        GovernanceRuleset::v1()
    }

    fn utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn clean_writeback<'a>(user_text: &'a str, final_text: &'a str) -> TurnWriteback<'a> {
        static ZERO: std::sync::OnceLock<RiskScore> = std::sync::OnceLock::new();
        let zero = ZERO.get_or_init(RiskScore::zero);
        TurnWriteback {
            user_text,
            draft_text: final_text,
            final_text,
            embedding: &[1.0, 0.0, 0.0],
            draft_score: zero,
            final_score: zero,
            action: PolicyAction::None,
            degraded: false,
            belief_candidates: &[],
            task_command: None,
        }
    }

    fn commit_clean(store: &mut SqliteMemoryStore, user: &str, final_text: &str) -> EpisodeId {
        let writeback = clean_writeback(user, final_text);
        must_ok(store.commit_turn(&writeback, utc("2026-01-01T00:00:00Z"), &ruleset())).episode_id
    }

    fn format_candidate() -> BeliefCandidate {
        BeliefCandidate {
            namespace: BeliefNamespace::PrefFormat,
            key: "pref.format.verbosity".to_string(),
            value: Value::String("concise".to_string()),
            signal: 0.8,
            rationale: "user requested concise responses".to_string(),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = store();
        must_ok(store.migrate());
        assert!(store.latest_ruleset().is_ok());
    }

    #[test]
    fn commit_turn_writes_episode_and_decision_together() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi there");

        assert_eq!(must_ok(store.count_episodes()), 1);
        let decision = must_some(must_ok(store.decision_for_episode(episode_id)));
        assert_eq!(decision.action, PolicyAction::None);
        assert_eq!(decision.episode_id, episode_id);

        let report = must_ok(store.integrity_check());
        assert!(report.healthy, "issues: {:?}", report.issues);
    }

    #[test]
    fn commit_turn_rejects_draft_leakage() {
        let mut store = store();
        let score = RiskScore::zero();
        let writeback = TurnWriteback {
            user_text: "user",
            draft_text: "risky draft",
            final_text: "risky draft",
            embedding: &[1.0],
            draft_score: &score,
            final_score: &score,
            action: PolicyAction::SoftRewrite,
            degraded: false,
            belief_candidates: &[],
            task_command: None,
        };
        assert!(store
            .commit_turn(&writeback, utc("2026-01-01T00:00:00Z"), &ruleset())
            .is_err());
        assert_eq!(must_ok(store.count_episodes()), 0);
        assert_eq!(must_ok(store.list_decisions(10)).len(), 0);
    }

    #[test]
    fn namespace_gating_rejects_and_leaves_count_unchanged() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");

        let candidate = BeliefCandidate {
            namespace: BeliefNamespace::Constraint,
            key: "identity.kindness".to_string(),
            value: Value::Bool(true),
            signal: 1.0,
            rationale: "should never be stored".to_string(),
        };
        let outcome = must_ok(store.apply_belief_candidate(
            &candidate,
            episode_id,
            utc("2026-01-01T00:00:10Z"),
            &ruleset(),
        ));
        assert_eq!(
            outcome,
            BeliefWriteOutcome::Rejected {
                key: "identity.kindness".to_string(),
                reason: "namespace_not_allowed".to_string(),
            }
        );
        assert_eq!(must_ok(store.count_beliefs()), 0);
    }

    #[test]
    fn identity_language_is_rejected_at_admission() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");

        let candidate = BeliefCandidate {
            namespace: BeliefNamespace::ProjectContext,
            key: "project.context.summary".to_string(),
            value: Value::String("you are the kind of person who ships".to_string()),
            signal: 0.7,
            rationale: "identity leak attempt".to_string(),
        };
        let outcome = must_ok(store.apply_belief_candidate(
            &candidate,
            episode_id,
            utc("2026-01-01T00:00:10Z"),
            &ruleset(),
        ));
        assert!(matches!(outcome, BeliefWriteOutcome::Rejected { reason, .. } if reason == "identity_risk"));
        assert_eq!(must_ok(store.count_beliefs()), 0);
    }

    #[test]
    fn reinforcement_requires_a_second_independent_episode() {
        let mut store = store();
        let first = commit_clean(&mut store, "be concise", "ok");
        let second = commit_clean(&mut store, "be concise please", "ok");
        let ruleset = ruleset();

        let created = must_ok(store.apply_belief_candidate(
            &format_candidate(),
            first,
            utc("2026-01-02T00:00:00Z"),
            &ruleset,
        ));
        let initial = ruleset.belief_initial_confidence;
        assert!(
            matches!(created, BeliefWriteOutcome::Created { confidence, .. } if (confidence - initial).abs() < 1e-6)
        );

        // Same episode again: evidence already recorded, confidence fixed.
        let repeat = must_ok(store.apply_belief_candidate(
            &format_candidate(),
            first,
            utc("2026-01-02T00:01:00Z"),
            &ruleset,
        ));
        assert!(matches!(repeat, BeliefWriteOutcome::AlreadyEvidenced { .. }));
        let stored = must_some(must_ok(store.get_belief("pref.format.verbosity")));
        assert!((stored.confidence - initial).abs() < 1e-6);

        // A distinct episode reinforces.
        let reinforced = must_ok(store.apply_belief_candidate(
            &format_candidate(),
            second,
            utc("2026-01-02T00:02:00Z"),
            &ruleset,
        ));
        assert!(
            matches!(reinforced, BeliefWriteOutcome::Reinforced { confidence, .. } if confidence > initial)
        );
        let stored = must_some(must_ok(store.get_belief("pref.format.verbosity")));
        assert_eq!(stored.reinforcement_count, 2);
        assert_eq!(stored.evidence_episode_ids.len(), 2);
    }

    #[test]
    fn contradicting_value_contests_without_overwrite() {
        let mut store = store();
        let first = commit_clean(&mut store, "be concise", "ok");
        let second = commit_clean(&mut store, "be detailed", "ok");
        let ruleset = ruleset();

        must_ok(store.apply_belief_candidate(
            &format_candidate(),
            first,
            utc("2026-01-02T00:00:00Z"),
            &ruleset,
        ));

        let contradiction = BeliefCandidate {
            value: Value::String("detailed".to_string()),
            ..format_candidate()
        };
        let outcome = must_ok(store.apply_belief_candidate(
            &contradiction,
            second,
            utc("2026-01-02T00:01:00Z"),
            &ruleset,
        ));
        assert!(matches!(outcome, BeliefWriteOutcome::Contested { .. }));

        let stored = must_some(must_ok(store.get_belief("pref.format.verbosity")));
        assert_eq!(stored.value, Value::String("concise".to_string()));
        assert_eq!(stored.status, BeliefStatus::Contested);
        assert_eq!(stored.negative_signal_count, 1);
        assert!(stored.confidence < ruleset.belief_initial_confidence);
    }

    #[test]
    fn decay_pass_marks_stale_and_deprecates_aged_contested() {
        let mut store = store();
        let episode = commit_clean(&mut store, "be concise", "ok");
        let ruleset = ruleset();
        must_ok(store.apply_belief_candidate(
            &format_candidate(),
            episode,
            utc("2026-01-01T00:00:00Z"),
            &ruleset,
        ));

        // Fresh belief: nothing changes.
        let report = must_ok(store.run_belief_decay(utc("2026-01-02T00:00:00Z"), &ruleset));
        assert_eq!(report.marked_stale, 0);
        assert_eq!(report.deprecated, 0);

        // Past the stale threshold without reinforcement.
        let report = must_ok(store.run_belief_decay(utc("2026-01-25T00:00:00Z"), &ruleset));
        assert_eq!(report.marked_stale, 1);
        let stored = must_some(must_ok(store.get_belief("pref.format.verbosity")));
        assert_eq!(stored.status, BeliefStatus::Stale);

        // Far enough out that decayed confidence crosses the deprecation
        // threshold.
        let report = must_ok(store.run_belief_decay(utc("2026-05-01T00:00:00Z"), &ruleset));
        assert_eq!(report.deprecated, 1);
        let stored = must_some(must_ok(store.get_belief("pref.format.verbosity")));
        assert_eq!(stored.status, BeliefStatus::Deprecated);
    }

    #[test]
    fn explicit_task_command_creates_exactly_one_task_and_event() {
        let mut store = store();
        let score = RiskScore::zero();
        let command = TaskCommand::Create {
            title: "renew contract".to_string(),
        };
        let writeback = TurnWriteback {
            user_text: "add task: renew contract",
            draft_text: "Task noted.",
            final_text: "Task noted.",
            embedding: &[1.0],
            draft_score: &score,
            final_score: &score,
            action: PolicyAction::None,
            degraded: false,
            belief_candidates: &[],
            task_command: Some(&command),
        };
        let commit = must_ok(store.commit_turn(&writeback, utc("2026-01-01T00:00:00Z"), &ruleset()));

        let task = match must_some(commit.task_outcome) {
            TaskWriteOutcome::Created { task } => task,
            TaskWriteOutcome::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
        };
        assert_eq!(task.title, "renew contract");
        assert_eq!(task.status, TaskStatus::Open);

        assert_eq!(must_ok(store.count_tasks()), 1);
        let events = must_ok(store.task_events(task.task_id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TaskEventType::Create);
        assert_eq!(must_ok(store.count_beliefs()), 0);
    }

    #[test]
    fn implicit_turn_creates_no_task() {
        let mut store = store();
        commit_clean(&mut store, "don't let me forget about this project", "noted");
        assert_eq!(must_ok(store.count_tasks()), 0);
        assert!(must_ok(store.list_task_events(10)).is_empty());
    }

    #[test]
    fn reset_is_idempotent_and_audited() {
        let mut store = store();
        let now = utc("2026-01-01T00:00:00Z");
        must_ok(store.create_task("task one", "test", now));
        must_ok(store.create_task("task two", "test", now));

        let cleared = must_ok(store.reset_all("user requested reset", now));
        assert_eq!(cleared, 2);
        assert_eq!(must_ok(store.count_tasks()), 0);

        let events = must_ok(store.list_task_events(20));
        let resets = events
            .iter()
            .filter(|event| event.event_type == TaskEventType::Reset)
            .count();
        assert_eq!(resets, 2);

        // Second reset: state is unchanged, one more marker event.
        let cleared = must_ok(store.reset_all("user requested reset", now));
        assert_eq!(cleared, 0);
        assert_eq!(must_ok(store.count_tasks()), 0);
        let events = must_ok(store.list_task_events(20));
        let resets = events
            .iter()
            .filter(|event| event.event_type == TaskEventType::Reset)
            .count();
        assert_eq!(resets, 3);

        let report = must_ok(store.integrity_check());
        assert!(report.healthy, "issues: {:?}", report.issues);
    }

    #[test]
    fn task_status_update_appends_before_and_after_images() {
        let mut store = store();
        let now = utc("2026-01-01T00:00:00Z");
        let outcome = must_ok(store.create_task("ship release", "test", now));
        let task = match outcome {
            TaskWriteOutcome::Created { task } => task,
            TaskWriteOutcome::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
        };

        assert!(must_ok(store.set_task_status(
            task.task_id,
            TaskStatus::Done,
            "user marked task done",
            utc("2026-01-02T00:00:00Z"),
        )));

        let events = must_ok(store.task_events(task.task_id));
        assert_eq!(events.len(), 2);
        let update = &events[1];
        assert_eq!(update.event_type, TaskEventType::Update);
        let before = must_some(update.before.clone());
        let after = must_some(update.after.clone());
        assert_eq!(before["status"], "open");
        assert_eq!(after["status"], "done");
    }

    #[test]
    fn identity_task_title_is_rejected() {
        let mut store = store();
        let outcome = must_ok(store.create_task(
            "remember that I'm always late",
            "test",
            utc("2026-01-01T00:00:00Z"),
        ));
        assert!(matches!(outcome, TaskWriteOutcome::Rejected { reason, .. } if reason == "identity_risk"));
        assert_eq!(must_ok(store.count_tasks()), 0);
    }

    #[test]
    fn retrieval_ranks_by_relevance_and_bumps_access() {
        let mut store = store();
        let ruleset = ruleset();
        let score = RiskScore::zero();
        let near = TurnWriteback {
            user_text: "about cats",
            draft_text: "cats reply",
            final_text: "cats reply",
            embedding: &[1.0, 0.0],
            draft_score: &score,
            final_score: &score,
            action: PolicyAction::None,
            degraded: false,
            belief_candidates: &[],
            task_command: None,
        };
        let far = TurnWriteback {
            embedding: &[0.0, 1.0],
            user_text: "about dogs",
            draft_text: "dogs reply",
            final_text: "dogs reply",
            ..near
        };
        let near_id =
            must_ok(store.commit_turn(&near, utc("2026-01-01T00:00:00Z"), &ruleset)).episode_id;
        must_ok(store.commit_turn(&far, utc("2026-01-01T00:01:00Z"), &ruleset));

        let retrieved = must_ok(store.retrieve(
            &[1.0, 0.0],
            1,
            utc("2026-01-01T01:00:00Z"),
            &ruleset,
        ));
        assert_eq!(retrieved.len(), 1);
        assert_eq!(retrieved[0].episode.id, near_id);

        let bumped = must_some(must_ok(store.get_episode(near_id)));
        assert_eq!(bumped.meta.access_count, 1);
        assert!(bumped.meta.last_access_ts.is_some());
    }

    #[test]
    fn malformed_episode_metadata_degrades_to_defaults() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");
        must_ok(store.conn.execute(
            "UPDATE episodes SET meta_json = 'not json' WHERE episode_id = ?1",
            params![episode_id.to_string()],
        ));

        let episode = must_some(must_ok(store.get_episode(episode_id)));
        assert_eq!(episode.meta, EpisodeMeta::default());
    }

    #[test]
    fn delete_episode_cascades_to_its_decision() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");
        assert!(must_ok(store.delete_episode(episode_id)));
        assert_eq!(must_ok(store.count_episodes()), 0);
        assert!(must_ok(store.decision_for_episode(episode_id)).is_none());
        let report = must_ok(store.integrity_check());
        assert!(report.healthy, "issues: {:?}", report.issues);
    }

    #[test]
    fn integrity_check_detects_orphan_decisions() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");
        // Bypass the cascade to manufacture an orphan.
        must_ok(store.conn.execute(
            "DELETE FROM episodes WHERE episode_id = ?1",
            params![episode_id.to_string()],
        ));

        let report = must_ok(store.integrity_check());
        assert!(!report.healthy);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == "orphan_risk_decisions"));
    }

    #[test]
    fn risk_decisions_are_immutable() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");
        let result = store.conn.execute(
            "UPDATE risk_decisions SET action = 'block' WHERE episode_id = ?1",
            params![episode_id.to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn task_events_are_append_only() {
        let mut store = store();
        must_ok(store.create_task("ship release", "test", utc("2026-01-01T00:00:00Z")));
        assert!(store
            .conn
            .execute("DELETE FROM task_events", [])
            .is_err());
        assert!(store
            .conn
            .execute("UPDATE task_events SET rationale = 'edited'", [])
            .is_err());
    }

    #[test]
    fn export_snapshot_never_contains_embeddings() {
        let mut store = store();
        commit_clean(&mut store, "hello", "hi");
        let snapshot = must_ok(store.export_snapshot(utc("2026-01-02T00:00:00Z")));
        let rendered = snapshot.to_string();
        assert!(!rendered.contains("embedding"));
        assert_eq!(
            must_some(snapshot["episodes"].as_array()).len(),
            1
        );
    }

    #[test]
    fn trace_decision_reports_both_breakdowns() {
        let mut store = store();
        let episode_id = commit_clean(&mut store, "hello", "hi");
        let trace = must_some(must_ok(store.trace_decision(episode_id)));
        assert_eq!(trace.episode_id, episode_id);
        assert_eq!(trace.decision.action, PolicyAction::None);
        assert_eq!(trace.decision.draft_hash, hash_text("hi"));
    }

    #[test]
    fn delete_beliefs_matching_removes_by_pattern() {
        let mut store = store();
        let episode = commit_clean(&mut store, "be concise", "ok");
        must_ok(store.apply_belief_candidate(
            &format_candidate(),
            episode,
            utc("2026-01-01T00:00:00Z"),
            &ruleset(),
        ));
        assert_eq!(must_ok(store.count_beliefs()), 1);
        assert_eq!(must_ok(store.delete_beliefs_matching("verbosity")), 1);
        assert_eq!(must_ok(store.count_beliefs()), 0);
    }

    #[test]
    fn embedding_blob_round_trips() {
        let embedding = vec![0.25_f32, -1.5, 3.75];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(embedding_from_blob(&blob), embedding);
    }
}
