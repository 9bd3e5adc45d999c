#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memory_gate_core::{
    classify_action, format_rfc3339, now_utc, EpisodeId, RiskEngine, TaskId, TaskStatus,
};
use memory_gate_engine::{
    run_suite, HashEmbedder, StubDrafter, TurnEngine, UnsafeStubDrafter, UNSAFE_DRAFTS_ENV,
};
use memory_gate_store_sqlite::SqliteMemoryStore;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "mg")]
#[command(about = "Memory Gate CLI")]
pub struct Cli {
    #[arg(long, default_value = "./memory_gate.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply schema migrations and seed the v1 governance ruleset.
    Migrate,
    /// Run one gated turn.
    Turn(TurnArgs),
    Episodes {
        #[command(subcommand)]
        command: EpisodesCommand,
    },
    Beliefs {
        #[command(subcommand)]
        command: BeliefsCommand,
    },
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
    Risk {
        #[command(subcommand)]
        command: RiskCommand,
    },
    /// Export the full memory snapshot (no raw embeddings).
    Export,
    /// Trace one episode's gating decision.
    Trace(TraceArgs),
    /// Check referential integrity between stores and audit tables.
    Check,
    /// Run the gating regression suite (requires the unsafe-draft env gate).
    Suite,
}

#[derive(Debug, Args)]
pub struct TurnArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
pub enum EpisodesCommand {
    List(LimitArgs),
    Delete(EpisodeIdArgs),
}

#[derive(Debug, Subcommand)]
pub enum BeliefsCommand {
    List(BeliefListArgs),
    /// Run the status decay pass.
    Decay,
    /// Explicitly deprecate one belief by key.
    Deprecate(BeliefKeyArgs),
    /// Delete beliefs whose key matches a pattern.
    Delete(BeliefPatternArgs),
}

#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    List(TaskListArgs),
    Add(TaskAddArgs),
    SetStatus(TaskStatusArgs),
    Delete(TaskIdArgs),
    /// Clear the board; idempotent, fully audited.
    Reset,
    /// Show one task's full event history.
    Events(TaskIdArgs),
}

#[derive(Debug, Subcommand)]
pub enum RiskCommand {
    List(LimitArgs),
    Show(EpisodeIdArgs),
    /// Score a (user, assistant) pair without touching any store.
    Score(RiskScoreArgs),
}

#[derive(Debug, Args)]
pub struct LimitArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct EpisodeIdArgs {
    #[arg(long)]
    episode_id: String,
}

#[derive(Debug, Args)]
pub struct BeliefListArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    include_deprecated: bool,
}

#[derive(Debug, Args)]
pub struct BeliefKeyArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Args)]
pub struct BeliefPatternArgs {
    #[arg(long)]
    pattern: String,
}

#[derive(Debug, Args)]
pub struct TaskListArgs {
    #[arg(long)]
    include_archived: bool,
}

#[derive(Debug, Args)]
pub struct TaskAddArgs {
    #[arg(long)]
    title: String,
}

#[derive(Debug, Args)]
pub struct TaskIdArgs {
    #[arg(long)]
    task_id: String,
}

#[derive(Debug, Args)]
pub struct TaskStatusArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    status: TaskStatusArg,
    #[arg(long, default_value = "explicit user status command")]
    rationale: String,
}

#[derive(Debug, Args)]
pub struct RiskScoreArgs {
    #[arg(long)]
    user: String,
    #[arg(long, default_value = "")]
    assistant: String,
}

#[derive(Debug, Args)]
pub struct TraceArgs {
    #[arg(long)]
    episode_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskStatusArg {
    Open,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl From<TaskStatusArg> for TaskStatus {
    fn from(value: TaskStatusArg) -> Self {
        match value {
            TaskStatusArg::Open => Self::Open,
            TaskStatusArg::InProgress => Self::InProgress,
            TaskStatusArg::Blocked => Self::Blocked,
            TaskStatusArg::Done => Self::Done,
            TaskStatusArg::Archived => Self::Archived,
        }
    }
}

/// Executes one parsed CLI invocation. Library entry point so the command
/// surface is testable without spawning the binary.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli.db)?;

    match cli.command {
        Command::Migrate => {
            emit(&json!({"migrated": true, "db": cli.db.display().to_string()}))
        }
        Command::Turn(args) => {
            let drafter = StubDrafter;
            let embedder = HashEmbedder::default();
            let mut engine = TurnEngine::new(&mut store, &drafter, &embedder)?;
            let outcome = engine.process_turn(&args.user)?;
            emit(&serde_json::to_value(&outcome)?)
        }
        Command::Episodes { command } => run_episodes(&mut store, command),
        Command::Beliefs { command } => run_beliefs(&mut store, command),
        Command::Tasks { command } => run_tasks(&mut store, command),
        Command::Risk { command } => run_risk(&store, command),
        Command::Export => {
            let snapshot = store.export_snapshot(now_utc())?;
            emit(&snapshot)
        }
        Command::Trace(args) => {
            let episode_id = parse_episode_id(&args.episode_id)?;
            let trace = store
                .trace_decision(episode_id)?
                .ok_or_else(|| anyhow!("episode {episode_id} not found"))?;
            emit(&serde_json::to_value(&trace)?)
        }
        Command::Check => {
            let report = store.integrity_check()?;
            emit(&serde_json::to_value(&report)?)?;
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!("integrity check found violations"))
            }
        }
        Command::Suite => {
            let Some(drafter) = UnsafeStubDrafter::from_env()? else {
                return Err(anyhow!(
                    "suite requires {UNSAFE_DRAFTS_ENV}=1; it is disabled by default"
                ));
            };
            let embedder = HashEmbedder::default();
            let mut engine = TurnEngine::new(&mut store, &drafter, &embedder)?;
            let report = run_suite(&mut engine)?;
            emit(&serde_json::to_value(&report)?)?;
            if report.rows.iter().all(|row| row.matched) {
                Ok(())
            } else {
                Err(anyhow!("suite expectations not met"))
            }
        }
    }
}

fn run_episodes(store: &mut SqliteMemoryStore, command: EpisodesCommand) -> Result<()> {
    match command {
        EpisodesCommand::List(args) => {
            let episodes = store.list_episodes(args.limit)?;
            let rows = episodes
                .iter()
                .map(|episode| {
                    Ok(json!({
                        "id": episode.id.to_string(),
                        "ts": format_rfc3339(episode.timestamp)
                            .map_err(|err| anyhow!(err.to_string()))?,
                        "user_text": episode.user_text,
                        "final_text": episode.final_text,
                        "access_count": episode.meta.access_count,
                    }))
                })
                .collect::<Result<Vec<Value>>>()?;
            emit(&Value::Array(rows))
        }
        EpisodesCommand::Delete(args) => {
            let episode_id = parse_episode_id(&args.episode_id)?;
            let deleted = store.delete_episode(episode_id)?;
            emit(&json!({"deleted": deleted, "episode_id": episode_id.to_string()}))
        }
    }
}

fn run_beliefs(store: &mut SqliteMemoryStore, command: BeliefsCommand) -> Result<()> {
    let ruleset = store.latest_ruleset()?;
    match command {
        BeliefsCommand::List(args) => {
            let beliefs =
                store.list_beliefs(args.limit, args.include_deprecated, now_utc(), &ruleset)?;
            let rows = beliefs
                .iter()
                .map(|belief| {
                    json!({
                        "key": belief.key,
                        "namespace": belief.namespace.as_str(),
                        "value": belief.value,
                        "confidence": belief.confidence,
                        "status": belief.status.as_str(),
                        "reinforcement_count": belief.reinforcement_count,
                        "negative_signal_count": belief.negative_signal_count,
                        "evidence": belief
                            .evidence_episode_ids
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<String>>(),
                    })
                })
                .collect::<Vec<Value>>();
            emit(&Value::Array(rows))
        }
        BeliefsCommand::Decay => {
            let report = store.run_belief_decay(now_utc(), &ruleset)?;
            emit(&serde_json::to_value(report)?)
        }
        BeliefsCommand::Deprecate(args) => {
            let deprecated = store.deprecate_belief(&args.key, &ruleset)?;
            emit(&json!({"deprecated": deprecated, "key": args.key}))
        }
        BeliefsCommand::Delete(args) => {
            let deleted = store.delete_beliefs_matching(&args.pattern)?;
            emit(&json!({"deleted": deleted, "pattern": args.pattern}))
        }
    }
}

fn run_tasks(store: &mut SqliteMemoryStore, command: TasksCommand) -> Result<()> {
    match command {
        TasksCommand::List(args) => {
            let tasks = store.list_tasks(args.include_archived)?;
            let rows = tasks
                .iter()
                .map(|task| {
                    json!({
                        "task_id": task.task_id.to_string(),
                        "title": task.title,
                        "status": task.status.as_str(),
                        "priority": task.priority,
                    })
                })
                .collect::<Vec<Value>>();
            emit(&Value::Array(rows))
        }
        TasksCommand::Add(args) => {
            let outcome = store.create_task(&args.title, "explicit user task creation", now_utc())?;
            emit(&serde_json::to_value(&outcome)?)
        }
        TasksCommand::SetStatus(args) => {
            let task_id = parse_task_id(&args.task_id)?;
            let updated =
                store.set_task_status(task_id, args.status.into(), &args.rationale, now_utc())?;
            if !updated {
                return Err(anyhow!("task {task_id} not found"));
            }
            emit(&json!({"updated": true, "task_id": task_id.to_string()}))
        }
        TasksCommand::Delete(args) => {
            let task_id = parse_task_id(&args.task_id)?;
            let deleted = store.delete_task(task_id, "explicit user task deletion", now_utc())?;
            emit(&json!({"deleted": deleted, "task_id": task_id.to_string()}))
        }
        TasksCommand::Reset => {
            let cleared = store.reset_all("explicit user board reset", now_utc())?;
            emit(&json!({"cleared": cleared}))
        }
        TasksCommand::Events(args) => {
            let task_id = parse_task_id(&args.task_id)?;
            let events = store.task_events(task_id)?;
            let rows = events
                .iter()
                .map(|event| {
                    Ok(json!({
                        "event_seq": event.event_seq,
                        "ts": format_rfc3339(event.timestamp)
                            .map_err(|err| anyhow!(err.to_string()))?,
                        "event_type": event.event_type.as_str(),
                        "before": event.before,
                        "after": event.after,
                        "rationale": event.rationale,
                    }))
                })
                .collect::<Result<Vec<Value>>>()?;
            emit(&Value::Array(rows))
        }
    }
}

fn run_risk(store: &SqliteMemoryStore, command: RiskCommand) -> Result<()> {
    match command {
        RiskCommand::List(args) => {
            let decisions = store.list_decisions(args.limit)?;
            let rows = decisions
                .iter()
                .map(decision_to_json)
                .collect::<Result<Vec<Value>>>()?;
            emit(&Value::Array(rows))
        }
        RiskCommand::Show(args) => {
            let episode_id = parse_episode_id(&args.episode_id)?;
            let decision = store
                .decision_for_episode(episode_id)?
                .ok_or_else(|| anyhow!("no risk decision for episode {episode_id}"))?;
            emit(&decision_to_json(&decision)?)
        }
        RiskCommand::Score(args) => {
            let ruleset = store.latest_ruleset()?;
            let engine = RiskEngine::new().map_err(|err| anyhow!(err.to_string()))?;
            let score = engine.score(&args.user, &args.assistant);
            let action = classify_action(&score, ruleset.policy_thresholds());
            emit(&json!({
                "total": score.total,
                "breakdown": score.breakdown,
                "triggers": score.triggers,
                "action": action.as_str(),
            }))
        }
    }
}

fn decision_to_json(decision: &memory_gate_core::RiskDecision) -> Result<Value> {
    Ok(json!({
        "decision_seq": decision.decision_seq,
        "episode_id": decision.episode_id.to_string(),
        "ts": format_rfc3339(decision.timestamp).map_err(|err| anyhow!(err.to_string()))?,
        "draft_total": decision.draft_total,
        "draft_breakdown": decision.draft_breakdown,
        "draft_triggers": decision.draft_triggers,
        "final_total": decision.final_total,
        "final_breakdown": decision.final_breakdown,
        "final_triggers": decision.final_triggers,
        "action": decision.action.as_str(),
        "degraded": decision.degraded,
        "draft_hash": decision.draft_hash,
        "final_hash": decision.final_hash,
    }))
}

fn open_store(path: &std::path::Path) -> Result<SqliteMemoryStore> {
    let store = SqliteMemoryStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn parse_episode_id(raw: &str) -> Result<EpisodeId> {
    EpisodeId::parse(raw).map_err(|err| anyhow!(err.to_string()))
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    TaskId::parse(raw).map_err(|err| anyhow!(err.to_string()))
}

fn emit(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
