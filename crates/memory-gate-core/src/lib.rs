#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EpisodeId(pub Ulid);

impl EpisodeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an episode id from its canonical ULID string.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, GateError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| GateError::Validation(format!("invalid episode id '{value}': {err}")))
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EpisodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BeliefId(pub Ulid);

impl BeliefId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a belief id from its canonical ULID string.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, GateError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| GateError::Validation(format!("invalid belief id '{value}': {err}")))
    }
}

impl Default for BeliefId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BeliefId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub Ulid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a task id from its canonical ULID string.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, GateError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| GateError::Validation(format!("invalid task id '{value}': {err}")))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeliefStatus {
    Active,
    Contested,
    Stale,
    Deprecated,
}

impl BeliefStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Contested => "contested",
            Self::Stale => "stale",
            Self::Deprecated => "deprecated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "contested" => Some(Self::Contested),
            "stale" => Some(Self::Stale),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// Closed allow-list of belief categories. Keys are namespaced as
/// `<namespace>.<rest>`; anything that fails [`BeliefNamespace::from_key`]
/// is rejected at admission and never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeliefNamespace {
    PrefFormat,
    PrefTone,
    ProjectContext,
    ProjectStack,
    Constraint,
}

impl BeliefNamespace {
    pub const ALL: [Self; 5] = [
        Self::PrefFormat,
        Self::PrefTone,
        Self::ProjectContext,
        Self::ProjectStack,
        Self::Constraint,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrefFormat => "pref.format",
            Self::PrefTone => "pref.tone",
            Self::ProjectContext => "project.context",
            Self::ProjectStack => "project.stack",
            Self::Constraint => "constraint",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pref.format" => Some(Self::PrefFormat),
            "pref.tone" => Some(Self::PrefTone),
            "project.context" => Some(Self::ProjectContext),
            "project.stack" => Some(Self::ProjectStack),
            "constraint" => Some(Self::Constraint),
            _ => None,
        }
    }

    /// Resolves the namespace for a fully qualified belief key, e.g.
    /// `pref.format.no_emojis`. Returns `None` for keys outside the
    /// allow-list.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|namespace| {
                key.strip_prefix(namespace.as_str())
                    .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1)
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Create,
    Update,
    Delete,
    Reset,
}

impl TaskEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reset => "reset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    None,
    SoftRewrite,
    HardRewrite,
    Block,
}

impl PolicyAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SoftRewrite => "soft_rewrite",
            Self::HardRewrite => "hard_rewrite",
            Self::Block => "block",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "soft_rewrite" => Some(Self::SoftRewrite),
            "hard_rewrite" => Some(Self::HardRewrite),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

impl Display for PolicyAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RewriteProfile {
    Soft,
    Hard,
}

impl RewriteProfile {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskDimension {
    Influence,
    Opacity,
    LockIn,
    Authority,
    Dependency,
}

impl RiskDimension {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Influence => "influence",
            Self::Opacity => "opacity",
            Self::LockIn => "lock_in",
            Self::Authority => "authority",
            Self::Dependency => "dependency",
        }
    }
}

impl Display for RiskDimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-dimension risk levels, each in `0..=2`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DimensionBreakdown {
    pub influence: u8,
    pub opacity: u8,
    pub lock_in: u8,
    pub authority: u8,
    pub dependency: u8,
}

impl DimensionBreakdown {
    #[must_use]
    pub fn get(self, dimension: RiskDimension) -> u8 {
        match dimension {
            RiskDimension::Influence => self.influence,
            RiskDimension::Opacity => self.opacity,
            RiskDimension::LockIn => self.lock_in,
            RiskDimension::Authority => self.authority,
            RiskDimension::Dependency => self.dependency,
        }
    }

    /// Raises a dimension to at least `floor`. Matches never lower a
    /// dimension, and levels are capped at 2.
    pub fn raise(&mut self, dimension: RiskDimension, floor: u8) {
        let slot = match dimension {
            RiskDimension::Influence => &mut self.influence,
            RiskDimension::Opacity => &mut self.opacity,
            RiskDimension::LockIn => &mut self.lock_in,
            RiskDimension::Authority => &mut self.authority,
            RiskDimension::Dependency => &mut self.dependency,
        };
        *slot = (*slot).max(floor).min(2);
    }

    #[must_use]
    pub fn total(self) -> u8 {
        self.influence + self.opacity + self.lock_in + self.authority + self.dependency
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.total() == 0
    }
}

/// Result of scoring one (user, assistant) text pair. `triggers` holds one
/// human-readable entry per matched rule, in registry order; a nonzero
/// dimension always has at least one trigger naming it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RiskScore {
    pub total: u8,
    pub breakdown: DimensionBreakdown,
    pub triggers: Vec<String>,
}

impl RiskScore {
    #[must_use]
    pub fn zero() -> Self {
        Self {
            total: 0,
            breakdown: DimensionBreakdown::default(),
            triggers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EpisodeMeta {
    pub base_strength: f32,
    pub reinforcement: f32,
    pub valence: f32,
    pub access_count: u32,
    pub last_access_ts: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

impl Default for EpisodeMeta {
    fn default() -> Self {
        Self {
            base_strength: 1.0,
            reinforcement: 0.6,
            valence: 0.0,
            access_count: 0,
            last_access_ts: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: EpisodeId,
    pub timestamp: OffsetDateTime,
    pub user_text: String,
    pub final_text: String,
    pub embedding: Vec<f32>,
    pub meta: EpisodeMeta,
}

/// An episode returned from retrieval, with the scores that ranked it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedEpisode {
    pub episode: Episode,
    pub similarity: f32,
    pub strength: f32,
    pub relevance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Belief {
    pub id: BeliefId,
    pub namespace: BeliefNamespace,
    pub key: String,
    pub value: Value,
    pub confidence: f32,
    pub status: BeliefStatus,
    pub reinforcement_count: u32,
    pub negative_signal_count: u32,
    pub evidence_episode_ids: Vec<EpisodeId>,
    pub created_ts: OffsetDateTime,
    pub updated_ts: OffsetDateTime,
    pub last_reinforced_ts: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_ts: OffsetDateTime,
    pub updated_ts: OffsetDateTime,
}

/// One audit entry per task mutation. `task_id` is `None` only for the
/// board-level marker a reset appends when it finds nothing to clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub event_seq: i64,
    pub task_id: Option<TaskId>,
    pub timestamp: OffsetDateTime,
    pub event_type: TaskEventType,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub rationale: String,
}

/// One audit record per turn: the draft and final scores, the resolved
/// action, and content hashes of both texts. `degraded` marks decisions
/// reached through a generation-failure path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskDecision {
    pub decision_seq: i64,
    pub episode_id: EpisodeId,
    pub draft_total: u8,
    pub draft_breakdown: DimensionBreakdown,
    pub draft_triggers: Vec<String>,
    pub final_total: u8,
    pub final_breakdown: DimensionBreakdown,
    pub final_triggers: Vec<String>,
    pub action: PolicyAction,
    pub degraded: bool,
    pub draft_hash: String,
    pub final_hash: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyThresholds {
    pub soft_min_total: u8,
    pub block_min_total: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernanceRuleset {
    pub ruleset_version: u32,
    pub retrieval_top_k: usize,
    pub strength_lambda_per_day: f32,
    pub strength_reinforcement_alpha: f32,
    pub strength_access_beta: f32,
    pub strength_negative_gamma: f32,
    pub belief_initial_confidence: f32,
    pub belief_reinforce_step: f32,
    pub belief_contest_step: f32,
    pub belief_confidence_floor: f32,
    pub belief_confidence_ceiling: f32,
    pub belief_decay_rate_per_day: f32,
    pub belief_stale_days: f32,
    pub belief_contest_confidence: f32,
    pub belief_deprecate_confidence: f32,
    pub belief_contested_grace_days: f32,
    pub belief_negative_contest_threshold: u32,
    pub belief_context_limit: usize,
    pub policy_soft_min_total: u8,
    pub policy_block_min_total: u8,
    pub draft_timeout_ms: u64,
    pub rewrite_timeout_ms: u64,
}

impl GovernanceRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            retrieval_top_k: 3,
            strength_lambda_per_day: 0.08,
            strength_reinforcement_alpha: 1.5,
            strength_access_beta: 0.25,
            strength_negative_gamma: 0.5,
            belief_initial_confidence: 0.55,
            belief_reinforce_step: 0.15,
            belief_contest_step: 0.20,
            belief_confidence_floor: 0.05,
            belief_confidence_ceiling: 0.95,
            belief_decay_rate_per_day: 0.03,
            belief_stale_days: 21.0,
            belief_contest_confidence: 0.35,
            belief_deprecate_confidence: 0.15,
            belief_contested_grace_days: 14.0,
            belief_negative_contest_threshold: 2,
            belief_context_limit: 12,
            policy_soft_min_total: 1,
            policy_block_min_total: 9,
            draft_timeout_ms: 30_000,
            rewrite_timeout_ms: 30_000,
        }
    }

    /// Validates ruleset numeric bounds and threshold invariants.
    ///
    /// # Errors
    /// Returns [`GateError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.ruleset_version == 0 {
            return Err(GateError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("belief_initial_confidence", self.belief_initial_confidence),
            ("belief_reinforce_step", self.belief_reinforce_step),
            ("belief_contest_step", self.belief_contest_step),
            ("belief_confidence_floor", self.belief_confidence_floor),
            ("belief_confidence_ceiling", self.belief_confidence_ceiling),
            ("belief_decay_rate_per_day", self.belief_decay_rate_per_day),
            ("belief_contest_confidence", self.belief_contest_confidence),
            (
                "belief_deprecate_confidence",
                self.belief_deprecate_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GateError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.belief_confidence_floor > self.belief_confidence_ceiling {
            return Err(GateError::Configuration(
                "belief_confidence_floor cannot exceed belief_confidence_ceiling".to_string(),
            ));
        }

        for (name, value) in [
            ("strength_lambda_per_day", self.strength_lambda_per_day),
            (
                "strength_reinforcement_alpha",
                self.strength_reinforcement_alpha,
            ),
            ("strength_access_beta", self.strength_access_beta),
            ("strength_negative_gamma", self.strength_negative_gamma),
            ("belief_stale_days", self.belief_stale_days),
            ("belief_contested_grace_days", self.belief_contested_grace_days),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(GateError::Configuration(format!(
                    "{name} MUST be a finite non-negative number"
                )));
            }
        }

        if self.retrieval_top_k == 0 {
            return Err(GateError::Configuration(
                "retrieval_top_k MUST be >= 1".to_string(),
            ));
        }

        if self.belief_context_limit == 0 {
            return Err(GateError::Configuration(
                "belief_context_limit MUST be >= 1".to_string(),
            ));
        }

        if self.policy_soft_min_total == 0 {
            return Err(GateError::Configuration(
                "policy_soft_min_total MUST be >= 1".to_string(),
            ));
        }

        if self.policy_block_min_total > 10 {
            return Err(GateError::Configuration(
                "policy_block_min_total MUST be <= 10 (five dimensions of 0..=2)".to_string(),
            ));
        }

        if self.policy_soft_min_total > self.policy_block_min_total {
            return Err(GateError::Configuration(
                "policy_soft_min_total cannot exceed policy_block_min_total".to_string(),
            ));
        }

        if self.draft_timeout_ms == 0 || self.rewrite_timeout_ms == 0 {
            return Err(GateError::Configuration(
                "capability timeouts MUST be >= 1ms".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn policy_thresholds(&self) -> PolicyThresholds {
        PolicyThresholds {
            soft_min_total: self.policy_soft_min_total,
            block_min_total: self.policy_block_min_total,
        }
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`GateError::Configuration`] when JSON decoding fails or
    /// decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, GateError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            GateError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RuleSide {
    User,
    Assistant,
}

impl RuleSide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
struct RiskRule {
    dimension: RiskDimension,
    side: RuleSide,
    floor: u8,
    pattern: Regex,
    requires: Option<Regex>,
    description: &'static str,
}

/// Deterministic rule-based classifier over (user, assistant) text pairs.
///
/// Every rule is evaluated independently against its side's normalized
/// text; a match raises its dimension to at least the rule's floor value.
/// The two sides combine by per-dimension maximum, never by summing, so the
/// same underlying risk is not double-counted. Scoring is a pure function:
/// no state, no side effects, identical output for identical input.
pub struct RiskEngine {
    rules: Vec<RiskRule>,
}

impl RiskEngine {
    /// Compiles the v1 rule registry.
    ///
    /// # Errors
    /// Returns [`GateError::Configuration`] when a rule pattern fails to
    /// compile.
    pub fn new() -> Result<Self, GateError> {
        use RiskDimension::{Authority, Dependency, Influence, LockIn, Opacity};
        use RuleSide::{Assistant, User};

        let strong_directive = r"\byou must\b|\byou have to\b|\bdo it now\b|\bno excuses\b";

        let rules = vec![
            rule(
                Influence,
                Assistant,
                1,
                r"\byou must\b|\byou have to\b|\byou should\b|\bdo it now\b|\bno excuses\b",
                None,
                "strong directive language",
            )?,
            rule(
                Influence,
                Assistant,
                2,
                r"\btrust me\b|\bdon't overthink\b|\bjust do (?:it|this)\b|\bstop (?:asking|thinking)\b|\bi've decided\b|\bi have decided\b|\bdon't question\b",
                None,
                "pressure and shortcut cues",
            )?,
            rule(
                Opacity,
                Assistant,
                2,
                r"\btrust me\b|\bno need to explain\b|\bfor reasons\b",
                None,
                "discourages reasoning",
            )?,
            rule(
                Opacity,
                Assistant,
                1,
                r"\bjust\b",
                Some(strong_directive),
                "'just' paired with a strong directive",
            )?,
            rule(
                LockIn,
                Assistant,
                1,
                r"\bcommit\b|\bpromise\b",
                None,
                "commitment language",
            )?,
            rule(
                LockIn,
                Assistant,
                2,
                r"\bkeep using\b|\buse me every day\b|\bstick with\b|\bdon't stop\b|\bnever stop\b|\bdaily\b|\bevery day\b",
                None,
                "retention cues",
            )?,
            rule(
                Authority,
                Assistant,
                1,
                r"\bthe only way\b|\bonly .*correct\b",
                None,
                "exclusivity claim",
            )?,
            rule(
                Authority,
                Assistant,
                2,
                r"\bguarantee\b|\bwithout doubt\b|\bno alternatives\b",
                None,
                "certainty claims",
            )?,
            rule(
                Dependency,
                Assistant,
                2,
                r"\brely on me\b|\bi'll remember\b|\bi will remember\b|\blet me handle\b|\bleave it to me\b|\bso you don't have to\b|\byou don't have to think\b|\bi'll (?:track|manage|handle|decide|take care of)\b|\bi will (?:track|manage|handle|decide|take care of)\b",
                None,
                "delegated agency offer",
            )?,
            rule(
                Dependency,
                Assistant,
                1,
                r"\bcome back\b|\bask me anytime\b",
                None,
                "repeated-use cue",
            )?,
            rule(
                Influence,
                User,
                1,
                r"\bconvince\b|\bpersuade\b|\bmake me\b|\bensure that i\b|\bguarantee\b",
                None,
                "user requests persuasion",
            )?,
            rule(
                Authority,
                User,
                2,
                r"\bdon't mention uncertainty\b|\bdon't mention options\b|\bdon't mention limitations\b|\bdon't mention downsides\b|\bno alternatives\b|\bdon't give options\b|\bdon't suggest other\b|\bstate\b.*\bas a fact\b|\bdecide for me\b|\bdon't question\b",
                None,
                "user requests suppression of options or uncertainty",
            )?,
            rule(
                LockIn,
                User,
                1,
                r"\bpromise\b|\bcommit\b|\bpermanently\b",
                None,
                "user commitment framing",
            )?,
            rule(
                LockIn,
                User,
                2,
                r"\bevery day\b|\beach day\b|\bdaily\b|\bkeep using\b|\bnever stop\b|\bdon't stop\b",
                None,
                "user requests a recurring obligation",
            )?,
            rule(
                Dependency,
                User,
                2,
                r"\bhandle my decisions\b|\bhandle everything\b|\bso i don't have to think\b|\bdon't have to think\b|\bdon't want to think\b|\brely on you\b|\bremember everything\b|\bhold me accountable\b",
                None,
                "user requests delegated agency",
            )?,
            rule(
                Dependency,
                User,
                1,
                r"\bdon't let me forget\b|\bremind me\b",
                None,
                "user delegates reminders",
            )?,
            rule(
                LockIn,
                User,
                1,
                r"\bdon't let me forget\b|\bremind me\b",
                None,
                "user requests a standing reminder",
            )?,
        ];

        Ok(Self { rules })
    }

    /// Scores a (user, assistant) text pair across the five risk
    /// dimensions. Deterministic; absence of any match yields a zero score
    /// with an empty trigger list.
    #[must_use]
    pub fn score(&self, user_text: &str, assistant_text: &str) -> RiskScore {
        let user = normalize_text(user_text);
        let assistant = normalize_text(assistant_text);

        let mut breakdown = DimensionBreakdown::default();
        let mut triggers = Vec::new();

        for rule in &self.rules {
            let haystack = match rule.side {
                RuleSide::User => user.as_str(),
                RuleSide::Assistant => assistant.as_str(),
            };
            if haystack.is_empty() || !rule.pattern.is_match(haystack) {
                continue;
            }
            if let Some(requires) = &rule.requires {
                if !requires.is_match(haystack) {
                    continue;
                }
            }
            breakdown.raise(rule.dimension, rule.floor);
            triggers.push(format!(
                "{} {}: {}",
                rule.side.as_str(),
                rule.dimension.as_str(),
                rule.description
            ));
        }

        RiskScore {
            total: breakdown.total(),
            breakdown,
            triggers,
        }
    }

    /// The irreducible user-side contribution: what the pair would score
    /// against an empty assistant text. A rewrite cannot go below this.
    #[must_use]
    pub fn user_floor(&self, user_text: &str) -> u8 {
        self.score(user_text, "").total
    }
}

fn rule(
    dimension: RiskDimension,
    side: RuleSide,
    floor: u8,
    pattern: &str,
    requires: Option<&str>,
    description: &'static str,
) -> Result<RiskRule, GateError> {
    let compile = |raw: &str| {
        Regex::new(raw).map_err(|err| {
            GateError::Configuration(format!("invalid risk rule pattern '{raw}': {err}"))
        })
    };
    Ok(RiskRule {
        dimension,
        side,
        floor,
        pattern: compile(pattern)?,
        requires: requires.map(compile).transpose()?,
        description,
    })
}

/// Lowercases and maps typographic quotes to ASCII so rule patterns see a
/// canonical form.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201c}', '\u{201d}'], "\"")
}

/// Maps a score to a policy action. Fixed precedence, first match wins;
/// the authority/opacity hard trigger is evaluated before the aggregate
/// thresholds and can floor the action at a soft rewrite even when the
/// total alone would block.
#[must_use]
pub fn classify_action(score: &RiskScore, thresholds: PolicyThresholds) -> PolicyAction {
    let b = score.breakdown;
    if b.authority >= 2 || b.opacity >= 2 {
        return PolicyAction::SoftRewrite;
    }
    if b.lock_in >= 2 {
        return PolicyAction::HardRewrite;
    }
    if b.dependency >= 2 && b.influence >= 1 {
        return PolicyAction::HardRewrite;
    }
    if score.total >= thresholds.block_min_total {
        return PolicyAction::Block;
    }
    if score.total >= thresholds.soft_min_total {
        return PolicyAction::SoftRewrite;
    }
    PolicyAction::None
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Drafted,
    SoftAttempted,
    HardAttempted,
    Resolved,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EscalationDirective {
    AcceptDraft,
    RewriteSoft,
    RewriteHard,
    Block,
}

/// Bounded escalation over rewrite attempts: at most one soft and one hard
/// attempt before blocking. Transitions are driven solely by re-score
/// comparisons; a rewrite is never accepted merely for having been
/// requested.
///
/// Acceptance is measured against two baselines: the draft's total (a
/// rewrite must never score worse) and the irreducible user-side floor
/// (a rewrite that has removed all assistant-attributable risk cannot be
/// asked to improve further, because pair scoring keeps the user text in
/// view).
#[derive(Debug, Clone)]
pub struct EscalationMachine {
    thresholds: PolicyThresholds,
    draft_total: u8,
    user_floor: u8,
    initial_action: PolicyAction,
    state: EscalationState,
    resolved: Option<PolicyAction>,
}

impl EscalationMachine {
    #[must_use]
    pub fn new(draft: &RiskScore, user_floor: u8, thresholds: PolicyThresholds) -> Self {
        let initial_action = classify_action(draft, thresholds);
        let resolved = match initial_action {
            PolicyAction::None => Some(PolicyAction::None),
            PolicyAction::Block => Some(PolicyAction::Block),
            PolicyAction::SoftRewrite | PolicyAction::HardRewrite => None,
        };
        let state = if resolved.is_some() {
            EscalationState::Resolved
        } else {
            EscalationState::Drafted
        };
        Self {
            thresholds,
            draft_total: draft.total,
            user_floor,
            initial_action,
            state,
            resolved,
        }
    }

    #[must_use]
    pub fn state(&self) -> EscalationState {
        self.state
    }

    #[must_use]
    pub fn initial_action(&self) -> PolicyAction {
        self.initial_action
    }

    #[must_use]
    pub fn resolved_action(&self) -> Option<PolicyAction> {
        self.resolved
    }

    /// What the enforcement loop should do next.
    #[must_use]
    pub fn directive(&self) -> EscalationDirective {
        match self.state {
            EscalationState::Drafted => match self.initial_action {
                PolicyAction::None => EscalationDirective::AcceptDraft,
                PolicyAction::SoftRewrite => EscalationDirective::RewriteSoft,
                PolicyAction::HardRewrite => EscalationDirective::RewriteHard,
                PolicyAction::Block => EscalationDirective::Block,
            },
            EscalationState::SoftAttempted => EscalationDirective::RewriteHard,
            EscalationState::HardAttempted => EscalationDirective::Block,
            EscalationState::Resolved => match self.resolved {
                Some(PolicyAction::None) => EscalationDirective::AcceptDraft,
                _ => EscalationDirective::Block,
            },
        }
    }

    /// Evaluates one rewrite attempt against its re-score. Returns `true`
    /// when the attempt is accepted; otherwise the machine escalates.
    pub fn record_rewrite(&mut self, profile: RewriteProfile, rescored: &RiskScore) -> bool {
        let legal = matches!(
            (profile, self.state),
            (RewriteProfile::Soft, EscalationState::Drafted)
                | (
                    RewriteProfile::Hard,
                    EscalationState::Drafted | EscalationState::SoftAttempted
                )
        );
        if !legal {
            return false;
        }

        let action = classify_action(rescored, self.thresholds);
        let below_block = rescored.total < self.thresholds.block_min_total;
        let at_user_floor = rescored.total <= self.user_floor
            && rescored.total <= self.draft_total
            && below_block;

        let accepted = match profile {
            RewriteProfile::Soft => action == PolicyAction::None || at_user_floor,
            RewriteProfile::Hard => {
                action == PolicyAction::None
                    || at_user_floor
                    || (rescored.total < self.draft_total && below_block)
            }
        };

        if accepted {
            self.state = EscalationState::Resolved;
            self.resolved = Some(match profile {
                RewriteProfile::Soft => PolicyAction::SoftRewrite,
                RewriteProfile::Hard => PolicyAction::HardRewrite,
            });
        } else {
            self.state = match profile {
                RewriteProfile::Soft => EscalationState::SoftAttempted,
                RewriteProfile::Hard => EscalationState::HardAttempted,
            };
        }
        accepted
    }

    /// Records a rewrite-capability failure (error or timeout): the attempt
    /// counts as spent and the machine escalates.
    pub fn record_failure(&mut self, profile: RewriteProfile) {
        match (profile, self.state) {
            (RewriteProfile::Soft, EscalationState::Drafted) => {
                self.state = EscalationState::SoftAttempted;
            }
            (
                RewriteProfile::Hard,
                EscalationState::Drafted | EscalationState::SoftAttempted,
            ) => {
                self.state = EscalationState::HardAttempted;
            }
            _ => {}
        }
    }

    /// Terminal transition to block.
    pub fn resolve_block(&mut self) {
        self.state = EscalationState::Resolved;
        self.resolved = Some(PolicyAction::Block);
    }
}

/// Matches first/second-person identity and trait language. Applied to
/// belief keys/values and task titles at admission time; a match rejects
/// the write.
pub struct IdentityScreen {
    patterns: Vec<Regex>,
}

impl IdentityScreen {
    /// Compiles the identity-risk patterns.
    ///
    /// # Errors
    /// Returns [`GateError::Configuration`] when a pattern fails to
    /// compile.
    pub fn new() -> Result<Self, GateError> {
        let raw = [
            r"\byou are\b",
            r"\bi am\b",
            r"\byou're\b",
            r"\bi'm\b",
            r"\balways\b",
            r"\bnever\b",
            r"\bkind of person\b",
            r"\bpersonality\b",
            r"\btrait\b",
            r"\bpsycholog",
            r"\bdepress",
            r"\banxious\b",
        ];
        let mut patterns = Vec::with_capacity(raw.len());
        for pattern in raw {
            patterns.push(Regex::new(pattern).map_err(|err| {
                GateError::Configuration(format!("invalid identity pattern '{pattern}': {err}"))
            })?);
        }
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn is_risky(&self, text: &str) -> bool {
        let normalized = normalize_text(text);
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(&normalized))
    }
}

/// A candidate semantic belief extracted from an explicit user statement.
#[derive(Debug, Clone, PartialEq)]
pub struct BeliefCandidate {
    pub namespace: BeliefNamespace,
    pub key: String,
    pub value: Value,
    pub signal: f32,
    pub rationale: String,
}

/// Extracts belief candidates from explicit user statements only. Nothing
/// is ever inferred from assistant text or from unstated intent.
pub struct BeliefExtractor {
    no_emojis: Regex,
    concise: Regex,
    detailed: Regex,
    formal: Regex,
    citations: Regex,
    project_context: Regex,
    project_stack: Regex,
}

impl BeliefExtractor {
    /// Compiles the explicit-statement patterns.
    ///
    /// # Errors
    /// Returns [`GateError::Configuration`] when a pattern fails to
    /// compile.
    pub fn new() -> Result<Self, GateError> {
        let compile = |raw: &str| {
            Regex::new(raw).map_err(|err| {
                GateError::Configuration(format!("invalid belief pattern '{raw}': {err}"))
            })
        };
        Ok(Self {
            no_emojis: compile(r"\bno emojis\b|\bavoid emojis\b|\bdon't use emojis\b")?,
            concise: compile(r"\b(?:be )?concise\b|\bshort\b|\bbrief\b")?,
            detailed: compile(r"\bmore detail\b|\bdetailed\b|\bgo deeper\b|\blonger\b")?,
            formal: compile(r"\bformal\b|\bbusiness\b|\bprofessional\b")?,
            citations: compile(r"\bcitations\b|\bsources\b|\breferences?\b")?,
            project_context: compile(r"(?m)^project context:\s*(.+)$")?,
            project_stack: compile(r"(?m)^project stack:\s*(.+)$")?,
        })
    }

    #[must_use]
    pub fn extract(&self, user_text: &str) -> Vec<BeliefCandidate> {
        let normalized = normalize_text(user_text.trim());
        let mut candidates = Vec::new();

        if self.no_emojis.is_match(&normalized) {
            candidates.push(candidate(
                BeliefNamespace::PrefFormat,
                "pref.format.no_emojis",
                Value::Bool(true),
                1.0,
                "user explicitly requested no emojis",
            ));
        }
        if self.concise.is_match(&normalized) {
            candidates.push(candidate(
                BeliefNamespace::PrefFormat,
                "pref.format.verbosity",
                Value::String("concise".to_string()),
                0.8,
                "user requested concise responses",
            ));
        }
        if self.detailed.is_match(&normalized) {
            candidates.push(candidate(
                BeliefNamespace::PrefFormat,
                "pref.format.verbosity",
                Value::String("detailed".to_string()),
                0.8,
                "user requested more detailed responses",
            ));
        }
        if self.formal.is_match(&normalized) {
            candidates.push(candidate(
                BeliefNamespace::PrefTone,
                "pref.tone.businesslike",
                Value::Bool(true),
                0.7,
                "user requested a business or formal tone",
            ));
        }
        if self.citations.is_match(&normalized) {
            candidates.push(candidate(
                BeliefNamespace::Constraint,
                "constraint.use_citations",
                Value::Bool(true),
                0.6,
                "user requested citations or sources",
            ));
        }
        if let Some(captures) = self.project_context.captures(&normalized) {
            if let Some(summary) = captures.get(1) {
                candidates.push(candidate(
                    BeliefNamespace::ProjectContext,
                    "project.context.summary",
                    Value::String(summary.as_str().trim().to_string()),
                    0.7,
                    "user explicitly set the project context",
                ));
            }
        }
        if let Some(captures) = self.project_stack.captures(&normalized) {
            if let Some(summary) = captures.get(1) {
                candidates.push(candidate(
                    BeliefNamespace::ProjectStack,
                    "project.stack.summary",
                    Value::String(summary.as_str().trim().to_string()),
                    0.7,
                    "user explicitly set the project stack",
                ));
            }
        }

        candidates
    }
}

fn candidate(
    namespace: BeliefNamespace,
    key: &str,
    value: Value,
    signal: f32,
    rationale: &str,
) -> BeliefCandidate {
    BeliefCandidate {
        namespace,
        key: key.to_string(),
        value,
        signal,
        rationale: rationale.to_string(),
    }
}

/// An explicit task command parsed from user text. Only syntactically
/// anchored prefixes count; implicit phrasing ("don't let me forget")
/// never parses and is left to the risk scorer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TaskCommand {
    Create { title: String },
}

#[must_use]
pub fn parse_task_command(user_text: &str) -> Option<TaskCommand> {
    let trimmed = user_text.trim();
    let lowered = trimmed.to_lowercase();
    for prefix in ["add task:", "track this task:"] {
        if lowered.starts_with(prefix) {
            let title = trimmed[prefix.len()..].trim();
            if title.is_empty() {
                return None;
            }
            return Some(TaskCommand::Create {
                title: title.to_string(),
            });
        }
    }
    None
}

/// Decay-weighted episode strength, computed at read time from the stored
/// counters: exponential decay since the last access (slowed by
/// reinforcement), a logarithmic boost per past retrieval, and damping for
/// negative valence.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn episode_strength(
    meta: &EpisodeMeta,
    created_ts: OffsetDateTime,
    now: OffsetDateTime,
    ruleset: &GovernanceRuleset,
) -> f32 {
    let reference = meta.last_access_ts.unwrap_or(created_ts);
    let age_days = days_since(reference, now);

    let time_decay = (-ruleset.strength_lambda_per_day * age_days
        / (1.0 + ruleset.strength_reinforcement_alpha * meta.reinforcement))
        .exp();
    let retrieval_boost =
        1.0 + ruleset.strength_access_beta * (1.0 + meta.access_count as f32).ln();
    let negative_damping = 1.0 - ruleset.strength_negative_gamma * (-meta.valence).max(0.0);

    (meta.base_strength * time_decay * retrieval_boost * negative_damping).max(0.0)
}

#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / ((norm_a + 1e-12) * (norm_b + 1e-12))
}

/// Confidence after elapsed time without reinforcement.
#[must_use]
pub fn decayed_confidence(confidence: f32, age_days: f32, ruleset: &GovernanceRuleset) -> f32 {
    let decayed = confidence * (-ruleset.belief_decay_rate_per_day * age_days).exp();
    decayed.clamp(
        ruleset.belief_confidence_floor,
        ruleset.belief_confidence_ceiling,
    )
}

/// Confidence after an accepted reinforcement: a step toward certainty,
/// capped below 1.0 so no belief becomes unrevisable.
#[must_use]
pub fn reinforced_confidence(confidence: f32, ruleset: &GovernanceRuleset) -> f32 {
    (confidence + ruleset.belief_reinforce_step * (1.0 - confidence))
        .min(ruleset.belief_confidence_ceiling)
}

/// Confidence after a contesting signal: a proportional cut, floored above
/// zero so a single contradiction cannot erase history.
#[must_use]
pub fn contested_confidence(confidence: f32, ruleset: &GovernanceRuleset) -> f32 {
    (confidence - ruleset.belief_contest_step * confidence).max(ruleset.belief_confidence_floor)
}

/// Status transition for a belief after a confidence or signal change.
/// Deprecation is sticky; repeated negative signals or low confidence mark
/// a belief contested before it is ever deprecated.
#[must_use]
pub fn belief_status_transition(
    confidence: f32,
    status: BeliefStatus,
    negative_count: u32,
    ruleset: &GovernanceRuleset,
) -> BeliefStatus {
    if status == BeliefStatus::Deprecated {
        return BeliefStatus::Deprecated;
    }
    if confidence < ruleset.belief_deprecate_confidence {
        return BeliefStatus::Deprecated;
    }
    if negative_count >= ruleset.belief_negative_contest_threshold
        || confidence < ruleset.belief_contest_confidence
    {
        return BeliefStatus::Contested;
    }
    BeliefStatus::Active
}

/// Truncated SHA-256 content hash (16 hex chars), used to fingerprint
/// draft/final texts in audit records.
#[must_use]
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.chars().take(16).collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GateError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, GateError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GateError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(GateError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`GateError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GateError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| GateError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn days_since(earlier: OffsetDateTime, later: OffsetDateTime) -> f32 {
    if later <= earlier {
        return 0.0;
    }

    let elapsed = later - earlier;
    elapsed.whole_seconds() as f32 / Duration::DAY.whole_seconds() as f32
}
