//! Core data model: constraint definitions, schedules and evaluation results.
//!
//! A constraint is split into a serializable [`ConstraintDefinition`] (the data
//! half) and a [`ConstraintEvaluator`] implementation (the behavior half).
//! The engine never mutates a [`Schedule`]; it only reads it and produces one
//! [`EvaluationResult`] per constraint.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of how binding a constraint is.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Hardness {
    /// Must be satisfied for the schedule to be feasible.
    Hard,
    /// Weighted penalty when violated.
    Soft,
    /// Lowest-priority weighted signal.
    Preference,
}

/// Outcome classification of a single constraint evaluation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Satisfied,
    Violated,
    PartiallySatisfied,
    /// Produced when the evaluation function failed or exhausted retries.
    /// Never silently dropped.
    NotEvaluated,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

/// The subset of entities a constraint applies to.
///
/// The engine only uses the scope for filtering during incremental
/// evaluation; the contents are otherwise opaque to it. A scope with no
/// entities and `is_global == false` is considered undefined and disqualifies
/// the constraint from incremental result reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintScope {
    #[serde(default)]
    pub sports: HashSet<String>,
    #[serde(default)]
    pub teams: HashSet<String>,
    #[serde(default)]
    pub venues: HashSet<String>,
    /// A global constraint applies to every entity.
    #[serde(default)]
    pub is_global: bool,
}

impl ConstraintScope {
    pub fn global() -> Self {
        Self {
            is_global: true,
            ..Default::default()
        }
    }

    /// Whether this scope names anything at all.
    pub fn is_defined(&self) -> bool {
        self.is_global
            || !self.sports.is_empty()
            || !self.teams.is_empty()
            || !self.venues.is_empty()
    }

    /// Whether any scoped entity appears in `entities`.
    pub fn intersects(&self, entities: &HashSet<String>) -> bool {
        if self.is_global {
            return true;
        }
        self.sports.iter().any(|id| entities.contains(id))
            || self.teams.iter().any(|id| entities.contains(id))
            || self.venues.iter().any(|id| entities.contains(id))
    }
}

/// Serializable definition of a constraint. Behavior lives in the paired
/// [`ConstraintEvaluator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintDefinition {
    pub id: String,
    pub name: String,
    /// Open set: "temporal", "spatial", "logical", ...
    pub constraint_type: String,
    pub hardness: Hardness,
    /// Relative weight in [0, 100]. Out-of-range values are rejected at
    /// validation, not clamped.
    pub weight: f64,
    /// Ordering tie-break among independent constraints, not a correctness
    /// input.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scope: ConstraintScope,
    /// Free-form configuration forwarded to the evaluator.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Ids of constraints that must be evaluated before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub cacheable: bool,
    #[serde(default = "default_true")]
    pub parallelizable: bool,
    /// Overrides the derived cache key when present.
    #[serde(default)]
    pub custom_cache_key: Option<String>,
}

impl ConstraintDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, hardness: Hardness) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            constraint_type: "logical".to_string(),
            hardness,
            weight: 50.0,
            priority: 0,
            scope: ConstraintScope::default(),
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            cacheable: true,
            parallelizable: true,
            custom_cache_key: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
#[error("constraint evaluation failed: {0}")]
pub struct EvaluationError(pub String);

pub type EvaluatorResult = Result<EvaluationResult, EvaluationError>;

/// The behavior half of a constraint.
///
/// Implementations must be side-effect-free with respect to the schedule;
/// they may allocate and may be slow, which is why evaluations run under the
/// worker pool's timeout.
#[async_trait]
pub trait ConstraintEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        schedule: &Schedule,
        parameters: &HashMap<String, Value>,
    ) -> EvaluatorResult;
}

/// Adapter for plain functions and closures.
pub struct FnEvaluator<F>(F);

impl<F> FnEvaluator<F>
where
    F: Fn(&Schedule, &HashMap<String, Value>) -> EvaluatorResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ConstraintEvaluator for FnEvaluator<F>
where
    F: Fn(&Schedule, &HashMap<String, Value>) -> EvaluatorResult + Send + Sync,
{
    async fn evaluate(
        &self,
        schedule: &Schedule,
        parameters: &HashMap<String, Value>,
    ) -> EvaluatorResult {
        (self.0)(schedule, parameters)
    }
}

/// A definition paired with its evaluator.
#[derive(Clone)]
pub struct Constraint {
    pub definition: ConstraintDefinition,
    pub evaluator: Arc<dyn ConstraintEvaluator>,
}

impl Constraint {
    pub fn new(definition: ConstraintDefinition, evaluator: Arc<dyn ConstraintEvaluator>) -> Self {
        Self {
            definition,
            evaluator,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub venue: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub week: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMetadata {
    pub created_at: DateTime<Utc>,
    /// Participates in cache-key derivation; bump it whenever the schedule
    /// content changes.
    pub updated_at: DateTime<Utc>,
}

impl Default for ScheduleMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }
}

/// Versioned aggregate of teams, venues and games. Evaluation input only;
/// never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub sport: String,
    pub season: String,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub venues: Vec<Venue>,
    #[serde(default)]
    pub games: Vec<Game>,
    #[serde(default)]
    pub metadata: ScheduleMetadata,
}

impl Schedule {
    pub fn new(id: impl Into<String>, sport: impl Into<String>, season: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sport: sport.into(),
            season: season.into(),
            teams: Vec::new(),
            venues: Vec::new(),
            games: Vec::new(),
            metadata: ScheduleMetadata::default(),
        }
    }

    /// Version token used in cache keys.
    pub fn version_token(&self) -> i64 {
        self.metadata.updated_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub affected_entities: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub possible_resolutions: Vec<String>,
}

/// Per-constraint outcome of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub constraint_id: String,
    pub status: ResultStatus,
    pub satisfied: bool,
    /// Clamped to [0, 1] at construction.
    pub score: f64,
    pub message: String,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl EvaluationResult {
    fn base(constraint_id: impl Into<String>, status: ResultStatus, score: f64) -> Self {
        Self {
            constraint_id: constraint_id.into(),
            status,
            satisfied: status == ResultStatus::Satisfied,
            score: score.clamp(0.0, 1.0),
            message: String::new(),
            violations: Vec::new(),
            suggestions: Vec::new(),
            confidence: None,
            execution_time_ms: 0,
        }
    }

    pub fn satisfied(constraint_id: impl Into<String>, score: f64) -> Self {
        Self::base(constraint_id, ResultStatus::Satisfied, score)
    }

    pub fn violated(
        constraint_id: impl Into<String>,
        score: f64,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            violations,
            ..Self::base(constraint_id, ResultStatus::Violated, score)
        }
    }

    pub fn partially_satisfied(
        constraint_id: impl Into<String>,
        score: f64,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            violations,
            ..Self::base(constraint_id, ResultStatus::PartiallySatisfied, score)
        }
    }

    pub fn not_evaluated(constraint_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::base(constraint_id, ResultStatus::NotEvaluated, 0.0)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
