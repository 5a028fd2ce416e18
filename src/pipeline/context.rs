//! Per-run mutable context threaded through the pipeline stages.
//!
//! One context per `execute` call, mutated only by the single stage
//! currently running; it is never shared across concurrent runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cache::ResultCache;
use crate::dependency::DependencyGraph;
use crate::model::{Constraint, ConstraintDefinition, EvaluationResult, Hardness, ResultStatus, Schedule};
use crate::worker::ParallelEvaluator;

/// A named batch of constraints produced by a grouping strategy. Groups are
/// evaluated in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintGroup {
    pub name: String,
    pub constraint_ids: Vec<String>,
}

pub struct PipelineContext {
    pub run_id: String,
    pub schedule: Arc<Schedule>,
    /// Active constraints; shrinks as stages filter out cached ones.
    pub constraints: Vec<Constraint>,
    /// Definitions of every input constraint, keyed by id. Never shrinks;
    /// used for hardness/cacheability lookups after the active list has been
    /// filtered.
    pub definitions: HashMap<String, ConstraintDefinition>,
    pub graph: Option<DependencyGraph>,
    pub groups: Option<Vec<ConstraintGroup>>,
    /// Constraint id -> result. The run's primary output.
    pub results: HashMap<String, EvaluationResult>,
    /// Ids whose result came from the cache; excluded from cache write-back.
    pub cached_ids: HashSet<String>,
    pub cache: Option<Arc<ResultCache>>,
    pub evaluator: Option<Arc<ParallelEvaluator>>,
    pub started_at: Instant,
    pub stage_timings: Vec<(String, Duration)>,
    pub warnings: Vec<String>,
    pub aborted: bool,
}

impl PipelineContext {
    pub fn new(schedule: Arc<Schedule>, constraints: Vec<Constraint>) -> Self {
        let definitions = constraints
            .iter()
            .map(|c| (c.definition.id.clone(), c.definition.clone()))
            .collect();
        Self {
            run_id: Uuid::new_v4().to_string(),
            schedule,
            constraints,
            definitions,
            graph: None,
            groups: None,
            results: HashMap::new(),
            cached_ids: HashSet::new(),
            cache: None,
            evaluator: None,
            started_at: Instant::now(),
            stage_timings: Vec::new(),
            warnings: Vec::new(),
            aborted: false,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<ParallelEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_groups(mut self, groups: Vec<ConstraintGroup>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Id of a HARD constraint whose current result is VIOLATED, if any.
    pub fn hard_violation(&self) -> Option<String> {
        self.results
            .iter()
            .find(|(id, result)| {
                result.status == ResultStatus::Violated
                    && self
                        .definitions
                        .get(*id)
                        .map(|d| d.hardness == Hardness::Hard)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("schedule", &self.schedule.id)
            .field("active_constraints", &self.constraints.len())
            .field("results", &self.results.len())
            .field("cached_ids", &self.cached_ids.len())
            .field("warnings", &self.warnings)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}
