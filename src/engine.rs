//! Public entry point: orchestrates grouping, incremental reuse, the
//! pipeline and score aggregation.
//!
//! ## Overall score
//!
//! The aggregate combines three components with the documented
//! [`ScoreWeights`] (hard 0.5, soft 0.3, preference 0.2 by default):
//! the fraction of HARD constraints satisfied, the weight-weighted mean
//! score of SOFT constraints, and the same for PREFERENCE constraints. The
//! weight of any category absent from the input is redistributed
//! proportionally across the present ones. A category with no constraints
//! reports a neutral 1.0 in its dedicated field.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::cache::{CacheStats, ResultCache};
use crate::config::{EngineConfig, GroupingStrategy, PerformanceProfile};
use crate::error::{EngineResult, Error};
use crate::model::{
    Constraint, ConstraintDefinition, EvaluationResult, Hardness, ResultStatus, Schedule,
};
use crate::pipeline::{ConstraintGroup, Pipeline, PipelineContext, PipelineError};
use crate::worker::{ParallelEvaluator, PoolStats, WorkerPool};

/// Caller-supplied input for one evaluation run.
pub struct EvaluationContext {
    pub schedule: Schedule,
    pub constraints: Vec<Constraint>,
    /// Previous run's results, enabling incremental reuse.
    pub previous_results: Option<HashMap<String, EvaluationResult>>,
    /// Entity ids changed since the previous run.
    pub modified_entities: Option<HashSet<String>>,
}

impl EvaluationContext {
    pub fn new(schedule: Schedule, constraints: Vec<Constraint>) -> Self {
        Self {
            schedule,
            constraints,
            previous_results: None,
            modified_entities: None,
        }
    }

    pub fn incremental(
        mut self,
        previous_results: HashMap<String, EvaluationResult>,
        modified_entities: HashSet<String>,
    ) -> Self {
        self.previous_results = Some(previous_results);
        self.modified_entities = Some(modified_entities);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub overall_score: f64,
    pub hard_constraints_satisfied: usize,
    pub hard_constraints_total: usize,
    pub soft_constraints_score: f64,
    pub preference_score: f64,
    pub execution_time_ms: u64,
    /// One entry per input constraint (fewer only when the run aborted
    /// early), sorted by constraint id.
    pub results: Vec<EvaluationResult>,
    pub suggestions: Vec<String>,
    pub warnings: Vec<String>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub evaluations: u64,
    pub total_execution_ms: u64,
    pub avg_execution_ms: f64,
    pub cache: Option<CacheStats>,
    pub pool: PoolStats,
}

/// The constraint evaluation engine.
pub struct Engine {
    config: EngineConfig,
    cache: Option<Arc<ResultCache>>,
    evaluator: Arc<ParallelEvaluator>,
    pipeline: Pipeline,
    evaluations: AtomicU64,
    total_execution_ms: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let cache = config
            .cache
            .clone()
            .map(|cache_config| Arc::new(ResultCache::new(cache_config)));
        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        let evaluator = Arc::new(ParallelEvaluator::new(pool, config.evaluator.clone()));
        let pipeline = Pipeline::standard(config.pipeline.clone());
        info!(
            max_workers = config.pool.max_workers,
            grouping = %config.grouping,
            cached = cache.is_some(),
            "engine initialized"
        );
        Ok(Self {
            config,
            cache,
            evaluator,
            pipeline,
            evaluations: AtomicU64::new(0),
            total_execution_ms: AtomicU64::new(0),
        })
    }

    pub fn with_profile(profile: PerformanceProfile) -> EngineResult<Self> {
        Self::new(EngineConfig::for_profile(profile))
    }

    /// Evaluates a schedule against a constraint set.
    ///
    /// Per-constraint failures degrade to `NotEvaluated` results; only
    /// validation errors, dependency cycles and fatal stage errors fail the
    /// run as a whole.
    #[tracing::instrument(skip(self, context), fields(schedule_id = %context.schedule.id), level = "debug")]
    pub async fn evaluate(&self, context: EvaluationContext) -> EngineResult<AggregateResult> {
        let started = Instant::now();
        let EvaluationContext {
            schedule,
            constraints,
            previous_results,
            modified_entities,
        } = context;
        if constraints.is_empty() {
            return Err(Error::Pipeline(PipelineError::Validation(
                "no constraints to evaluate".to_string(),
            )));
        }
        let schedule = Arc::new(schedule);
        let definitions: HashMap<String, ConstraintDefinition> = constraints
            .iter()
            .map(|c| (c.definition.id.clone(), c.definition.clone()))
            .collect();

        let (mut results, active) =
            partition_incremental(constraints, &previous_results, &modified_entities);
        let reused = results.len();
        if reused > 0 {
            debug!(reused, "reusing previous results for unaffected constraints");
        }

        let mut warnings = Vec::new();
        let mut aborted = false;
        if !active.is_empty() {
            let mut pipeline_ctx = PipelineContext::new(schedule.clone(), active);
            pipeline_ctx = pipeline_ctx.with_evaluator(self.evaluator.clone());
            if let Some(cache) = &self.cache {
                pipeline_ctx = pipeline_ctx.with_cache(cache.clone());
            }
            if let Some(groups) = group_constraints(&pipeline_ctx.constraints, self.config.grouping)
            {
                pipeline_ctx = pipeline_ctx.with_groups(groups);
            }
            let out = self.pipeline.execute(pipeline_ctx).await.map_err(|failure| {
                error!(
                    stage = %failure.stage,
                    context = ?failure.context,
                    "pipeline failed"
                );
                Error::from(failure.error)
            })?;
            warnings.extend(out.warnings);
            aborted = out.aborted;
            results.extend(out.results);
        }

        // Exactly one result per input constraint unless the run aborted
        // deliberately.
        if !aborted {
            for id in definitions.keys() {
                if !results.contains_key(id) {
                    results.insert(
                        id.clone(),
                        EvaluationResult::not_evaluated(id.clone(), "no result produced"),
                    );
                }
            }
        }

        let execution_time_ms = started.elapsed().as_millis() as u64;
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);

        Ok(aggregate(
            &definitions,
            results,
            warnings,
            aborted,
            execution_time_ms,
            &self.config,
        ))
    }

    /// Pre-populates the cache so the first real evaluation hits warm
    /// entries.
    pub async fn warm_cache(
        &self,
        schedule: Schedule,
        constraints: Vec<Constraint>,
    ) -> EngineResult<()> {
        self.evaluate(EvaluationContext::new(schedule, constraints))
            .await
            .map(|_| ())
    }

    /// Drops cache entries matching `pattern`; used when upstream schedule
    /// or constraint data changes. Returns the count removed.
    pub async fn invalidate_cache(&self, pattern: &str) -> usize {
        match &self.cache {
            Some(cache) => cache.invalidate(pattern).await,
            None => 0,
        }
    }

    pub async fn stats(&self) -> EngineStats {
        let evaluations = self.evaluations.load(Ordering::Relaxed);
        let total_execution_ms = self.total_execution_ms.load(Ordering::Relaxed);
        let cache = match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        };
        EngineStats {
            evaluations,
            total_execution_ms,
            avg_execution_ms: if evaluations == 0 {
                0.0
            } else {
                total_execution_ms as f64 / evaluations as f64
            },
            cache,
            pool: self.evaluator.pool_stats(),
        }
    }

    /// Drains the worker pool and releases resources.
    pub async fn shutdown(&self) {
        self.evaluator.shutdown().await;
        info!("engine shut down");
    }
}

/// Splits constraints into (reused results, still-to-evaluate) based on the
/// schedule delta. Constraints without a well-defined scope always
/// re-evaluate.
fn partition_incremental(
    constraints: Vec<Constraint>,
    previous_results: &Option<HashMap<String, EvaluationResult>>,
    modified_entities: &Option<HashSet<String>>,
) -> (HashMap<String, EvaluationResult>, Vec<Constraint>) {
    let (Some(previous), Some(modified)) = (previous_results, modified_entities) else {
        return (HashMap::new(), constraints);
    };
    let mut reused = HashMap::new();
    let mut active = Vec::new();
    for constraint in constraints {
        let scope = &constraint.definition.scope;
        if scope.is_defined() && !scope.intersects(modified) {
            if let Some(previous_result) = previous.get(constraint.id()) {
                reused.insert(constraint.definition.id.clone(), previous_result.clone());
                continue;
            }
        }
        active.push(constraint);
    }
    (reused, active)
}

/// Partitions constraints into named groups per the configured strategy.
///
/// Groups evaluate one after another, so a strategy must never place a
/// constraint in an earlier group than one of its dependencies.
fn group_constraints(
    constraints: &[Constraint],
    strategy: GroupingStrategy,
) -> Option<Vec<ConstraintGroup>> {
    match strategy {
        GroupingStrategy::None => None,
        GroupingStrategy::ByHardness => {
            // Each dependency cluster lands in the bucket of its most
            // binding member.
            let clusters = dependency_clusters(constraints);
            let mut bucket_of: HashMap<usize, usize> = HashMap::new();
            for (index, constraint) in constraints.iter().enumerate() {
                let rank = hardness_rank(constraint.definition.hardness);
                bucket_of
                    .entry(clusters[index])
                    .and_modify(|bucket| *bucket = (*bucket).min(rank))
                    .or_insert(rank);
            }
            let mut buckets: [Vec<String>; 3] = Default::default();
            for (index, constraint) in constraints.iter().enumerate() {
                buckets[bucket_of[&clusters[index]]].push(constraint.definition.id.clone());
            }
            let [hard, soft, preferences] = buckets;
            let groups: Vec<ConstraintGroup> = [
                ("hard", hard),
                ("soft", soft),
                ("preferences", preferences),
            ]
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(name, constraint_ids)| ConstraintGroup {
                name: name.to_string(),
                constraint_ids,
            })
            .collect();
            Some(groups)
        }
        GroupingStrategy::ByIndependence => {
            // Dependency-free constraints form the first group, so members
            // of the second group always follow their dependencies.
            let mut independent = Vec::new();
            let mut dependent = Vec::new();
            for constraint in constraints {
                let def = &constraint.definition;
                if def.dependencies.is_empty() && def.parallelizable {
                    independent.push(def.id.clone());
                } else {
                    dependent.push(def.id.clone());
                }
            }
            let groups: Vec<ConstraintGroup> = [
                ("independent", independent),
                ("dependent", dependent),
            ]
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(name, constraint_ids)| ConstraintGroup {
                name: name.to_string(),
                constraint_ids,
            })
            .collect();
            Some(groups)
        }
    }
}

fn hardness_rank(hardness: Hardness) -> usize {
    match hardness {
        Hardness::Hard => 0,
        Hardness::Soft => 1,
        Hardness::Preference => 2,
    }
}

/// Union-find over (undirected) dependency edges. Returns each constraint's
/// cluster representative, indexed like the input.
fn dependency_clusters(constraints: &[Constraint]) -> Vec<usize> {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let index: HashMap<&str, usize> = constraints
        .iter()
        .enumerate()
        .map(|(i, c)| (c.definition.id.as_str(), i))
        .collect();
    let mut parent: Vec<usize> = (0..constraints.len()).collect();
    for (i, constraint) in constraints.iter().enumerate() {
        for dep in &constraint.definition.dependencies {
            if let Some(&j) = index.get(dep.as_str()) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a] = b;
                }
            }
        }
    }
    (0..constraints.len())
        .map(|i| find(&mut parent, i))
        .collect()
}

fn aggregate(
    definitions: &HashMap<String, ConstraintDefinition>,
    results: HashMap<String, EvaluationResult>,
    warnings: Vec<String>,
    aborted: bool,
    execution_time_ms: u64,
    config: &EngineConfig,
) -> AggregateResult {
    let mut hard_total = 0usize;
    let mut hard_satisfied = 0usize;
    let mut soft_weight = 0.0;
    let mut soft_weighted_score = 0.0;
    let mut preference_weight = 0.0;
    let mut preference_weighted_score = 0.0;
    let mut suggestions: Vec<String> = Vec::new();

    for (id, result) in &results {
        let Some(def) = definitions.get(id) else {
            continue;
        };
        match def.hardness {
            Hardness::Hard => {
                hard_total += 1;
                if result.status == ResultStatus::Satisfied {
                    hard_satisfied += 1;
                }
            }
            Hardness::Soft => {
                soft_weight += def.weight;
                soft_weighted_score += def.weight * result.score;
            }
            Hardness::Preference => {
                preference_weight += def.weight;
                preference_weighted_score += def.weight * result.score;
            }
        }
        for suggestion in &result.suggestions {
            if !suggestions.contains(suggestion) {
                suggestions.push(suggestion.clone());
            }
        }
    }

    let hard_component = (hard_total > 0).then(|| hard_satisfied as f64 / hard_total as f64);
    let soft_component = (soft_weight > 0.0).then(|| soft_weighted_score / soft_weight);
    let preference_component =
        (preference_weight > 0.0).then(|| preference_weighted_score / preference_weight);

    let weights = &config.score_weights;
    let components = [
        (weights.hard, hard_component),
        (weights.soft, soft_component),
        (weights.preference, preference_component),
    ];
    let present_weight: f64 = components
        .iter()
        .filter(|(_, component)| component.is_some())
        .map(|(weight, _)| weight)
        .sum();
    let overall_score = if present_weight > 0.0 {
        components
            .iter()
            .filter_map(|(weight, component)| component.map(|c| weight / present_weight * c))
            .sum()
    } else {
        0.0
    };

    let mut results: Vec<EvaluationResult> = results.into_values().collect();
    results.sort_by(|a, b| a.constraint_id.cmp(&b.constraint_id));

    AggregateResult {
        overall_score,
        hard_constraints_satisfied: hard_satisfied,
        hard_constraints_total: hard_total,
        soft_constraints_score: soft_component.unwrap_or(1.0),
        preference_score: preference_component.unwrap_or(1.0),
        execution_time_ms,
        results,
        suggestions,
        warnings,
        aborted,
    }
}
