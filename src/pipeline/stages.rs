//! The six default pipeline stages.
//!
//! Each stage mutates the shared [`PipelineContext`] and reports failure
//! through [`PipelineError`]; the pipeline driver in `mod.rs` owns retry,
//! timeout and recoverable-vs-fatal classification.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::context::PipelineContext;
use super::{PipelineError, PipelineResult};
use crate::cache::cache_key;
use crate::config::PostProcessingConfig;
use crate::dependency::DependencyGraph;
use crate::model::{Constraint, EvaluationResult, Hardness, ResultStatus};

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the stage. The driver races this future against a timeout and
    /// may retry it, so implementations must not leave the context
    /// half-mutated across an await point: commit after the last await, and
    /// tolerate state committed by an earlier attempt.
    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()>;

    fn can_skip(&self, _ctx: &PipelineContext) -> bool {
        false
    }
}

/// Rejects malformed input before any work happens. Failures here are fatal
/// and gain nothing from retries.
pub struct ValidationStage;

#[async_trait]
impl PipelineStage for ValidationStage {
    fn name(&self) -> &str {
        "validation"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        if ctx.constraints.is_empty() {
            return Err(PipelineError::Validation(
                "no constraints to evaluate".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for constraint in &ctx.constraints {
            let def = &constraint.definition;
            if !seen.insert(def.id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "duplicate constraint id '{}'",
                    def.id
                )));
            }
            if !(0.0..=100.0).contains(&def.weight) {
                return Err(PipelineError::Validation(format!(
                    "constraint '{}' has weight {} outside [0, 100]",
                    def.id, def.weight
                )));
            }
            if def.priority < 0 {
                return Err(PipelineError::Validation(format!(
                    "constraint '{}' has negative priority {}",
                    def.id, def.priority
                )));
            }
        }
        Ok(())
    }
}

/// Moves fresh cached results into the results map and keeps only
/// constraints that must be (re-)evaluated.
pub struct CacheLookupStage;

#[async_trait]
impl PipelineStage for CacheLookupStage {
    fn name(&self) -> &str {
        "cache_lookup"
    }

    fn can_skip(&self, ctx: &PipelineContext) -> bool {
        ctx.cache.is_none()
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let Some(cache) = ctx.cache.clone() else {
            return Ok(());
        };
        // Read-only scan; the context is mutated only once every lookup has
        // finished, so a timed-out attempt retries against intact input.
        let mut hits: Vec<(String, EvaluationResult)> = Vec::new();
        for constraint in &ctx.constraints {
            if !constraint.definition.cacheable {
                continue;
            }
            let key = cache_key(&constraint.definition, &ctx.schedule);
            if let Some(hit) = cache.get(&key).await {
                debug!(constraint_id = %constraint.definition.id, "cache hit");
                hits.push((constraint.definition.id.clone(), hit));
            }
        }
        let hit_ids: HashSet<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        ctx.constraints
            .retain(|c| !hit_ids.contains(c.definition.id.as_str()));
        for (id, hit) in hits {
            ctx.cached_ids.insert(id.clone());
            ctx.results.insert(id, hit);
        }
        Ok(())
    }
}

/// Reorders the active constraints into dependency order. A cycle aborts the
/// run.
pub struct DependencyResolutionStage;

#[async_trait]
impl PipelineStage for DependencyResolutionStage {
    fn name(&self) -> &str {
        "dependency_resolution"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let definitions: Vec<_> = ctx
            .constraints
            .iter()
            .map(|c| c.definition.clone())
            .collect();
        let graph = DependencyGraph::build(&definitions);
        let order = graph.evaluation_order()?;
        let index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        ctx.constraints.sort_by_key(|c| {
            index
                .get(c.definition.id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
        ctx.graph = Some(graph);
        Ok(())
    }
}

/// Runs the actual evaluations, honoring grouping, parallelizability and
/// dependency order. When configured, aborts between groups as soon as a
/// hard constraint is violated.
pub struct EvaluationStage {
    abort_on_hard_violation: bool,
}

impl EvaluationStage {
    pub fn new(abort_on_hard_violation: bool) -> Self {
        Self {
            abort_on_hard_violation,
        }
    }

    /// Evaluates one group and returns its results; the caller commits them
    /// into the context. Members whose result is already present (committed
    /// by an earlier, partially timed-out attempt) are not evaluated again.
    async fn evaluate_set(
        &self,
        ctx: &PipelineContext,
        members: Vec<Constraint>,
    ) -> HashMap<String, EvaluationResult> {
        let members: Vec<Constraint> = members
            .into_iter()
            .filter(|c| !ctx.results.contains_key(&c.definition.id))
            .collect();
        let mut results = HashMap::new();
        if members.is_empty() {
            return results;
        }

        let Some(evaluator) = ctx.evaluator.clone() else {
            // No evaluator handle: degrade to plain sequential evaluation.
            for constraint in members {
                let started = Instant::now();
                let result = match constraint
                    .evaluator
                    .evaluate(&ctx.schedule, &constraint.definition.parameters)
                    .await
                {
                    Ok(mut result) => {
                        result.constraint_id = constraint.definition.id.clone();
                        if result.execution_time_ms == 0 {
                            result.execution_time_ms = started.elapsed().as_millis() as u64;
                        }
                        result
                    }
                    Err(err) => EvaluationResult::not_evaluated(
                        constraint.definition.id.clone(),
                        err.to_string(),
                    ),
                };
                results.insert(result.constraint_id.clone(), result);
            }
            return results;
        };

        let has_deps = members.iter().any(|c| {
            ctx.graph
                .as_ref()
                .map(|g| !g.dependencies_of(&c.definition.id).is_empty())
                .unwrap_or(false)
        });
        if has_deps {
            let dependency_map = ctx
                .graph
                .as_ref()
                .map(|g| g.dependency_map())
                .unwrap_or_default();
            results.extend(
                evaluator
                    .evaluate_with_dependencies(&members, ctx.schedule.clone(), &dependency_map)
                    .await,
            );
        } else if members.iter().all(|c| c.definition.parallelizable) {
            for result in evaluator.evaluate_batch(&members, ctx.schedule.clone()).await {
                results.insert(result.constraint_id.clone(), result);
            }
        } else {
            // Mixed group: keep declaration order, one at a time.
            for constraint in &members {
                let result = evaluator.evaluate(constraint, ctx.schedule.clone()).await;
                results.insert(result.constraint_id.clone(), result);
            }
        }
        results
    }

    fn check_abort(&self, ctx: &mut PipelineContext) {
        if !self.abort_on_hard_violation || ctx.aborted {
            return;
        }
        if let Some(id) = ctx.hard_violation() {
            ctx.warnings.push(format!(
                "aborting evaluation: hard constraint '{id}' violated"
            ));
            ctx.aborted = true;
        }
    }
}

#[async_trait]
impl PipelineStage for EvaluationStage {
    fn name(&self) -> &str {
        "evaluation"
    }

    fn can_skip(&self, ctx: &PipelineContext) -> bool {
        ctx.constraints.is_empty()
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        match ctx.groups.clone() {
            Some(groups) => {
                for group in groups {
                    if ctx.aborted {
                        break;
                    }
                    let members: Vec<Constraint> = ctx
                        .constraints
                        .iter()
                        .filter(|c| group.constraint_ids.contains(&c.definition.id))
                        .cloned()
                        .collect();
                    if members.is_empty() {
                        continue;
                    }
                    debug!(group = %group.name, members = members.len(), "evaluating group");
                    let outcome = self.evaluate_set(ctx, members).await;
                    ctx.results.extend(outcome);
                    self.check_abort(ctx);
                }
            }
            None => {
                let members = ctx.constraints.clone();
                let outcome = self.evaluate_set(ctx, members).await;
                ctx.results.extend(outcome);
                self.check_abort(ctx);
            }
        }

        // Every active constraint must end up with exactly one result; an
        // aborted run is allowed to leave later constraints without one.
        if !ctx.aborted {
            for constraint in &ctx.constraints {
                let id = &constraint.definition.id;
                if !ctx.results.contains_key(id) {
                    ctx.results.insert(
                        id.clone(),
                        EvaluationResult::not_evaluated(id.clone(), "no result produced"),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Enriches results: derives a confidence score when absent and synthesizes
/// suggestions from violation resolutions.
pub struct PostProcessingStage {
    config: PostProcessingConfig,
}

impl PostProcessingStage {
    pub fn new(config: PostProcessingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineStage for PostProcessingStage {
    fn name(&self) -> &str {
        "post_processing"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let definitions = &ctx.definitions;
        for (id, result) in ctx.results.iter_mut() {
            if result.confidence.is_none() {
                let mut confidence = 1.0;
                if result.execution_time_ms > self.config.slow_threshold_ms {
                    confidence *= 1.0 - self.config.slow_penalty;
                }
                if result.status == ResultStatus::PartiallySatisfied {
                    confidence *= 1.0 - self.config.partial_penalty;
                }
                let is_hard = definitions
                    .get(id)
                    .map(|d| d.hardness == Hardness::Hard)
                    .unwrap_or(false);
                if is_hard {
                    confidence = (confidence * (1.0 + self.config.hard_boost)).min(1.0);
                }
                result.confidence = Some(confidence);
            }

            let mut synthesized: Vec<String> = Vec::new();
            for violation in &result.violations {
                for resolution in &violation.possible_resolutions {
                    if !result.suggestions.contains(resolution)
                        && !synthesized.contains(resolution)
                    {
                        synthesized.push(resolution.clone());
                    }
                }
            }
            result.suggestions.extend(synthesized);
        }
        Ok(())
    }
}

/// Writes fresh cacheable results back into the cache.
pub struct CacheUpdateStage;

#[async_trait]
impl PipelineStage for CacheUpdateStage {
    fn name(&self) -> &str {
        "cache_update"
    }

    fn can_skip(&self, ctx: &PipelineContext) -> bool {
        ctx.cache.is_none()
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let Some(cache) = ctx.cache.clone() else {
            return Ok(());
        };
        let mut warnings = Vec::new();
        for (id, result) in &ctx.results {
            if ctx.cached_ids.contains(id) {
                continue;
            }
            let Some(def) = ctx.definitions.get(id) else {
                continue;
            };
            if !def.cacheable {
                continue;
            }
            let key = cache_key(def, &ctx.schedule);
            if let Err(err) = cache.set(&key, result.clone()).await {
                // Cache failures never fail the run.
                warnings.push(format!("failed to cache result for '{id}': {err}"));
            }
        }
        ctx.warnings.extend(warnings);
        Ok(())
    }
}
