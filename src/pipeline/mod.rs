//! Staged evaluation pipeline.
//!
//! Composes validation, cache lookup, dependency resolution, evaluation,
//! post-processing and cache update into one run over a shared
//! [`PipelineContext`]. Every stage executes under a timeout race and, for
//! recoverable errors, up to `max_stage_retries` attempts with exponential
//! backoff. Exhausted recoverable errors become warnings and the pipeline
//! continues; fatal errors propagate with the partial context attached.

pub mod context;
pub mod stages;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheError;
use crate::config::PipelineConfig;
use crate::dependency::DependencyError;
use crate::worker::WorkerError;

pub use context::{ConstraintGroup, PipelineContext};
pub use stages::{
    CacheLookupStage, CacheUpdateStage, DependencyResolutionStage, EvaluationStage,
    PipelineStage, PostProcessingStage, ValidationStage,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },
    #[error("pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Recoverable errors (timeout, cache, queue/worker trouble) degrade to
    /// warnings; everything else is fatal for the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Cache(_)
                | PipelineError::Worker(_)
                | PipelineError::StageTimeout { .. }
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Fatal pipeline failure, carrying the partially-populated context for
/// diagnostics.
#[derive(Debug, Error)]
#[error("pipeline stage '{stage}' failed: {error}")]
pub struct PipelineFailure {
    pub stage: String,
    #[source]
    pub error: PipelineError,
    pub context: Box<PipelineContext>,
}

pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Empty pipeline; compose stages with [`Pipeline::add_stage`].
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            config,
        }
    }

    /// The default six-stage pipeline.
    pub fn standard(config: PipelineConfig) -> Self {
        let mut pipeline = Self::new(config);
        pipeline.add_stage(Arc::new(ValidationStage));
        pipeline.add_stage(Arc::new(CacheLookupStage));
        pipeline.add_stage(Arc::new(DependencyResolutionStage));
        let abort = pipeline.config.abort_on_hard_violation;
        pipeline.add_stage(Arc::new(EvaluationStage::new(abort)));
        let post = pipeline.config.post_processing.clone();
        pipeline.add_stage(Arc::new(PostProcessingStage::new(post)));
        pipeline.add_stage(Arc::new(CacheUpdateStage));
        pipeline
    }

    pub fn add_stage(&mut self, stage: Arc<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn remove_stage(&mut self, name: &str) -> bool {
        let before = self.stages.len();
        self.stages.retain(|stage| stage.name() != name);
        self.stages.len() < before
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    #[tracing::instrument(skip(self, ctx), fields(run_id = %ctx.run_id), level = "debug")]
    pub async fn execute(
        &self,
        mut ctx: PipelineContext,
    ) -> Result<PipelineContext, PipelineFailure> {
        for stage in &self.stages {
            if ctx.aborted {
                debug!(stage = stage.name(), "skipping stage, run aborted");
                continue;
            }
            if stage.can_skip(&ctx) {
                debug!(stage = stage.name(), "skipping stage");
                continue;
            }

            let started = Instant::now();
            let mut last_error = None;
            let mut succeeded = false;
            for attempt in 1..=self.config.max_stage_retries {
                if attempt > 1 {
                    let backoff = self.config.retry_backoff_base * 2u32.pow(attempt - 2);
                    tokio::time::sleep(backoff).await;
                }
                match tokio::time::timeout(self.config.stage_timeout, stage.execute(&mut ctx))
                    .await
                {
                    Ok(Ok(())) => {
                        succeeded = true;
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(stage = stage.name(), attempt, error = %err, "stage attempt failed");
                        let fatal = !err.is_recoverable();
                        last_error = Some(err);
                        if fatal {
                            // Validation and cycle errors gain nothing from
                            // retries.
                            break;
                        }
                    }
                    Err(_) => {
                        last_error = Some(PipelineError::StageTimeout {
                            stage: stage.name().to_string(),
                            timeout_ms: self.config.stage_timeout.as_millis() as u64,
                        });
                    }
                }
            }
            ctx.stage_timings
                .push((stage.name().to_string(), started.elapsed()));

            if !succeeded {
                let error = last_error.unwrap_or_else(|| {
                    PipelineError::Internal("stage failed without reporting an error".to_string())
                });
                if error.is_recoverable() {
                    ctx.warnings.push(format!(
                        "stage '{}' failed after {} attempts: {error}",
                        stage.name(),
                        self.config.max_stage_retries
                    ));
                    continue;
                }
                return Err(PipelineFailure {
                    stage: stage.name().to_string(),
                    error,
                    context: Box::new(ctx),
                });
            }

            // Fast-fail between stages when the schedule is already known
            // infeasible.
            if self.config.abort_on_hard_violation && !ctx.aborted {
                if let Some(id) = ctx.hard_violation() {
                    ctx.warnings.push(format!(
                        "aborting pipeline: hard constraint '{id}' violated"
                    ));
                    ctx.aborted = true;
                }
            }
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::config::{CacheConfig, EvaluatorConfig, WorkerPoolConfig};
    use crate::model::{
        Constraint, ConstraintDefinition, EvaluationResult, FnEvaluator, Hardness, Schedule,
        Severity, Violation,
    };
    use crate::worker::{ParallelEvaluator, WorkerPool};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn satisfied_constraint(id: &str, hardness: Hardness) -> Constraint {
        let owned = id.to_string();
        Constraint::new(
            ConstraintDefinition::new(id, id, hardness),
            Arc::new(FnEvaluator::new(move |_, _| {
                Ok(EvaluationResult::satisfied(owned.clone(), 1.0))
            })),
        )
    }

    fn violated_constraint(id: &str, hardness: Hardness) -> Constraint {
        let owned = id.to_string();
        Constraint::new(
            ConstraintDefinition::new(id, id, hardness),
            Arc::new(FnEvaluator::new(move |_, _| {
                Ok(EvaluationResult::violated(
                    owned.clone(),
                    0.0,
                    vec![Violation {
                        violation_type: "overlap".to_string(),
                        severity: Severity::Critical,
                        affected_entities: vec!["team_a".to_string()],
                        description: "double-booked".to_string(),
                        possible_resolutions: vec!["move the game".to_string()],
                    }],
                ))
            })),
        )
    }

    fn schedule() -> Arc<Schedule> {
        Arc::new(Schedule::new("s1", "basketball", "2026"))
    }

    fn test_evaluator() -> Arc<ParallelEvaluator> {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            max_workers: 2,
            queue_size: 16,
            task_timeout: Duration::from_secs(5),
        }));
        Arc::new(ParallelEvaluator::new(
            pool,
            EvaluatorConfig {
                retry_attempts: 1,
                backoff_base: Duration::from_millis(1),
            },
        ))
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            stage_timeout: Duration::from_secs(5),
            max_stage_retries: 2,
            retry_backoff_base: Duration::from_millis(1),
            abort_on_hard_violation: false,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn standard_pipeline_produces_one_result_per_constraint() {
        let pipeline = Pipeline::standard(test_config());
        let ctx = PipelineContext::new(
            schedule(),
            vec![
                satisfied_constraint("c1", Hardness::Hard),
                satisfied_constraint("c2", Hardness::Soft),
            ],
        )
        .with_evaluator(test_evaluator());
        let out = pipeline.execute(ctx).await.unwrap();
        assert_eq!(out.results.len(), 2);
        assert!(out.results.values().all(|r| r.satisfied));
        assert!(!out.aborted);
    }

    #[tokio::test]
    async fn empty_constraint_list_is_fatal() {
        let pipeline = Pipeline::standard(test_config());
        let ctx = PipelineContext::new(schedule(), vec![]);
        let failure = pipeline.execute(ctx).await.unwrap_err();
        assert_eq!(failure.stage, "validation");
        assert!(matches!(failure.error, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn out_of_range_weight_is_rejected_not_clamped() {
        let pipeline = Pipeline::standard(test_config());
        let mut constraint = satisfied_constraint("c1", Hardness::Soft);
        constraint.definition.weight = 150.0;
        let ctx = PipelineContext::new(schedule(), vec![constraint]);
        let failure = pipeline.execute(ctx).await.unwrap_err();
        assert!(matches!(failure.error, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn cycle_aborts_the_run() {
        let pipeline = Pipeline::standard(test_config());
        let mut a = satisfied_constraint("a", Hardness::Soft);
        a.definition.dependencies = vec!["b".to_string()];
        let mut b = satisfied_constraint("b", Hardness::Soft);
        b.definition.dependencies = vec!["a".to_string()];
        let ctx =
            PipelineContext::new(schedule(), vec![a, b]).with_evaluator(test_evaluator());
        let failure = pipeline.execute(ctx).await.unwrap_err();
        assert_eq!(failure.stage, "dependency_resolution");
        assert!(matches!(failure.error, PipelineError::Dependency(_)));
    }

    #[tokio::test]
    async fn cache_round_trip_skips_second_evaluation() {
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let pipeline = Pipeline::standard(test_config());
        let evaluator = test_evaluator();
        // Same schedule instance both times so the version token matches.
        let sched = schedule();

        let ctx = PipelineContext::new(
            sched.clone(),
            vec![satisfied_constraint("c1", Hardness::Soft)],
        )
        .with_cache(cache.clone())
        .with_evaluator(evaluator.clone());
        let first = pipeline.execute(ctx).await.unwrap();
        assert!(first.cached_ids.is_empty());

        let ctx = PipelineContext::new(
            sched,
            vec![satisfied_constraint("c1", Hardness::Soft)],
        )
        .with_cache(cache.clone())
        .with_evaluator(evaluator);
        let second = pipeline.execute(ctx).await.unwrap();
        assert!(second.cached_ids.contains("c1"));
        assert_eq!(second.results.len(), 1);
        assert!(cache.stats().await.hits >= 1);
    }

    #[tokio::test]
    async fn abort_on_hard_violation_skips_later_groups() {
        let mut config = test_config();
        config.abort_on_hard_violation = true;
        let pipeline = Pipeline::standard(config);
        let ctx = PipelineContext::new(
            schedule(),
            vec![
                violated_constraint("hard1", Hardness::Hard),
                satisfied_constraint("soft1", Hardness::Soft),
            ],
        )
        .with_evaluator(test_evaluator())
        .with_groups(vec![
            ConstraintGroup {
                name: "hard".to_string(),
                constraint_ids: vec!["hard1".to_string()],
            },
            ConstraintGroup {
                name: "soft".to_string(),
                constraint_ids: vec!["soft1".to_string()],
            },
        ]);
        let out = pipeline.execute(ctx).await.unwrap();
        assert!(out.aborted);
        assert!(out.results.contains_key("hard1"));
        assert!(!out.results.contains_key("soft1"));
        assert!(out.warnings.iter().any(|w| w.contains("hard1")));
    }

    #[tokio::test]
    async fn post_processing_derives_confidence_and_suggestions() {
        let pipeline = Pipeline::standard(test_config());
        let ctx = PipelineContext::new(
            schedule(),
            vec![violated_constraint("hard1", Hardness::Hard)],
        )
        .with_evaluator(test_evaluator());
        let out = pipeline.execute(ctx).await.unwrap();
        let result = &out.results["hard1"];
        // Baseline 1.0 boosted for a hard constraint, capped at 1.0.
        assert_eq!(result.confidence, Some(1.0));
        assert_eq!(result.suggestions, vec!["move the game".to_string()]);
    }

    fn counting_constraint(id: &str, runs: Arc<AtomicU32>) -> Constraint {
        let owned = id.to_string();
        Constraint::new(
            ConstraintDefinition::new(id, id, Hardness::Soft),
            Arc::new(FnEvaluator::new(move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(EvaluationResult::satisfied(owned.clone(), 1.0))
            })),
        )
    }

    #[tokio::test]
    async fn evaluation_does_not_rerun_already_committed_results() {
        // A retried evaluation attempt sees the results committed by the
        // interrupted one and must leave them alone.
        let done_runs = Arc::new(AtomicU32::new(0));
        let fresh_runs = Arc::new(AtomicU32::new(0));
        let mut ctx = PipelineContext::new(
            schedule(),
            vec![
                counting_constraint("done", done_runs.clone()),
                counting_constraint("fresh", fresh_runs.clone()),
            ],
        )
        .with_evaluator(test_evaluator());
        ctx.results.insert(
            "done".to_string(),
            EvaluationResult::satisfied("done", 0.5),
        );

        let stage = EvaluationStage::new(false);
        stage.execute(&mut ctx).await.unwrap();
        assert_eq!(done_runs.load(Ordering::SeqCst), 0);
        assert_eq!(fresh_runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.results.len(), 2);
        // The committed result survives untouched.
        assert_eq!(ctx.results["done"].score, 0.5);
    }

    #[tokio::test]
    async fn stage_timeout_retries_then_succeeds() {
        struct SlowFirstAttempt {
            attempts: Arc<AtomicU32>,
        }

        #[async_trait]
        impl PipelineStage for SlowFirstAttempt {
            fn name(&self) -> &str {
                "slow_start"
            }
            async fn execute(&self, _ctx: &mut PipelineContext) -> PipelineResult<()> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(())
            }
        }

        let mut config = test_config();
        config.stage_timeout = Duration::from_millis(50);
        let attempts = Arc::new(AtomicU32::new(0));
        let mut pipeline = Pipeline::new(config);
        pipeline.add_stage(Arc::new(SlowFirstAttempt {
            attempts: attempts.clone(),
        }));

        let ctx = PipelineContext::new(
            schedule(),
            vec![satisfied_constraint("c1", Hardness::Soft)],
        );
        let out = pipeline.execute(ctx).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn exhausted_stage_timeout_becomes_warning_and_later_stages_run() {
        struct StuckStage;

        #[async_trait]
        impl PipelineStage for StuckStage {
            fn name(&self) -> &str {
                "stuck"
            }
            async fn execute(&self, _ctx: &mut PipelineContext) -> PipelineResult<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }

        let mut config = test_config();
        config.stage_timeout = Duration::from_millis(30);
        let mut pipeline = Pipeline::new(config);
        pipeline.add_stage(Arc::new(StuckStage));
        pipeline.add_stage(Arc::new(EvaluationStage::new(false)));

        let ctx = PipelineContext::new(
            schedule(),
            vec![satisfied_constraint("c1", Hardness::Soft)],
        )
        .with_evaluator(test_evaluator());
        let out = pipeline.execute(ctx).await.unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("stuck"));
        assert!(out.warnings[0].contains("timed out"));
        // The timeout is recoverable: evaluation still happened.
        assert_eq!(out.results.len(), 1);
        assert!(out.results["c1"].satisfied);
    }

    #[tokio::test]
    async fn recoverable_stage_failure_becomes_warning() {
        struct FlakyStage;

        #[async_trait]
        impl PipelineStage for FlakyStage {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn execute(&self, _ctx: &mut PipelineContext) -> PipelineResult<()> {
                Err(PipelineError::Worker(crate::worker::WorkerError::QueueFull))
            }
        }

        let mut pipeline = Pipeline::new(test_config());
        pipeline.add_stage(Arc::new(FlakyStage));
        let ctx = PipelineContext::new(
            schedule(),
            vec![satisfied_constraint("c1", Hardness::Soft)],
        );
        let out = pipeline.execute(ctx).await.unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("flaky"));
    }

    #[tokio::test]
    async fn add_and_remove_stages() {
        let mut pipeline = Pipeline::standard(test_config());
        assert_eq!(pipeline.stage_names().len(), 6);
        assert!(pipeline.remove_stage("cache_lookup"));
        assert!(!pipeline.remove_stage("cache_lookup"));
        assert_eq!(pipeline.stage_names().len(), 5);
    }

    #[tokio::test]
    async fn grouped_evaluation_covers_all_groups() {
        let pipeline = Pipeline::standard(test_config());
        let ctx = PipelineContext::new(
            schedule(),
            vec![
                satisfied_constraint("h1", Hardness::Hard),
                satisfied_constraint("s1", Hardness::Soft),
                satisfied_constraint("p1", Hardness::Preference),
            ],
        )
        .with_evaluator(test_evaluator())
        .with_groups(vec![
            ConstraintGroup {
                name: "hard".to_string(),
                constraint_ids: vec!["h1".to_string()],
            },
            ConstraintGroup {
                name: "soft".to_string(),
                constraint_ids: vec!["s1".to_string()],
            },
            ConstraintGroup {
                name: "preferences".to_string(),
                constraint_ids: vec!["p1".to_string()],
            },
        ]);
        let out = pipeline.execute(ctx).await.unwrap();
        assert_eq!(out.results.len(), 3);
    }
}
