//! # scheval: Constraint Evaluation Engine
//!
//! scheval scores a proposed sports schedule against a declarative set of
//! constraints: parallel evaluation over a bounded worker pool, result
//! caching with configurable eviction, dependency-ordered execution and a
//! staged pipeline with per-stage timeout and retry.
//!
//! ## Architecture
//!
//! Evaluation flows through a fixed pipeline of stages:
//!
//! ```text
//! Validation → Cache Lookup → Dependency Resolution → Evaluation
//!            → Post-Processing → Cache Update
//! ```
//!
//! ### Core Components
//! - Data model: constraints, schedules and results ([`model`])
//! - Result cache with TTL and LRU/LFU/FIFO/adaptive eviction ([`cache`])
//! - Dependency analysis and topological ordering ([`dependency`])
//! - Bounded worker pool with crash recovery and a retrying parallel
//!   evaluator ([`worker`])
//! - Staged pipeline ([`pipeline`])
//! - Orchestration, grouping, incremental evaluation and score
//!   aggregation ([`engine`])
//! - Typed configuration with named performance profiles ([`config`])
//! - Error taxonomy ([`error`])
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use scheval::{
//!     Constraint, ConstraintDefinition, Engine, EngineConfig, EvaluationContext,
//!     EvaluationResult, FnEvaluator, Hardness, Schedule,
//! };
//!
//! # async fn run() -> Result<(), scheval::Error> {
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! let no_double_booking = Constraint::new(
//!     ConstraintDefinition::new("no_double_booking", "No double booking", Hardness::Hard),
//!     Arc::new(FnEvaluator::new(|_schedule, _params| {
//!         // Real evaluators inspect the schedule's games here.
//!         Ok(EvaluationResult::satisfied("no_double_booking", 1.0))
//!     })),
//! );
//!
//! let schedule = Schedule::new("spring", "basketball", "2026");
//! let report = engine
//!     .evaluate(EvaluationContext::new(schedule, vec![no_double_booking]))
//!     .await?;
//! println!("overall score: {}", report.overall_score);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Per-constraint evaluator failures never fail a run: they degrade to
//! `NotEvaluated` results. Only invalid input, dependency cycles and fatal
//! stage errors surface as [`Error`].

pub mod cache;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod worker;

pub use cache::{CacheStats, ResultCache};
pub use config::{
    CacheConfig, EngineConfig, EvaluatorConfig, EvictionPolicy, GroupingStrategy,
    PerformanceProfile, PipelineConfig, ScoreWeights, WorkerPoolConfig,
};
pub use dependency::DependencyGraph;
pub use engine::{AggregateResult, Engine, EngineStats, EvaluationContext};
pub use error::{EngineResult, Error};
pub use model::{
    Constraint, ConstraintDefinition, ConstraintEvaluator, ConstraintScope, EvaluationError,
    EvaluationResult, EvaluatorResult, FnEvaluator, Game, Hardness, ResultStatus, Schedule,
    Severity, Team, Venue, Violation,
};
pub use pipeline::{Pipeline, PipelineContext, PipelineStage};
pub use worker::{ParallelEvaluator, PoolStats, WorkerPool};
