//! Typed configuration for every engine component.
//!
//! All structs deserialize with per-field defaults so a partial JSON document
//! is enough to configure the engine. Durations are serialized as integer
//! milliseconds via [`duration_ms`]. Configuration is validated at engine
//! construction ([`EngineConfig::validate`]); invalid values are rejected,
//! never silently clamped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rule used to pick a cache victim when capacity is exceeded.
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
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least-recently-accessed entry.
    Lru,
    /// Evict the entry with the lowest cumulative access count.
    Lfu,
    /// Evict the oldest-inserted entry regardless of access pattern.
    Fifo,
    /// Evict the entry minimizing `hits * frequency_weight / (age + recency)`,
    /// protecting entries that are frequently or recently used even if old.
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity in bytes, estimated from serialized entry size.
    #[serde(default = "default_cache_max_size")]
    pub max_size_bytes: usize,

    #[serde(default = "default_cache_ttl", with = "duration_ms")]
    pub ttl: Duration,

    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicy,

    /// Frequency multiplier in the adaptive eviction score. Heuristic
    /// default carried over from the original tuning; configurable rather
    /// than load-bearing.
    #[serde(default = "default_adaptive_frequency_weight")]
    pub adaptive_frequency_weight: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_cache_max_size(),
            ttl: default_cache_ttl(),
            eviction_policy: default_eviction_policy(),
            adaptive_frequency_weight: default_adaptive_frequency_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Bound of the pending-task queue. Submissions beyond it fail
    /// immediately with a queue-full error.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_task_timeout", with = "duration_ms")]
    pub task_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
            task_timeout: default_task_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Total attempts per constraint before degrading to a
    /// `NotEvaluated` result.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff between attempts is `backoff_base * 2^(attempt - 1)`.
    #[serde(default = "default_backoff_base", with = "duration_ms")]
    pub backoff_base: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

/// Confidence-derivation constants for the post-processing stage.
/// Heuristic defaults carried over from the original tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessingConfig {
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,

    #[serde(default = "default_slow_penalty")]
    pub slow_penalty: f64,

    #[serde(default = "default_partial_penalty")]
    pub partial_penalty: f64,

    #[serde(default = "default_hard_boost")]
    pub hard_boost: f64,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold_ms(),
            slow_penalty: default_slow_penalty(),
            partial_penalty: default_partial_penalty(),
            hard_boost: default_hard_boost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stage_timeout", with = "duration_ms")]
    pub stage_timeout: Duration,

    /// Total attempts per stage before classifying the error.
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,

    #[serde(default = "default_stage_backoff_base", with = "duration_ms")]
    pub retry_backoff_base: Duration,

    /// Stop after the first stage that leaves a HARD constraint violated,
    /// trading completeness for fast-fail on infeasible schedules.
    #[serde(default)]
    pub abort_on_hard_violation: bool,

    #[serde(default)]
    pub post_processing: PostProcessingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: default_stage_timeout(),
            max_stage_retries: default_max_stage_retries(),
            retry_backoff_base: default_stage_backoff_base(),
            abort_on_hard_violation: false,
            post_processing: PostProcessingConfig::default(),
        }
    }
}

/// How the engine partitions constraints before evaluation.
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
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Groups hard / soft / preference, evaluated in that order.
    ByHardness,
    /// Separates dependency-free parallelizable constraints from the rest.
    ByIndependence,
    /// One flat pass.
    None,
}

/// Weights combining the per-hardness components into the overall score.
///
/// `overall = hard_w * hard_fraction + soft_w * soft_score + pref_w * pref_score`,
/// with the weight of any absent category redistributed proportionally
/// across the present ones. Must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_hard_weight")]
    pub hard: f64,
    #[serde(default = "default_soft_weight")]
    pub soft: f64,
    #[serde(default = "default_preference_weight")]
    pub preference: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            hard: default_hard_weight(),
            soft: default_soft_weight(),
            preference: default_preference_weight(),
        }
    }
}

/// Named configuration bundles. Same code path, different knobs.
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
#[serde(rename_all = "snake_case")]
pub enum PerformanceProfile {
    /// Large cache, short timeouts, fast-fail on hard violations.
    Performance,
    Balanced,
    /// No abort, long timeouts, more retries.
    Accuracy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `None` disables caching entirely; the cache stages skip themselves.
    #[serde(default = "default_cache_config")]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub pool: WorkerPoolConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default = "default_grouping_strategy")]
    pub grouping: GroupingStrategy,

    #[serde(default)]
    pub score_weights: ScoreWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: default_cache_config(),
            pool: WorkerPoolConfig::default(),
            evaluator: EvaluatorConfig::default(),
            pipeline: PipelineConfig::default(),
            grouping: default_grouping_strategy(),
            score_weights: ScoreWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Named bundle for a performance profile.
    pub fn for_profile(profile: PerformanceProfile) -> Self {
        let mut config = Self::default();
        match profile {
            PerformanceProfile::Performance => {
                if let Some(cache) = config.cache.as_mut() {
                    cache.max_size_bytes = 256 * 1024 * 1024;
                    cache.ttl = Duration::from_secs(2 * 60 * 60);
                    cache.eviction_policy = EvictionPolicy::Adaptive;
                }
                config.pool.task_timeout = Duration::from_secs(10);
                config.pipeline.stage_timeout = Duration::from_secs(30);
                config.pipeline.abort_on_hard_violation = true;
                config.grouping = GroupingStrategy::ByIndependence;
            }
            PerformanceProfile::Balanced => {}
            PerformanceProfile::Accuracy => {
                if let Some(cache) = config.cache.as_mut() {
                    cache.ttl = Duration::from_secs(15 * 60);
                }
                config.pool.task_timeout = Duration::from_secs(120);
                config.evaluator.retry_attempts = 3;
                config.pipeline.stage_timeout = Duration::from_secs(300);
                config.pipeline.abort_on_hard_violation = false;
                config.grouping = GroupingStrategy::ByHardness;
            }
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.max_workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pool.queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.queue_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.evaluator.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "evaluator.retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.max_stage_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.max_stage_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(cache) = &self.cache {
            if cache.max_size_bytes == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cache.max_size_bytes",
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        let weight_sum =
            self.score_weights.hard + self.score_weights.soft + self.score_weights.preference;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidValue {
                field: "score_weights",
                reason: format!("must sum to 1.0, got {weight_sum}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_cache_max_size() -> usize {
    100 * 1024 * 1024
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

fn default_adaptive_frequency_weight() -> f64 {
    1000.0
}

fn default_max_workers() -> usize {
    num_cpus::get().min(8)
}

fn default_queue_size() -> usize {
    100
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_slow_threshold_ms() -> u64 {
    5000
}

fn default_slow_penalty() -> f64 {
    0.10
}

fn default_partial_penalty() -> f64 {
    0.20
}

fn default_hard_boost() -> f64 {
    0.10
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_stage_retries() -> u32 {
    3
}

fn default_stage_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_grouping_strategy() -> GroupingStrategy {
    GroupingStrategy::ByHardness
}

fn default_cache_config() -> Option<CacheConfig> {
    Some(CacheConfig::default())
}

fn default_hard_weight() -> f64 {
    0.5
}

fn default_soft_weight() -> f64 {
    0.3
}

fn default_preference_weight() -> f64 {
    0.2
}
