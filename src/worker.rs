//! Bounded worker pool and the retrying parallel evaluator layered on it.
//!
//! The pool keeps a fixed number of tokio worker tasks fed from one bounded
//! queue. Submission never blocks: a full queue is an immediate
//! [`WorkerError::QueueFull`]. A task that times out or panics fails only
//! itself; the worker that ran it is terminated and transparently replaced so
//! effective concurrency stays constant.
//!
//! [`ParallelEvaluator`] adds caller-level retry with exponential backoff and
//! degrades exhausted failures to `NotEvaluated` results instead of errors,
//! plus order-preserving batch evaluation and a memoized dependency-aware
//! mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use dashmap::DashMap;
use futures::stream::StreamExt;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{EvaluatorConfig, WorkerPoolConfig};
use crate::model::{Constraint, EvaluationResult, Schedule};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task queue is full")]
    QueueFull,
    #[error("worker pool is shut down")]
    PoolShutdown,
    #[error("evaluation of '{constraint_id}' timed out after {timeout:?}")]
    TaskTimeout {
        constraint_id: String,
        timeout: Duration,
    },
    #[error("worker crashed while evaluating '{constraint_id}'")]
    WorkerCrashed { constraint_id: String },
    #[error("evaluation of '{constraint_id}' failed: {message}")]
    Evaluation {
        constraint_id: String,
        message: String,
    },
}

pub type WorkerResult<T> = Result<T, WorkerError>;

type TaskOutcome = WorkerResult<EvaluationResult>;

struct EvalTask {
    constraint: Constraint,
    schedule: Arc<Schedule>,
    reply: oneshot::Sender<TaskOutcome>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    replaced: AtomicU64,
}

/// Point-in-time pool statistics, derived from counters only.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub replaced: u64,
}

struct PoolShared {
    config: WorkerPoolConfig,
    queue: Mutex<mpsc::Receiver<EvalTask>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    workers: DashMap<usize, JoinHandle<()>>,
    next_worker_id: AtomicUsize,
    counters: PoolCounters,
}

enum WorkerExit {
    Shutdown,
    /// The worker ran a task that timed out or crashed and must be replaced.
    Replace,
}

enum TaskEnd {
    Continue,
    Replace,
}

/// Fixed-size pool of isolated evaluation workers.
pub struct WorkerPool {
    tx: mpsc::Sender<EvalTask>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(PoolShared {
            config,
            queue: Mutex::new(rx),
            running: AtomicBool::new(true),
            shutdown_tx,
            workers: DashMap::new(),
            next_worker_id: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        });
        for _ in 0..shared.config.max_workers {
            spawn_worker(&shared);
        }
        Self { tx, shared }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Enqueues one evaluation. Fails immediately when the queue is full;
    /// there is no unbounded buffering.
    pub fn submit(
        &self,
        constraint: Constraint,
        schedule: Arc<Schedule>,
    ) -> WorkerResult<oneshot::Receiver<TaskOutcome>> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(WorkerError::PoolShutdown);
        }
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(EvalTask {
                constraint,
                schedule,
                reply,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => WorkerError::PoolShutdown,
            })?;
        Ok(reply_rx)
    }

    /// Submits and awaits one evaluation.
    pub async fn evaluate(
        &self,
        constraint: &Constraint,
        schedule: Arc<Schedule>,
    ) -> TaskOutcome {
        let constraint_id = constraint.definition.id.clone();
        let reply_rx = self.submit(constraint.clone(), schedule)?;
        reply_rx
            .await
            .map_err(|_| WorkerError::WorkerCrashed { constraint_id })?
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            workers: self.shared.config.max_workers,
            queued: self.tx.max_capacity() - self.tx.capacity(),
            active: counters.active.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            replaced: counters.replaced.load(Ordering::Relaxed),
        }
    }

    /// Signals every worker and waits for them to exit, bounded by
    /// `task_timeout` per worker.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
        let ids: Vec<usize> = self.shared.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.shared.workers.remove(&id) {
                if tokio::time::timeout(self.shared.config.task_timeout, handle)
                    .await
                    .is_err()
                {
                    warn!(worker_id = id, "worker did not exit in time");
                }
            }
        }
        debug!("worker pool shut down");
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) {
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::SeqCst);
    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        let exit = worker_loop(worker_id, &task_shared).await;
        task_shared.workers.remove(&worker_id);
        if matches!(exit, WorkerExit::Replace) && task_shared.running.load(Ordering::SeqCst) {
            task_shared.counters.replaced.fetch_add(1, Ordering::Relaxed);
            debug!(worker_id, "replacing worker");
            spawn_worker(&task_shared);
        }
    });
    shared.workers.insert(worker_id, handle);
}

async fn worker_loop(worker_id: usize, shared: &Arc<PoolShared>) -> WorkerExit {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return WorkerExit::Shutdown;
        }
        let task = tokio::select! {
            _ = shutdown_rx.recv() => return WorkerExit::Shutdown,
            task = recv_task(shared) => match task {
                Some(task) => task,
                None => return WorkerExit::Shutdown,
            },
        };
        shared.counters.active.fetch_add(1, Ordering::Relaxed);
        let end = run_task(worker_id, shared, task).await;
        shared.counters.active.fetch_sub(1, Ordering::Relaxed);
        if matches!(end, TaskEnd::Replace) {
            return WorkerExit::Replace;
        }
    }
}

async fn recv_task(shared: &Arc<PoolShared>) -> Option<EvalTask> {
    shared.queue.lock().await.recv().await
}

async fn run_task(worker_id: usize, shared: &Arc<PoolShared>, task: EvalTask) -> TaskEnd {
    let EvalTask {
        constraint,
        schedule,
        reply,
    } = task;
    let constraint_id = constraint.definition.id.clone();
    let parameters = constraint.definition.parameters.clone();
    let evaluator = constraint.evaluator.clone();
    let started = Instant::now();

    // The evaluation runs as its own task so a panicking evaluator surfaces
    // as a JoinError instead of taking the worker down with it.
    let mut eval_handle =
        tokio::spawn(async move { evaluator.evaluate(&schedule, &parameters).await });

    match tokio::time::timeout(shared.config.task_timeout, &mut eval_handle).await {
        Err(_) => {
            // The evaluation may be stuck; abort it and replace this worker.
            eval_handle.abort();
            shared.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, constraint_id = %constraint_id, "task timed out");
            let _ = reply.send(Err(WorkerError::TaskTimeout {
                constraint_id,
                timeout: shared.config.task_timeout,
            }));
            TaskEnd::Replace
        }
        Ok(Err(join_err)) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id,
                constraint_id = %constraint_id,
                panicked = join_err.is_panic(),
                "evaluation task crashed"
            );
            let _ = reply.send(Err(WorkerError::WorkerCrashed { constraint_id }));
            TaskEnd::Replace
        }
        Ok(Ok(Err(eval_err))) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = reply.send(Err(WorkerError::Evaluation {
                constraint_id,
                message: eval_err.to_string(),
            }));
            TaskEnd::Continue
        }
        Ok(Ok(Ok(mut result))) => {
            // The pool is authoritative for result identity and timing.
            result.constraint_id = constraint_id;
            if result.execution_time_ms == 0 {
                result.execution_time_ms = started.elapsed().as_millis() as u64;
            }
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            let _ = reply.send(Ok(result));
            TaskEnd::Continue
        }
    }
}

/// Retrying evaluator on top of the pool.
///
/// Failures never escape [`ParallelEvaluator::evaluate`]: after
/// `retry_attempts` total attempts the constraint degrades to a
/// `NotEvaluated` result carrying the last error message.
pub struct ParallelEvaluator {
    pool: Arc<WorkerPool>,
    config: EvaluatorConfig,
}

impl ParallelEvaluator {
    pub fn new(pool: Arc<WorkerPool>, config: EvaluatorConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[tracing::instrument(skip(self, constraint, schedule), fields(constraint_id = %constraint.definition.id), level = "debug")]
    pub async fn evaluate(
        &self,
        constraint: &Constraint,
        schedule: Arc<Schedule>,
    ) -> EvaluationResult {
        let mut last_error = None;
        for attempt in 1..=self.config.retry_attempts {
            if attempt > 1 {
                let backoff = self.config.backoff_base * 2u32.pow(attempt - 2);
                tokio::time::sleep(backoff).await;
            }
            let outcome = if constraint.definition.parallelizable {
                self.pool.evaluate(constraint, schedule.clone()).await
            } else {
                // Bypasses the pool so the constraint runs in the caller's
                // execution context, preserving ordering relative to it.
                self.evaluate_inline(constraint, &schedule).await
            };
            match outcome {
                Ok(result) => return result,
                Err(err) => {
                    warn!(
                        constraint_id = %constraint.definition.id,
                        attempt,
                        error = %err,
                        "evaluation attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        let message = match last_error {
            Some(err) => format!(
                "evaluation failed after {} attempts: {}",
                self.config.retry_attempts, err
            ),
            None => "evaluation failed with no attempts configured".to_string(),
        };
        EvaluationResult::not_evaluated(constraint.definition.id.clone(), message)
    }

    async fn evaluate_inline(
        &self,
        constraint: &Constraint,
        schedule: &Schedule,
    ) -> TaskOutcome {
        let started = Instant::now();
        let timeout = self.pool.config().task_timeout;
        let eval = constraint
            .evaluator
            .evaluate(schedule, &constraint.definition.parameters);
        match tokio::time::timeout(timeout, eval).await {
            Err(_) => Err(WorkerError::TaskTimeout {
                constraint_id: constraint.definition.id.clone(),
                timeout,
            }),
            Ok(Err(eval_err)) => Err(WorkerError::Evaluation {
                constraint_id: constraint.definition.id.clone(),
                message: eval_err.to_string(),
            }),
            Ok(Ok(mut result)) => {
                result.constraint_id = constraint.definition.id.clone();
                if result.execution_time_ms == 0 {
                    result.execution_time_ms = started.elapsed().as_millis() as u64;
                }
                Ok(result)
            }
        }
    }

    /// Evaluates every constraint, returning results indexed identically to
    /// the input regardless of internal completion order. Non-parallelizable
    /// constraints run first, sequentially, in declaration order. In-flight
    /// submissions are capped at queue capacity so a batch of any size never
    /// overflows the pool's own queue.
    pub async fn evaluate_batch(
        &self,
        constraints: &[Constraint],
        schedule: Arc<Schedule>,
    ) -> Vec<EvaluationResult> {
        let mut slots: Vec<Option<EvaluationResult>> = Vec::new();
        slots.resize_with(constraints.len(), || None);

        for (index, constraint) in constraints.iter().enumerate() {
            if !constraint.definition.parallelizable {
                slots[index] = Some(self.evaluate(constraint, schedule.clone()).await);
            }
        }

        // Each in-flight future holds at most one queue slot, so the queue
        // size bounds concurrent submissions.
        let limit = self.pool.config().queue_size;
        let mut parallel = Vec::new();
        for (index, constraint) in constraints.iter().enumerate() {
            if constraint.definition.parallelizable {
                let schedule = schedule.clone();
                parallel.push(async move { (index, self.evaluate(constraint, schedule).await) });
            }
        }
        let mut stream = futures::stream::iter(parallel).buffer_unordered(limit);
        while let Some((index, result)) = stream.next().await {
            slots[index] = Some(result);
        }

        constraints
            .iter()
            .zip(slots)
            .map(|(constraint, slot)| {
                slot.unwrap_or_else(|| {
                    EvaluationResult::not_evaluated(
                        constraint.definition.id.clone(),
                        "no result produced",
                    )
                })
            })
            .collect()
    }

    /// Evaluates constraints so that each one's dependencies complete first,
    /// memoizing finished ids so nothing runs twice within one call.
    pub async fn evaluate_with_dependencies(
        &self,
        constraints: &[Constraint],
        schedule: Arc<Schedule>,
        dependency_map: &HashMap<String, Vec<String>>,
    ) -> HashMap<String, EvaluationResult> {
        let catalog: HashMap<&str, &Constraint> = constraints
            .iter()
            .map(|c| (c.definition.id.as_str(), c))
            .collect();
        let mut completed = HashMap::new();
        let mut in_progress = HashSet::new();
        for constraint in constraints {
            self.eval_node(
                constraint.definition.id.as_str(),
                &catalog,
                dependency_map,
                &schedule,
                &mut completed,
                &mut in_progress,
            )
            .await;
        }
        completed
    }

    #[async_recursion]
    async fn eval_node(
        &self,
        id: &str,
        catalog: &HashMap<&str, &Constraint>,
        dependency_map: &HashMap<String, Vec<String>>,
        schedule: &Arc<Schedule>,
        completed: &mut HashMap<String, EvaluationResult>,
        in_progress: &mut HashSet<String>,
    ) {
        if completed.contains_key(id) || !in_progress.insert(id.to_string()) {
            // Already done, or part of a cycle the analyzer should have
            // rejected; do not recurse forever.
            return;
        }
        if let Some(deps) = dependency_map.get(id) {
            for dep in deps {
                self.eval_node(dep, catalog, dependency_map, schedule, completed, in_progress)
                    .await;
            }
        }
        if let Some(constraint) = catalog.get(id) {
            let result = self.evaluate(constraint, schedule.clone()).await;
            completed.insert(id.to_string(), result);
        }
        in_progress.remove(id);
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ConstraintDefinition, ConstraintEvaluator, EvaluationError, EvaluatorResult, Hardness,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    struct SleepEvaluator {
        delay: Duration,
    }

    #[async_trait]
    impl ConstraintEvaluator for SleepEvaluator {
        async fn evaluate(
            &self,
            _schedule: &Schedule,
            _parameters: &HashMap<String, serde_json::Value>,
        ) -> EvaluatorResult {
            tokio::time::sleep(self.delay).await;
            Ok(EvaluationResult::satisfied("", 1.0))
        }
    }

    struct FailingEvaluator {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ConstraintEvaluator for FailingEvaluator {
        async fn evaluate(
            &self,
            _schedule: &Schedule,
            _parameters: &HashMap<String, serde_json::Value>,
        ) -> EvaluatorResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(EvaluationError("venue data unavailable".to_string()))
        }
    }

    struct PanicEvaluator;

    #[async_trait]
    impl ConstraintEvaluator for PanicEvaluator {
        async fn evaluate(
            &self,
            _schedule: &Schedule,
            _parameters: &HashMap<String, serde_json::Value>,
        ) -> EvaluatorResult {
            panic!("evaluator bug");
        }
    }

    struct RecordingEvaluator {
        order: Arc<AsyncMutex<Vec<String>>>,
        id: String,
    }

    #[async_trait]
    impl ConstraintEvaluator for RecordingEvaluator {
        async fn evaluate(
            &self,
            _schedule: &Schedule,
            _parameters: &HashMap<String, serde_json::Value>,
        ) -> EvaluatorResult {
            self.order.lock().await.push(self.id.clone());
            Ok(EvaluationResult::satisfied(self.id.clone(), 1.0))
        }
    }

    fn constraint(id: &str, evaluator: Arc<dyn ConstraintEvaluator>) -> Constraint {
        Constraint::new(ConstraintDefinition::new(id, id, Hardness::Soft), evaluator)
    }

    fn sleeping(id: &str, delay_ms: u64) -> Constraint {
        constraint(
            id,
            Arc::new(SleepEvaluator {
                delay: Duration::from_millis(delay_ms),
            }),
        )
    }

    fn schedule() -> Arc<Schedule> {
        Arc::new(Schedule::new("s1", "basketball", "2026"))
    }

    fn pool_config(max_workers: usize, queue_size: usize, timeout_ms: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers,
            queue_size,
            task_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn evaluator(pool: Arc<WorkerPool>, retry_attempts: u32) -> ParallelEvaluator {
        ParallelEvaluator::new(
            pool,
            EvaluatorConfig {
                retry_attempts,
                backoff_base: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn evaluate_returns_result() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 10, 1000)));
        let result = pool.evaluate(&sleeping("c1", 5), schedule()).await.unwrap();
        assert!(result.satisfied);
        assert_eq!(pool.stats().completed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_is_rejected_immediately() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 1, 5000)));
        // Occupy both workers, yielding after each submit so a worker
        // dequeues it before the next one lands in the single queue slot.
        let busy1 = pool.submit(sleeping("busy1", 300), schedule()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let busy2 = pool.submit(sleeping("busy2", 300), schedule()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Queue slot takes the third.
        let _queued = pool.submit(sleeping("queued", 10), schedule()).unwrap();
        // Fourth overflows.
        let err = pool
            .submit(sleeping("overflow", 10), schedule())
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::QueueFull));
        busy1.await.unwrap().unwrap();
        busy2.await.unwrap().unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_fails_task_and_replaces_worker() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 10, 50)));
        let err = pool
            .evaluate(&sleeping("slow", 5000), schedule())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::TaskTimeout { .. }));
        // Give the supervisor a moment to respawn the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..4 {
            let result = pool
                .evaluate(&sleeping(&format!("quick{i}"), 5), schedule())
                .await
                .unwrap();
            assert!(result.satisfied);
        }
        let stats = pool.stats();
        assert_eq!(stats.timed_out, 1);
        assert!(stats.replaced >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panic_is_contained_and_pool_recovers() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 10, 1000)));
        let err = pool
            .evaluate(&constraint("boom", Arc::new(PanicEvaluator)), schedule())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::WorkerCrashed { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Concurrency is preserved: more tasks than workers still complete.
        let constraints: Vec<Constraint> =
            (0..4).map(|i| sleeping(&format!("c{i}"), 20)).collect();
        let eval = evaluator(pool.clone(), 1);
        let results = eval.evaluate_batch(&constraints, schedule()).await;
        assert!(results.iter().all(|r| r.satisfied));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let pool = Arc::new(WorkerPool::new(pool_config(4, 10, 1000)));
        let eval = evaluator(pool.clone(), 1);
        let constraints = vec![sleeping("c1", 100), sleeping("c2", 10), sleeping("c3", 1)];
        let results = eval.evaluate_batch(&constraints, schedule()).await;
        let ids: Vec<&str> = results.iter().map(|r| r.constraint_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn batch_larger_than_queue_never_overflows() {
        // One worker, one queue slot: a naive flood would reject most of
        // the batch with QueueFull.
        let pool = Arc::new(WorkerPool::new(pool_config(1, 1, 1000)));
        let eval = evaluator(pool.clone(), 1);
        let constraints: Vec<Constraint> =
            (0..8).map(|i| sleeping(&format!("c{i}"), 1)).collect();
        let results = eval.evaluate_batch(&constraints, schedule()).await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.satisfied));
        let stats = pool.stats();
        assert_eq!(stats.completed, 8);
        assert_eq!(stats.failed, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retries_exhaust_into_not_evaluated() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 10, 1000)));
        let attempts = Arc::new(AtomicU32::new(0));
        let failing = constraint(
            "flaky",
            Arc::new(FailingEvaluator {
                attempts: attempts.clone(),
            }),
        );
        let eval = evaluator(pool.clone(), 3);
        let started = Instant::now();
        let result = eval.evaluate(&failing, schedule()).await;
        assert_eq!(result.status, crate::model::ResultStatus::NotEvaluated);
        assert!(result.message.contains("after 3 attempts"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Backoff lower bound: 10ms + 20ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(30));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn non_parallelizable_bypasses_a_busy_pool() {
        let pool = Arc::new(WorkerPool::new(pool_config(1, 1, 5000)));
        // The single worker is busy for a while.
        let _busy = pool.submit(sleeping("busy", 500), schedule()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut inline = sleeping("inline", 5);
        inline.definition.parallelizable = false;
        let eval = evaluator(pool.clone(), 1);
        let started = Instant::now();
        let result = eval.evaluate(&inline, schedule()).await;
        assert!(result.satisfied);
        assert!(started.elapsed() < Duration::from_millis(200));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dependency_aware_evaluation_orders_and_memoizes() {
        let pool = Arc::new(WorkerPool::new(pool_config(4, 10, 1000)));
        let eval = evaluator(pool.clone(), 1);
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let rec = |id: &str| {
            constraint(
                id,
                Arc::new(RecordingEvaluator {
                    order: order.clone(),
                    id: id.to_string(),
                }),
            )
        };
        let constraints = vec![rec("b"), rec("a"), rec("c")];
        let deps: HashMap<String, Vec<String>> = [
            ("b".to_string(), vec!["a".to_string()]),
            ("c".to_string(), vec!["a".to_string()]),
        ]
        .into_iter()
        .collect();
        let results = eval
            .evaluate_with_dependencies(&constraints, schedule(), &deps)
            .await;
        assert_eq!(results.len(), 3);
        let seen = order.lock().await;
        // "a" ran exactly once, before its dependents.
        assert_eq!(seen.iter().filter(|id| id.as_str() == "a").count(), 1);
        assert!(
            seen.iter().position(|id| id == "a") < seen.iter().position(|id| id == "b")
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submissions() {
        let pool = Arc::new(WorkerPool::new(pool_config(2, 10, 1000)));
        pool.shutdown().await;
        let err = pool.submit(sleeping("late", 1), schedule()).err().unwrap();
        assert!(matches!(err, WorkerError::PoolShutdown));
    }
}
