use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::error::AppError;
use tokio::{sync::Semaphore, task::JoinSet, time::timeout};
use tracing::{debug, error};

/// Invoked once per task completion with `(completed, total, worker_id, msg)`.
/// The final `(total, total)` call is delivered exactly once.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str, &str) + Send + Sync>;

/// Outcome of a single pooled task. Timeouts and failures are values in the
/// result slot of the task that produced them; siblings are unaffected.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<R> {
    Ok(R),
    Failed(String),
    TimedOut(u64),
}

impl<R> TaskOutcome<R> {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok(_))
    }

    pub fn into_result(self) -> Result<R, String> {
        match self {
            TaskOutcome::Ok(value) => Ok(value),
            TaskOutcome::Failed(message) => Err(message),
            TaskOutcome::TimedOut(secs) => Err(format!("Timeout after {secs}s")),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            TaskOutcome::Ok(_) => None,
            TaskOutcome::Failed(message) => Some(message.clone()),
            TaskOutcome::TimedOut(secs) => Some(format!("Timeout after {secs}s")),
        }
    }
}

/// Bounded-concurrency executor: a counting semaphore serializes task start,
/// each task gets its own deadline, and the result vector is indexed by input
/// position. One failing task never cancels its siblings.
#[derive(Clone)]
pub struct WorkerPool {
    max_concurrent: usize,
    per_task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, per_task_timeout: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            per_task_timeout,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn run<T, R, F, Fut>(
        &self,
        tasks: Vec<T>,
        worker: F,
        progress: Option<ProgressCallback>,
    ) -> Vec<TaskOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<R, AppError>> + Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let completed = Arc::new(AtomicUsize::new(0));
        let per_task_timeout = self.per_task_timeout;
        let max_concurrent = self.max_concurrent;

        let mut join_set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let progress = progress.clone();
            let worker = worker.clone();

            join_set.spawn(async move {
                let worker_id = format!("worker-{}", index % max_concurrent);

                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        debug!(worker_id = %worker_id, index, "task started");
                        // The permit is dropped on every exit path below.
                        match timeout(per_task_timeout, worker(index, task)).await {
                            Ok(Ok(value)) => TaskOutcome::Ok(value),
                            Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
                            Err(_) => TaskOutcome::TimedOut(per_task_timeout.as_secs()),
                        }
                    }
                    Err(_) => TaskOutcome::Failed("worker pool closed".to_string()),
                };

                let done = completed.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                if let Some(callback) = progress.as_ref() {
                    callback(
                        done,
                        total,
                        &worker_id,
                        &format!("completed {done}/{total}"),
                    );
                }

                (index, outcome)
            });
        }

        let mut results: Vec<Option<TaskOutcome<R>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = results.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(err) => {
                    error!(error = %err, "pooled task panicked");
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| TaskOutcome::Failed("task panicked".to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Gauge;
    use std::time::Instant;

    #[tokio::test]
    async fn test_results_are_indexed_by_input_position() {
        let pool = WorkerPool::new(4, Duration::from_secs(5));
        let results = pool
            .run(
                vec![3_u64, 1, 2],
                |_idx, value| async move {
                    // Finish out of order on purpose.
                    tokio::time::sleep(Duration::from_millis(value * 20)).await;
                    Ok::<u64, AppError>(value * 10)
                },
                None,
            )
            .await;

        let values: Vec<_> = results
            .into_iter()
            .map(|r| r.into_result().expect("ok"))
            .collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let in_flight = Arc::new(Gauge::new(0));
        let peak = Arc::new(Gauge::new(0));

        let pool = WorkerPool::new(5, Duration::from_secs(5));
        let in_flight_task = Arc::clone(&in_flight);
        let peak_task = Arc::clone(&peak);
        let results = pool
            .run(
                (0..20).collect::<Vec<u32>>(),
                move |_idx, _value| {
                    let in_flight = Arc::clone(&in_flight_task);
                    let peak = Arc::clone(&peak_task);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), AppError>(())
                    }
                },
                None,
            )
            .await;

        assert_eq!(results.len(), 20);
        assert!(results.iter().all(TaskOutcome::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 5, "semaphore bound violated");
    }

    #[tokio::test]
    async fn test_parallel_speedup_over_serial() {
        // 20 tasks sleeping 50ms each with 5 permits must finish well under
        // the serial duration.
        let pool = WorkerPool::new(5, Duration::from_secs(5));
        let started = Instant::now();
        let results = pool
            .run(
                (0..20).collect::<Vec<u32>>(),
                |_idx, _value| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<(), AppError>(())
                },
                None,
            )
            .await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 20);
        assert!(
            elapsed < Duration::from_millis(20 * 50 / 3),
            "expected at least 3x speedup, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_one_task() {
        let pool = WorkerPool::new(2, Duration::from_millis(50));
        let results = pool
            .run(
                vec![10_u64, 500, 10],
                |_idx, sleep_ms| async move {
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    Ok::<u64, AppError>(sleep_ms)
                },
                None,
            )
            .await;

        assert!(results.first().is_some_and(TaskOutcome::is_ok));
        assert!(matches!(results.get(1), Some(TaskOutcome::TimedOut(_))));
        assert!(results.get(2).is_some_and(TaskOutcome::is_ok));
    }

    #[tokio::test]
    async fn test_progress_final_call_fires_exactly_once() {
        let final_calls = Arc::new(Gauge::new(0));
        let final_calls_cb = Arc::clone(&final_calls);
        let callback: ProgressCallback = Arc::new(move |done, total, _worker, _msg| {
            if done == total {
                final_calls_cb.fetch_add(1, Ordering::SeqCst);
            }
        });

        let pool = WorkerPool::new(3, Duration::from_secs(1));
        pool.run(
            (0..7).collect::<Vec<u32>>(),
            |_idx, _value| async move { Ok::<(), AppError>(()) },
            Some(callback),
        )
        .await;

        assert_eq!(final_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_captured_per_task() {
        let pool = WorkerPool::new(2, Duration::from_secs(1));
        let results = pool
            .run(
                vec![true, false],
                |_idx, fail| async move {
                    if fail {
                        Err(AppError::Processing("bad input".into()))
                    } else {
                        Ok::<(), AppError>(())
                    }
                },
                None,
            )
            .await;

        assert!(results
            .first()
            .and_then(|r| r.error_message())
            .is_some_and(|m| m.contains("bad input")));
        assert!(results.get(1).is_some_and(TaskOutcome::is_ok));
    }
}
