//! Bounded-concurrency execution of many actions.
//!
//! At most `max_concurrent` executions are in flight at once. Each one is
//! wrapped in `timeout_per_action`; a timed-out or failed item is recorded in
//! the result and never cancels its siblings. Progress is reported in
//! completion order from a separate task, so a slow callback never holds up
//! in-flight executions. Every callback has run when the batch returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::audit::Actor;
use crate::config::BatchConfig;
use crate::executor::{ActionRunner, ExecutionError, ExecutionRequest, ExecutionResult};
use crate::value::Properties;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub entity_id: String,
    pub success: bool,
    pub error: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(BatchProgress) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemSuccess {
    pub entity_id: String,
    pub changes: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    pub entity_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub successes: Vec<BatchItemSuccess>,
    pub failures: Vec<BatchItemFailure>,
    pub duration: Duration,
}

impl BatchExecutionResult {
    fn record(&mut self, entity_id: String, result: ExecutionResult) {
        if result.success {
            self.succeeded += 1;
            self.successes.push(BatchItemSuccess {
                entity_id,
                changes: result.changes,
            });
        } else {
            self.failed += 1;
            self.failures.push(BatchItemFailure {
                entity_id,
                error: result.error.unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

#[derive(Clone)]
pub struct BatchExecutor {
    runner: Arc<dyn ActionRunner>,
    config: BatchConfig,
}

impl BatchExecutor {
    pub fn new(runner: Arc<dyn ActionRunner>, config: BatchConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Runs every request and waits for all of them to settle.
    pub async fn execute_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        actor: Option<&Actor>,
        progress: Option<ProgressCallback>,
    ) -> BatchExecutionResult {
        let started = Instant::now();
        let total = requests.len();
        let mut result = BatchExecutionResult {
            total,
            ..Default::default()
        };
        if total == 0 {
            return result;
        }
        info!(
            "batch of {} executions, max {} concurrent",
            total, self.config.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut in_flight = FuturesUnordered::new();
        for request in requests {
            let semaphore = semaphore.clone();
            in_flight.push(async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => self.run_with_retry(&request, actor).await,
                    Err(e) => ExecutionResult {
                        success: false,
                        error: Some(format!("Batch admission failed: {}", e)),
                        ..Default::default()
                    },
                };
                (request.entity_id, outcome)
            });
        }

        // コールバックは別タスクで順に処理し、実行中の項目を止めない
        let (progress_tx, reporter) = match progress {
            Some(callback) => {
                let (sender, mut receiver) = mpsc::unbounded_channel::<BatchProgress>();
                let reporter = tokio::spawn(async move {
                    while let Some(update) = receiver.recv().await {
                        callback(update).await;
                    }
                });
                (Some(sender), Some(reporter))
            }
            None => (None, None),
        };

        let mut completed = 0;
        while let Some((entity_id, outcome)) = in_flight.next().await {
            completed += 1;
            if let Some(sender) = &progress_tx {
                let update = BatchProgress {
                    completed,
                    total,
                    entity_id: entity_id.clone(),
                    success: outcome.success,
                    error: outcome.error.clone(),
                };
                if sender.send(update).is_err() {
                    warn!("progress reporter stopped; dropping update for {}", entity_id);
                }
            }
            result.record(entity_id, outcome);
        }
        result.duration = started.elapsed();

        drop(progress_tx);
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                warn!("progress callback failed: {}", e);
            }
        }

        info!(
            "batch finished: {} succeeded, {} failed in {:?}",
            result.succeeded, result.failed, result.duration
        );
        result
    }

    async fn run_with_retry(
        &self,
        request: &ExecutionRequest,
        actor: Option<&Actor>,
    ) -> ExecutionResult {
        let attempts = if self.config.retry_on_failure {
            1 + self.config.max_retries
        } else {
            1
        };
        let timeout_ms = self.config.timeout_per_action.as_millis() as u64;

        let mut last = ExecutionResult::default();
        for attempt in 1..=attempts {
            last = match tokio::time::timeout(
                self.config.timeout_per_action,
                self.runner.run(request, actor, 0),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "{}.{} on {} timed out after {}ms",
                        request.entity_type, request.action_name, request.entity_id, timeout_ms
                    );
                    ExecutionResult::failed(&ExecutionError::Timeout(timeout_ms))
                }
            };
            if last.success {
                break;
            }
            if attempt < attempts {
                debug!(
                    "retrying {} (attempt {} of {})",
                    request.entity_id,
                    attempt + 1,
                    attempts
                );
            }
        }
        last
    }

    /// Runs the batch on its own task. Progress arrives on the stream in
    /// completion order; the stream ends when the batch does.
    pub fn spawn_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        actor: Option<Actor>,
    ) -> (ReceiverStream<BatchProgress>, JoinHandle<BatchExecutionResult>) {
        let (sender, receiver) = mpsc::channel(requests.len().max(1));
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            let callback: ProgressCallback = Arc::new(move |progress: BatchProgress| {
                let sender = sender.clone();
                async move {
                    // 受信側が閉じていても続行する
                    let _ = sender.send(progress).await;
                }
                .boxed()
            });
            executor
                .execute_batch(requests, actor.as_ref(), Some(callback))
                .await
        });
        (ReceiverStream::new(receiver), handle)
    }
}
