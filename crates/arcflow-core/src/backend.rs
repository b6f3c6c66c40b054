// Task backend: executes batches of tasks on a bounded in-process pool.
//
// The backend owns batching, per-task timeouts and shutdown cancellation;
// the leaf execution is behind the `TaskExecutor` trait so tests can script
// exit codes and the server can swap in a different runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::metrics::EngineMetrics;
use crate::task::{Task, TaskOutcome, TaskResult, DISPATCH_FAILED_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// Executes a single task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task and return its outcome. An `Err` means the command could
    /// not be run at all; the backend folds it into a failed task result
    /// rather than aborting the batch.
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutcome>;
}

/// Production executor: spawns the task's command as a child process and
/// captures exit code, stdout and stderr.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutcome> {
        let arguments = shlex::split(&task.arguments).ok_or_else(|| {
            anyhow::anyhow!("unbalanced quoting in task arguments: {}", task.arguments)
        })?;

        debug!(execution = %task.execution, task_id = %task.id, "spawning task command");
        let output = Command::new(&task.execution)
            .args(&arguments)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(TaskOutcome {
            exit_code: output.status.code().unwrap_or(DISPATCH_FAILED_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// In-process task backend with a bounded worker pool.
pub struct LocalTaskBackend {
    executor: Arc<dyn TaskExecutor>,
    batch_size: usize,
    task_timeout: Duration,
    concurrency: Semaphore,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
}

impl LocalTaskBackend {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        config: &EngineConfig,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            executor,
            batch_size: config.batch_size,
            task_timeout: config.task_timeout,
            concurrency: Semaphore::new(config.worker_threads),
            shutdown,
            metrics,
        }
    }

    /// Execute every task and collect every result before returning.
    ///
    /// Tasks run in unspecified order, in parallel up to the pool size,
    /// grouped into batches of at most `batch_size`. One task failing never
    /// cancels its siblings. Returns `PartialFailure` when any task exited
    /// non-zero and `Transport` when shutdown interrupted dispatch; both
    /// carry the results collected so far.
    pub async fn execute_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskResult>, BackendError> {
        let total = tasks.len();
        let mut results: Vec<TaskResult> = Vec::with_capacity(total);
        let mut cancelled = false;

        for batch in tasks.chunks(self.batch_size) {
            if *self.shutdown.borrow() {
                cancelled = true;
                break;
            }

            let outcomes = futures::future::join_all(
                batch.iter().cloned().map(|task| self.run_one(task)),
            )
            .await;

            for outcome in outcomes {
                match outcome {
                    Some(result) => results.push(result),
                    None => cancelled = true,
                }
            }
            if cancelled {
                break;
            }
        }

        if cancelled {
            warn!(collected = results.len(), total, "task batch cancelled by shutdown");
            return Err(BackendError::Transport {
                detail: "shutdown in progress".to_string(),
                results,
            });
        }

        let failed = results.iter().filter(|r| r.failed()).count();
        if failed > 0 {
            return Err(BackendError::PartialFailure {
                failed,
                total,
                results,
            });
        }
        Ok(results)
    }

    /// Run one task under the pool limit. Returns `None` when shutdown
    /// cancelled the task before completion.
    async fn run_one(&self, task: Task) -> Option<TaskResult> {
        let _permit = self.concurrency.acquire().await.ok()?;

        let started_at = Utc::now();
        let timer = self.metrics.task_duration.start_timer();
        self.metrics.tasks_executed.inc();

        let shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            outcome = self.executor.execute(&task) => match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(task_id = %task.id, execution = %task.execution, error = %err, "task dispatch failed");
                    TaskOutcome {
                        exit_code: DISPATCH_FAILED_EXIT_CODE,
                        stdout: String::new(),
                        stderr: format!("{err:#}"),
                    }
                }
            },
            _ = tokio::time::sleep(self.task_timeout) => {
                self.metrics.task_timeouts.inc();
                warn!(task_id = %task.id, execution = %task.execution, "task exceeded wall-clock budget");
                TaskOutcome {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!(
                        "task cancelled after exceeding the {}s wall-clock budget",
                        self.task_timeout.as_secs()
                    ),
                }
            }
            _ = wait_for_shutdown(shutdown) => {
                return None;
            }
        };
        timer.observe_duration();

        Some(TaskResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            started_at,
            ended_at: Utc::now(),
            task,
        })
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without signalling; shutdown can never arrive.
            std::future::pending::<()>().await;
        }
    }
}
