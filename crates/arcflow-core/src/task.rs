// Task: one unit of work inside a job, typically one invocation of a tool
// against one file. Tasks are pure descriptors; the backend executes them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Exit code recorded for a task cancelled on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -2;

/// Exit code recorded when the executor could not run the command at all.
pub const DISPATCH_FAILED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Command name resolved by the task executor
    pub execution: String,
    /// Fully interpolated arguments template
    pub arguments: String,
    pub file_id: Option<Uuid>,
    pub filename: String,
}

impl Task {
    pub fn new(job_id: Uuid, execution: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            execution: execution.into(),
            arguments: arguments.into(),
            file_id: None,
            filename: String::new(),
        }
    }

    pub fn for_file(
        job_id: Uuid,
        execution: impl Into<String>,
        arguments: impl Into<String>,
        file_id: Option<Uuid>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            execution: execution.into(),
            arguments: arguments.into(),
            file_id,
            filename: filename.into(),
        }
    }
}

/// What the executor produced for one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A task paired with its collected outcome and timing.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }
}

/// Fold task exit codes into the owning job's exit code: the maximum wins,
/// so any single failure dominates. An empty batch yields 0.
pub fn aggregate_exit_code(results: &[TaskResult]) -> i32 {
    results.iter().map(|r| r.exit_code).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> TaskResult {
        let task = Task::new(Uuid::new_v4(), "echo", "");
        TaskResult {
            task,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn test_aggregate_takes_maximum() {
        let results = vec![result(0), result(0), result(2)];
        assert_eq!(aggregate_exit_code(&results), 2);
    }

    #[test]
    fn test_aggregate_empty_batch_is_zero() {
        assert_eq!(aggregate_exit_code(&[]), 0);
    }

    #[test]
    fn test_aggregate_timeout_dominates_success() {
        // -2 loses to any positive failure but the batch still fails overall
        let results = vec![result(TIMEOUT_EXIT_CODE), result(1)];
        assert_eq!(aggregate_exit_code(&results), 1);
    }
}
