// Job: one execution of one workflow link for one package.
//
// A job generates the tasks its link calls for, waits for the batch, folds
// the results into a single exit code, and selects the next link. Errors and
// panics inside the job body become a Failed status; they never reach the
// scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::JobChain;
use crate::engine::EngineContext;
use crate::error::{BackendError, EngineError};
use crate::package::{Package, PackageStatus, PackageType};
use crate::store::{JobRecord, TaskRecord};
use crate::task::{aggregate_exit_code, Task, TaskResult};
use crate::workflow::{
    ChainChoiceConfig, ChoiceConfig, GetVariableConfig, Link, LinkManager, OutputDecisionConfig,
    SetVariableConfig, StandardConfig, TaskScope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unknown,
    AwaitingDecision,
    Executing,
    CompletedOk,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::AwaitingDecision => "awaiting_decision",
            JobStatus::Executing => "executing",
            JobStatus::CompletedOk => "completed_ok",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "unknown" => Some(JobStatus::Unknown),
            "awaiting_decision" => Some(JobStatus::AwaitingDecision),
            "executing" => Some(JobStatus::Executing),
            "completed_ok" => Some(JobStatus::CompletedOk),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished job hands back to the scheduler.
pub struct JobCompletion {
    pub job_id: Uuid,
    pub package_uuid: Uuid,
    pub status: JobStatus,
    /// The completed link was marked `end`
    pub terminal: bool,
    /// Final package status to persist, present only at walk end
    pub final_status: Option<PackageStatus>,
    pub next: Option<Job>,
}

/// (status, next link already entered in the chain, final package status)
type JobStep = (JobStatus, Option<Arc<Link>>, Option<PackageStatus>);

pub struct Job {
    pub id: Uuid,
    link: Arc<Link>,
    chain: JobChain,
    package: Arc<Mutex<Package>>,
    package_uuid: Uuid,
    package_kind: PackageType,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        link: Arc<Link>,
        chain: JobChain,
        package: Arc<Mutex<Package>>,
        package_uuid: Uuid,
        package_kind: PackageType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            link,
            chain,
            package,
            package_uuid,
            package_kind,
            created_at: Utc::now(),
        }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn package_uuid(&self) -> Uuid {
        self.package_uuid
    }

    pub fn package_kind(&self) -> PackageType {
        self.package_kind
    }

    /// Execute the link and return the completion the scheduler folds back
    /// into the queue. Never panics and never returns an error: every
    /// failure mode lands as a status.
    pub async fn run(mut self, ctx: Arc<EngineContext>) -> JobCompletion {
        let job_id = self.id;
        let package_uuid = self.package_uuid;
        info!(
            job_id = %job_id,
            package_id = %package_uuid,
            link_id = %self.link.id,
            group = %self.link.group,
            manager = self.link.manager.kind(),
            "job starting"
        );

        let result = std::panic::AssertUnwindSafe(self.execute(&ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok((status, next_link, final_status))) => {
                let terminal = self.link.is_terminal();
                if terminal && next_link.is_some() {
                    warn!(
                        link_id = %self.link.id,
                        "terminal link produced another job; check the workflow's end flags"
                    );
                }
                let next = self.into_next(next_link).await;
                JobCompletion {
                    job_id,
                    package_uuid,
                    status,
                    terminal,
                    final_status,
                    next,
                }
            }
            Ok(Err(err)) => {
                error!(
                    job_id = %job_id,
                    package_id = %package_uuid,
                    link_id = %self.link.id,
                    error = %err,
                    "job failed internally"
                );
                let _ = ctx
                    .store
                    .update_job_status(job_id, JobStatus::Failed, None)
                    .await;

                // Advance via the fallback edge where one exists; otherwise
                // the package terminates as failed.
                let fallback = self.link.fallback_link_id;
                let terminal = self.link.is_terminal();
                let next_link = fallback.and_then(|id| self.chain.advance(Some(id)).ok().flatten());
                let finished = next_link.is_none();
                let next = self.into_next(next_link).await;
                JobCompletion {
                    job_id,
                    package_uuid,
                    status: JobStatus::Failed,
                    terminal,
                    final_status: finished.then_some(PackageStatus::Failed),
                    next,
                }
            }
            Err(panic) => {
                let detail = panic_message(panic);
                error!(
                    job_id = %job_id,
                    package_id = %package_uuid,
                    panic = %detail,
                    "job panicked"
                );
                let _ = ctx
                    .store
                    .update_job_status(job_id, JobStatus::Failed, None)
                    .await;
                JobCompletion {
                    job_id,
                    package_uuid,
                    status: JobStatus::Failed,
                    terminal: true,
                    final_status: Some(PackageStatus::Failed),
                    next: None,
                }
            }
        }
    }

    /// Build the next job from the remains of this one.
    async fn into_next(self, next_link: Option<Arc<Link>>) -> Option<Job> {
        let link = next_link?;
        let (package_uuid, package_kind) = {
            let package = self.package.lock().await;
            (package.uuid(), package.kind())
        };
        Some(Job::new(
            link,
            self.chain,
            self.package,
            package_uuid,
            package_kind,
        ))
    }

    async fn execute(&mut self, ctx: &EngineContext) -> Result<JobStep, EngineError> {
        let unit_id = {
            let package = self.package.lock().await;
            package.sub_id()
        };
        ctx.store
            .put_job(&JobRecord {
                id: self.id,
                unit_id,
                link_id: self.link.id,
                name: self.link.description.clone(),
                group: self.link.group.clone(),
                status: JobStatus::Executing,
                exit_code: None,
                created_at: self.created_at,
            })
            .await?;

        let manager = self.link.manager.clone();
        match &manager {
            LinkManager::Standard(config) => self.run_standard(config, ctx).await,
            LinkManager::Choice(config) => self.run_choice(config, ctx).await,
            LinkManager::ChainChoice(config) => self.run_chain_choice(config, ctx).await,
            LinkManager::SetVariable(config) => self.run_set_variable(config, ctx).await,
            LinkManager::GetVariable(config) => self.run_get_variable(config, ctx).await,
            LinkManager::OutputDecision(config) => self.run_output_decision(config, ctx).await,
        }
    }

    async fn run_standard(
        &mut self,
        config: &StandardConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        let tasks = self.build_tasks(config, ctx).await?;
        if tasks.is_empty() {
            return self.finish(ctx, 0).await;
        }

        let batch = ctx.backend.execute_batch(tasks).await;
        let (results, transport) = match batch {
            Ok(results) => (results, None),
            Err(BackendError::PartialFailure { results, .. }) => (results, None),
            Err(BackendError::Transport { detail, results }) => (results, Some(detail)),
        };
        self.persist_task_results(&results, ctx).await?;

        if let Some(detail) = transport {
            warn!(
                job_id = %self.id,
                detail = %detail,
                "task batch transport failure; following fallback"
            );
            let fallback = self.link.fallback_link_id;
            return self.conclude(ctx, fallback, JobStatus::Failed, None).await;
        }

        let exit_code = aggregate_exit_code(&results);
        self.finish(ctx, exit_code).await
    }

    async fn run_choice(
        &mut self,
        config: &ChoiceConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        let decision = ctx
            .store
            .get_unit_variable(self.unit_id().await, &self.link.id.to_string())
            .await?;

        match decision {
            Some(variable) => {
                let target: Uuid = variable.value.trim().parse().map_err(|_| {
                    EngineError::job_internal(format!(
                        "choice for link {} is not a link id: {}",
                        self.link.id, variable.value
                    ))
                })?;
                if !config.choices.iter().any(|c| c.link_id == target) {
                    warn!(
                        link_id = %self.link.id,
                        chosen = %target,
                        "pre-recorded decision is not among the link's choices"
                    );
                }
                self.conclude(ctx, Some(target), JobStatus::CompletedOk, Some(0))
                    .await
            }
            None => self.park_awaiting(ctx).await,
        }
    }

    async fn run_chain_choice(
        &mut self,
        config: &ChainChoiceConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        let decision = ctx
            .store
            .get_unit_variable(self.unit_id().await, &self.link.id.to_string())
            .await?;

        match decision {
            Some(variable) => {
                let chain_id: Uuid = variable.value.trim().parse().map_err(|_| {
                    EngineError::job_internal(format!(
                        "chain choice for link {} is not a chain id: {}",
                        self.link.id, variable.value
                    ))
                })?;
                if !config.choices.iter().any(|c| c.chain_id == chain_id) {
                    warn!(
                        link_id = %self.link.id,
                        chosen = %chain_id,
                        "pre-recorded decision is not among the link's chains"
                    );
                }
                ctx.store
                    .update_job_status(self.id, JobStatus::CompletedOk, Some(0))
                    .await?;
                let start = self.chain.switch_chain(chain_id)?;
                Ok((JobStatus::CompletedOk, Some(start), None))
            }
            None => self.park_awaiting(ctx).await,
        }
    }

    async fn run_set_variable(
        &mut self,
        config: &SetVariableConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        {
            let package = self.package.lock().await;
            package
                .set_variable(
                    ctx.store.as_ref(),
                    &config.variable,
                    &config.value,
                    config.chain_link_id,
                )
                .await?;
        }
        self.finish(ctx, 0).await
    }

    async fn run_get_variable(
        &mut self,
        config: &GetVariableConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        let variable = ctx
            .store
            .get_unit_variable(self.unit_id().await, &config.variable)
            .await?;

        // The default exit wins; a link id stored with the variable is the
        // jump target only when the link defines no edge of its own.
        let (next, _) = self.link.resolve_exit(0);
        let next = match (next, variable.as_ref().and_then(|v| v.chain_link_id)) {
            (Some(next), _) => Some(next),
            (None, stored) => stored,
        };
        self.conclude(ctx, next, JobStatus::CompletedOk, Some(0))
            .await
    }

    async fn run_output_decision(
        &mut self,
        config: &OutputDecisionConfig,
        ctx: &EngineContext,
    ) -> Result<JobStep, EngineError> {
        ctx.store
            .update_job_status(self.id, JobStatus::CompletedOk, Some(0))
            .await?;
        self.chain.advance(None)?;
        info!(
            package_id = %self.package_uuid,
            outcome = ?config.outcome,
            "package reached output decision"
        );
        Ok((JobStatus::CompletedOk, None, Some(config.outcome)))
    }

    /// Look up the matched exit-code entry and move the chain along it.
    async fn finish(&mut self, ctx: &EngineContext, exit_code: i32) -> Result<JobStep, EngineError> {
        let (next, status) = self.link.resolve_exit(exit_code);
        self.conclude(ctx, next, status, Some(exit_code)).await
    }

    async fn conclude(
        &mut self,
        ctx: &EngineContext,
        next: Option<Uuid>,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<JobStep, EngineError> {
        ctx.store
            .update_job_status(self.id, status, exit_code)
            .await?;

        if self.link.start_ingest && status != JobStatus::Failed {
            let mut package = self.package.lock().await;
            package.start_ingest();
            ctx.store.put_package(&package.record()).await?;
        }

        let next_link = self.chain.advance(next)?;
        let final_status = if next_link.is_none() {
            Some(match status {
                JobStatus::Failed => PackageStatus::Failed,
                _ => PackageStatus::Complete,
            })
        } else {
            None
        };
        Ok((status, next_link, final_status))
    }

    async fn park_awaiting(&mut self, ctx: &EngineContext) -> Result<JobStep, EngineError> {
        ctx.store
            .update_job_status(self.id, JobStatus::AwaitingDecision, None)
            .await?;
        info!(
            job_id = %self.id,
            package_id = %self.package_uuid,
            link_id = %self.link.id,
            "no pre-recorded decision; package paused awaiting input"
        );
        Ok((JobStatus::AwaitingDecision, None, None))
    }

    async fn build_tasks(
        &mut self,
        config: &StandardConfig,
        ctx: &EngineContext,
    ) -> Result<Vec<Task>, EngineError> {
        let mut package = self.package.lock().await;
        package.reload(ctx.store.as_ref()).await?;

        let mut replacements = package.get_replacement_mapping();
        replacements.extend(&package.context(ctx.store.as_ref()).await?);

        match config.scope {
            TaskScope::Unit => {
                let arguments = replacements.replace(&config.arguments);
                Ok(vec![Task::new(self.id, &config.execute, arguments)])
            }
            TaskScope::Files => {
                let mut tasks = Vec::new();
                let files = package
                    .files(ctx.store.as_ref(), config.filter_subdirectory.as_deref())
                    .await?;
                for file_mapping in files {
                    if let Some(group) = &config.filter_file_group_use {
                        if file_mapping.get("fileGrpUse") != Some(group.as_str()) {
                            continue;
                        }
                    }
                    if let Some(wanted) = config.filter_identified {
                        let identified = file_mapping
                            .get("fileUUID")
                            .map(|v| v != "None")
                            .unwrap_or(false);
                        if identified != wanted {
                            continue;
                        }
                    }

                    let mut merged = replacements.clone();
                    merged.extend(&file_mapping);
                    let arguments = merged.replace(&config.arguments);
                    let file_id = file_mapping
                        .get("fileUUID")
                        .and_then(|v| v.parse::<Uuid>().ok());
                    let filename = file_mapping
                        .get("fileName")
                        .map(str::to_string)
                        .or_else(|| {
                            file_mapping.get("relativeLocation").map(|location| {
                                std::path::Path::new(location)
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_default()
                            })
                        })
                        .unwrap_or_default();
                    tasks.push(Task::for_file(
                        self.id,
                        &config.execute,
                        arguments,
                        file_id,
                        filename,
                    ));
                }
                Ok(tasks)
            }
        }
    }

    async fn persist_task_results(
        &self,
        results: &[TaskResult],
        ctx: &EngineContext,
    ) -> Result<(), EngineError> {
        let records: Vec<TaskRecord> = results
            .iter()
            .map(|result| TaskRecord {
                id: result.task.id,
                job_id: result.task.job_id,
                file_id: result.task.file_id,
                filename: result.task.filename.clone(),
                execution: result.task.execution.clone(),
                arguments: result.task.arguments.clone(),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: Some(result.exit_code),
                started_at: result.started_at,
                ended_at: Some(result.ended_at),
            })
            .collect();
        ctx.store.put_tasks(&records).await?;
        Ok(())
    }

    async fn unit_id(&self) -> Uuid {
        self.package.lock().await.sub_id()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
