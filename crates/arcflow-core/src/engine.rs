// The engine facade: owned references to the workflow, queue, task backend,
// state store and metrics. Components receive it as an `EngineContext`;
// there is no global state.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{LocalTaskBackend, TaskExecutor};
use crate::chain::JobChain;
use crate::config::{EngineConfig, ProcessingConfig};
use crate::error::{EngineError, StoreError};
use crate::job::Job;
use crate::metrics::EngineMetrics;
use crate::package::{Package, PackageStatus, Stage};
use crate::queue::PackageQueue;
use crate::store::{JobRecord, PackageRecord, StateStore, TaskRecord};
use crate::workflow::{LinkManager, Workflow};

/// Everything a running job needs, shared by reference.
pub struct EngineContext {
    pub workflow: Arc<Workflow>,
    pub store: Arc<dyn StateStore>,
    pub backend: LocalTaskBackend,
    pub config: EngineConfig,
    pub metrics: Arc<EngineMetrics>,
}

/// Status snapshot returned to RPC callers.
pub struct PackageStatusReport {
    pub status: PackageStatus,
    /// Name of the most recent job, for in-flight packages
    pub job: Option<String>,
    /// Ordered execution history across both units
    pub jobs: Vec<JobRecord>,
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    queue: Arc<PackageQueue>,
}

impl Engine {
    pub fn new(
        workflow: Arc<Workflow>,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn TaskExecutor>,
        config: EngineConfig,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let queue = Arc::new(PackageQueue::new(&config, metrics.clone()));
        let backend =
            LocalTaskBackend::new(executor, &config, queue.shutdown_signal(), metrics.clone());
        let ctx = Arc::new(EngineContext {
            workflow,
            store,
            backend,
            config,
            metrics,
        });
        Self { ctx, queue }
    }

    pub fn context(&self) -> Arc<EngineContext> {
        self.ctx.clone()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.ctx.metrics
    }

    pub fn queue(&self) -> &Arc<PackageQueue> {
        &self.queue
    }

    /// Create a package and admit it for processing. Returns its uuid.
    pub async fn submit(
        &self,
        name: &str,
        url: &str,
        config: Option<ProcessingConfig>,
    ) -> Result<Uuid, EngineError> {
        if name.is_empty() {
            return Err(EngineError::invalid_argument("no transfer name provided"));
        }
        if url.is_empty() {
            return Err(EngineError::invalid_argument("no url provided"));
        }

        let package = Package::create(
            self.ctx.store.as_ref(),
            name,
            url,
            config.unwrap_or_default(),
            self.ctx.config.directories.clone(),
        )
        .await?;
        let package_uuid = package.uuid();
        let package_kind = package.kind();

        let chain = JobChain::new(
            self.ctx.workflow.clone(),
            self.ctx.workflow.get_initiator(),
        )?;
        let link = chain
            .current_link()
            .ok_or_else(|| EngineError::job_internal("initiator chain has no current link"))?;
        let job = Job::new(
            link,
            chain,
            Arc::new(Mutex::new(package)),
            package_uuid,
            package_kind,
        );

        self.queue.schedule_job(job).await?;
        info!(package_id = %package_uuid, name = %name, "package submitted");
        Ok(package_uuid)
    }

    /// Re-admit one package left mid-workflow by a previous process: the job
    /// chain is reconstructed at the stored link position. Returns false for
    /// packages that are already finished.
    pub async fn resume(&self, package_id: Uuid) -> Result<bool, EngineError> {
        let record = self
            .ctx
            .store
            .get_package(package_id)
            .await?
            .ok_or(StoreError::PackageNotFound(package_id))?;
        if record.status.is_final() {
            return Ok(false);
        }

        let package = Package::from_record(record, self.ctx.config.directories.clone());
        let package_uuid = package.uuid();
        let package_kind = package.kind();

        let latest = self.ctx.store.latest_job(package.sub_id()).await?;
        let chain = match latest {
            Some(job) => JobChain::at_link(self.ctx.workflow.clone(), job.link_id)?,
            // Nothing ran yet; start from the top.
            None => JobChain::new(
                self.ctx.workflow.clone(),
                self.ctx.workflow.get_initiator(),
            )?,
        };
        let link = chain
            .current_link()
            .ok_or_else(|| EngineError::job_internal("resumed chain has no current link"))?;
        let job = Job::new(
            link,
            chain,
            Arc::new(Mutex::new(package)),
            package_uuid,
            package_kind,
        );

        self.queue.schedule_job(job).await?;
        info!(package_id = %package_uuid, "package resumed");
        Ok(true)
    }

    /// Resume every package the store still reports as processing.
    pub async fn resume_all(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for record in self.ctx.store.list_processing_packages().await? {
            match self.resume(record.sip_id).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(package_id = %record.sip_id, error = %err, "package could not be resumed");
                }
            }
        }
        Ok(resumed)
    }

    /// Status of a package: the persisted final outcome, or Processing with
    /// the most recent job name while the package is active.
    pub async fn status(&self, package_id: Uuid) -> Result<PackageStatusReport, EngineError> {
        let record = self
            .ctx
            .store
            .get_package(package_id)
            .await?
            .ok_or(StoreError::PackageNotFound(package_id))?;

        let mut jobs = self.ctx.store.list_jobs(record.transfer_id).await?;
        jobs.extend(self.ctx.store.list_jobs(record.sip_id).await?);

        if self.queue.is_package_active(package_id) {
            let unit_id = match record.stage {
                Stage::Transfer => record.transfer_id,
                Stage::Ingest => record.sip_id,
            };
            let job = self.ctx.store.latest_job(unit_id).await?;
            return Ok(PackageStatusReport {
                status: PackageStatus::Processing,
                job: job.map(|j| j.name),
                jobs,
            });
        }

        let status = match record.status {
            PackageStatus::Unspecified | PackageStatus::Processing => {
                self.derive_status(&record).await?
            }
            final_status => final_status,
        };
        let job = jobs.last().map(|j| j.name.clone());
        Ok(PackageStatusReport { status, job, jobs })
    }

    /// Fallback derivation for packages persisted without a final status:
    /// inspect the most recent job's group and link.
    async fn derive_status(&self, record: &PackageRecord) -> Result<PackageStatus, EngineError> {
        let mut latest = self.ctx.store.latest_job(record.sip_id).await?;
        if latest.is_none() {
            latest = self.ctx.store.latest_job(record.transfer_id).await?;
        }
        let Some(job) = latest else {
            return Ok(PackageStatus::Processing);
        };

        let group = job.group.to_lowercase();
        if group.contains("fail") {
            return Ok(PackageStatus::Failed);
        }
        if group.contains("reject") {
            return Ok(PackageStatus::Rejected);
        }
        if let Some(link) = self.ctx.workflow.get_link(job.link_id) {
            if let LinkManager::OutputDecision(config) = &link.manager {
                return Ok(config.outcome);
            }
        }
        Ok(PackageStatus::Processing)
    }

    /// Tasks recorded for one job.
    pub async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<TaskRecord>, EngineError> {
        if self.ctx.store.get_job(job_id).await?.is_none() {
            return Err(EngineError::invalid_argument(format!(
                "job not found: {job_id}"
            )));
        }
        Ok(self.ctx.store.list_tasks(job_id).await?)
    }

    /// Run the processing loop until `stop` is observed.
    pub async fn run(&self) {
        self.queue.work(self.ctx.clone()).await;
    }

    /// Trigger graceful shutdown.
    pub fn stop(&self) {
        self.queue.stop();
    }
}
