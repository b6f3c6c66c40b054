// State store: the durable records the engine reads and writes at job
// boundaries. Implementations: `MemoryStore` (here) and the SQLite-backed
// `Database` in arcflow-storage.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::error::StoreError;
use crate::job::JobStatus;
use crate::package::{PackageStatus, Stage};

/// Persisted package state. `current_path` is stored with the shared
/// directory abstracted as a `%sharedPath%` prefix.
#[derive(Debug, Clone)]
pub struct PackageRecord {
    /// Package uuid; also the SIP unit id
    pub sip_id: Uuid,
    pub transfer_id: Uuid,
    pub name: String,
    pub url: String,
    pub stage: Stage,
    pub current_path: String,
    pub aip_filename: Option<String>,
    pub status: PackageStatus,
    pub config: ProcessingConfig,
    pub created_at: DateTime<Utc>,
}

/// Persisted job state, keyed by the unit id that was current when the job
/// ran (transfer id during Transfer, SIP id during Ingest).
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub link_id: Uuid,
    pub name: String,
    pub group: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub file_id: Option<Uuid>,
    pub filename: String,
    pub execution: String,
    pub arguments: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A file known to the catalog, attached to a transfer and/or a SIP.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: Uuid,
    pub transfer_id: Option<Uuid>,
    pub sip_id: Option<Uuid>,
    pub original_location: String,
    /// Location template containing `%transferDirectory%`/`%SIPDirectory%`
    pub current_location: String,
    pub file_group_use: String,
}

/// A persisted unit variable: processing choices and context additions made
/// while a unit runs.
#[derive(Debug, Clone)]
pub struct UnitVariableRecord {
    pub unit_type: String,
    pub unit_id: Uuid,
    pub variable: String,
    pub value: String,
    /// Link id stashed for later link-pull
    pub chain_link_id: Option<Uuid>,
}

/// Durable key-value state the engine requires. All methods are expected to
/// be cheap; they are called on every job boundary.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_package(&self, package: &PackageRecord) -> Result<(), StoreError>;
    async fn get_package(&self, id: Uuid) -> Result<Option<PackageRecord>, StoreError>;
    async fn update_package_status(
        &self,
        id: Uuid,
        status: PackageStatus,
    ) -> Result<(), StoreError>;
    /// Packages that were mid-workflow when the process last stopped.
    async fn list_processing_packages(&self) -> Result<Vec<PackageRecord>, StoreError>;

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError>;
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError>;
    /// Jobs for one unit, oldest first.
    async fn list_jobs(&self, unit_id: Uuid) -> Result<Vec<JobRecord>, StoreError>;
    async fn latest_job(&self, unit_id: Uuid) -> Result<Option<JobRecord>, StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    async fn put_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError>;
    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<TaskRecord>, StoreError>;

    /// Catalog files attached to the unit (by transfer or SIP id).
    async fn list_files(&self, unit_id: Uuid) -> Result<Vec<FileRecord>, StoreError>;

    async fn get_unit_variables(
        &self,
        unit_id: Uuid,
    ) -> Result<Vec<UnitVariableRecord>, StoreError>;
    async fn get_unit_variable(
        &self,
        unit_id: Uuid,
        variable: &str,
    ) -> Result<Option<UnitVariableRecord>, StoreError>;
    /// Upsert on (unit_type, unit_id, variable).
    async fn set_unit_variable(&self, variable: &UnitVariableRecord) -> Result<(), StoreError>;
}
