// In-memory state store, used by tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::JobStatus;
use crate::package::PackageStatus;
use crate::store::{
    FileRecord, JobRecord, PackageRecord, StateStore, TaskRecord, UnitVariableRecord,
};

#[derive(Default)]
struct Inner {
    packages: HashMap<Uuid, PackageRecord>,
    jobs: Vec<JobRecord>,
    tasks: Vec<TaskRecord>,
    files: Vec<FileRecord>,
    unit_variables: Vec<UnitVariableRecord>,
}

/// Hash-map backed store with the same observable behavior as the SQLite
/// implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a catalog file, for tests exercising per-file task generation.
    pub async fn add_file(&self, file: FileRecord) {
        self.inner.write().await.files.push(file);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_package(&self, package: &PackageRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .packages
            .insert(package.sip_id, package.clone());
        Ok(())
    }

    async fn get_package(&self, id: Uuid) -> Result<Option<PackageRecord>, StoreError> {
        Ok(self.inner.read().await.packages.get(&id).cloned())
    }

    async fn update_package_status(
        &self,
        id: Uuid,
        status: PackageStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let package = inner
            .packages
            .get_mut(&id)
            .ok_or(StoreError::PackageNotFound(id))?;
        package.status = status;
        Ok(())
    }

    async fn list_processing_packages(&self) -> Result<Vec<PackageRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .packages
            .values()
            .filter(|p| p.status == PackageStatus::Processing)
            .cloned()
            .collect())
    }

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => inner.jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.status = status;
            job.exit_code = exit_code;
        }
        Ok(())
    }

    async fn list_jobs(&self, unit_id: Uuid) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .iter()
            .filter(|j| j.unit_id == unit_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn latest_job(&self, unit_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.list_jobs(unit_id).await?.into_iter().last())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn put_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError> {
        self.inner.write().await.tasks.extend_from_slice(tasks);
        Ok(())
    }

    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_files(&self, unit_id: Uuid) -> Result<Vec<FileRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .files
            .iter()
            .filter(|f| f.transfer_id == Some(unit_id) || f.sip_id == Some(unit_id))
            .cloned()
            .collect())
    }

    async fn get_unit_variables(
        &self,
        unit_id: Uuid,
    ) -> Result<Vec<UnitVariableRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .unit_variables
            .iter()
            .filter(|v| v.unit_id == unit_id)
            .cloned()
            .collect())
    }

    async fn get_unit_variable(
        &self,
        unit_id: Uuid,
        variable: &str,
    ) -> Result<Option<UnitVariableRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .unit_variables
            .iter()
            .find(|v| v.unit_id == unit_id && v.variable == variable)
            .cloned())
    }

    async fn set_unit_variable(&self, variable: &UnitVariableRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.unit_variables.iter_mut().find(|v| {
            v.unit_type == variable.unit_type
                && v.unit_id == variable.unit_id
                && v.variable == variable.variable
        }) {
            Some(existing) => *existing = variable.clone(),
            None => inner.unit_variables.push(variable.clone()),
        }
        Ok(())
    }
}
