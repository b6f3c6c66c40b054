// SQLite-backed state store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;
use uuid::Uuid;

use arcflow_core::{
    FileRecord, JobRecord, JobStatus, PackageRecord, PackageStatus, StateStore, StoreError,
    TaskRecord, UnitVariableRecord,
};

use crate::models::{FileRow, JobRow, PackageRow, TaskRow, UnitVariableRow};

fn store_err(err: sqlx::Error) -> StoreError {
    StoreError::backend(err)
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite:///var/lib/arcflow/share/arcflow.db`.
    pub async fn from_url(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// An in-memory database, for tests and ephemeral runs. A single
    /// connection is used so every caller sees the same data.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Apply embedded schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a catalog file for a unit.
    pub async fn add_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO files (id, transfer_id, sip_id, original_location, current_location, file_group_use)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(file.id.to_string())
        .bind(file.transfer_id.map(|id| id.to_string()))
        .bind(file.sip_id.map(|id| id.to_string()))
        .bind(&file.original_location)
        .bind(&file.current_location)
        .bind(&file.file_group_use)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for Database {
    async fn put_package(&self, package: &PackageRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO packages (sip_id, transfer_id, name, url, stage, current_path, aip_filename, status, config, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (sip_id) DO UPDATE SET
                stage = excluded.stage,
                current_path = excluded.current_path,
                aip_filename = excluded.aip_filename,
                status = excluded.status,
                config = excluded.config
            "#,
        )
        .bind(package.sip_id.to_string())
        .bind(package.transfer_id.to_string())
        .bind(&package.name)
        .bind(&package.url)
        .bind(package.stage.as_str())
        .bind(&package.current_path)
        .bind(&package.aip_filename)
        .bind(package.status.as_i32() as i64)
        .bind(serde_json::to_string(&package.config).map_err(StoreError::backend)?)
        .bind(package.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_package(&self, id: Uuid) -> Result<Option<PackageRecord>, StoreError> {
        let row = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT sip_id, transfer_id, name, url, stage, current_path, aip_filename, status, config, created_at
            FROM packages
            WHERE sip_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(PackageRow::into_record).transpose()
    }

    async fn update_package_status(
        &self,
        id: Uuid,
        status: PackageStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE packages SET status = $2 WHERE sip_id = $1")
            .bind(id.to_string())
            .bind(status.as_i32() as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PackageNotFound(id));
        }
        Ok(())
    }

    async fn list_processing_packages(&self) -> Result<Vec<PackageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT sip_id, transfer_id, name, url, stage, current_path, aip_filename, status, config, created_at
            FROM packages
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(PackageStatus::Processing.as_i32() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(PackageRow::into_record).collect()
    }

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, unit_id, link_id, name, microservice_group, status, exit_code, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                exit_code = excluded.exit_code
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.unit_id.to_string())
        .bind(job.link_id.to_string())
        .bind(&job.name)
        .bind(&job.group)
        .bind(job.status.as_str())
        .bind(job.exit_code.map(|c| c as i64))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = $2, exit_code = $3 WHERE id = $1")
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(exit_code.map(|c| c as i64))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_jobs(&self, unit_id: Uuid) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, unit_id, link_id, name, microservice_group, status, exit_code, created_at
            FROM jobs
            WHERE unit_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(unit_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    async fn latest_job(&self, unit_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, unit_id, link_id, name, microservice_group, status, exit_code, created_at
            FROM jobs
            WHERE unit_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(unit_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(JobRow::into_record).transpose()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, unit_id, link_id, name, microservice_group, status, exit_code, created_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(JobRow::into_record).transpose()
    }

    async fn put_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, job_id, file_id, filename, execution, arguments, stdout, stderr, exit_code, started_at, ended_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(task.id.to_string())
            .bind(task.job_id.to_string())
            .bind(task.file_id.map(|id| id.to_string()))
            .bind(&task.filename)
            .bind(&task.execution)
            .bind(&task.arguments)
            .bind(&task.stdout)
            .bind(&task.stderr)
            .bind(task.exit_code.map(|c| c as i64))
            .bind(task.started_at)
            .bind(task.ended_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_id, file_id, filename, execution, arguments, stdout, stderr, exit_code, started_at, ended_at
            FROM tasks
            WHERE job_id = $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn list_files(&self, unit_id: Uuid) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, transfer_id, sip_id, original_location, current_location, file_group_use
            FROM files
            WHERE transfer_id = $1 OR sip_id = $1
            "#,
        )
        .bind(unit_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(FileRow::into_record).collect()
    }

    async fn get_unit_variables(
        &self,
        unit_id: Uuid,
    ) -> Result<Vec<UnitVariableRecord>, StoreError> {
        let rows = sqlx::query_as::<_, UnitVariableRow>(
            r#"
            SELECT unit_type, unit_id, variable, value, chain_link_id
            FROM unit_variables
            WHERE unit_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(unit_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(UnitVariableRow::into_record).collect()
    }

    async fn get_unit_variable(
        &self,
        unit_id: Uuid,
        variable: &str,
    ) -> Result<Option<UnitVariableRecord>, StoreError> {
        let row = sqlx::query_as::<_, UnitVariableRow>(
            r#"
            SELECT unit_type, unit_id, variable, value, chain_link_id
            FROM unit_variables
            WHERE unit_id = $1 AND variable = $2
            "#,
        )
        .bind(unit_id.to_string())
        .bind(variable)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(UnitVariableRow::into_record).transpose()
    }

    async fn set_unit_variable(&self, variable: &UnitVariableRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO unit_variables (id, unit_type, unit_id, variable, value, chain_link_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (unit_type, unit_id, variable) DO UPDATE SET
                value = excluded.value,
                chain_link_id = excluded.chain_link_id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&variable.unit_type)
        .bind(variable.unit_id.to_string())
        .bind(&variable.variable)
        .bind(&variable.value)
        .bind(variable.chain_link_id.map(|id| id.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
