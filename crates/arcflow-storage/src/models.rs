// Database rows (internal; the engine sees the record types from
// arcflow-core). Uuids travel as hyphenated text, statuses as text or their
// wire integer.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use arcflow_core::{
    FileRecord, JobRecord, JobStatus, PackageRecord, PackageStatus, Stage, StoreError, TaskRecord,
    UnitVariableRecord,
};

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::backend(format!("malformed uuid in row: {raw}")))
}

fn parse_opt_uuid(raw: &Option<String>) -> Result<Option<Uuid>, StoreError> {
    raw.as_deref().map(parse_uuid).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    pub sip_id: String,
    pub transfer_id: String,
    pub name: String,
    pub url: String,
    pub stage: String,
    pub current_path: String,
    pub aip_filename: Option<String>,
    pub status: i64,
    pub config: String,
    pub created_at: DateTime<Utc>,
}

impl PackageRow {
    pub fn into_record(self) -> Result<PackageRecord, StoreError> {
        Ok(PackageRecord {
            sip_id: parse_uuid(&self.sip_id)?,
            transfer_id: parse_uuid(&self.transfer_id)?,
            name: self.name,
            url: self.url,
            stage: Stage::from_str_name(&self.stage)
                .ok_or_else(|| StoreError::backend(format!("unknown stage: {}", self.stage)))?,
            current_path: self.current_path,
            aip_filename: self.aip_filename,
            status: PackageStatus::from_i32(self.status as i32),
            config: serde_json::from_str(&self.config).map_err(StoreError::backend)?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub unit_id: String,
    pub link_id: String,
    pub name: String,
    pub microservice_group: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_record(self) -> Result<JobRecord, StoreError> {
        Ok(JobRecord {
            id: parse_uuid(&self.id)?,
            unit_id: parse_uuid(&self.unit_id)?,
            link_id: parse_uuid(&self.link_id)?,
            name: self.name,
            group: self.microservice_group,
            status: JobStatus::from_str_name(&self.status)
                .ok_or_else(|| StoreError::backend(format!("unknown job status: {}", self.status)))?,
            exit_code: self.exit_code.map(|c| c as i32),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub job_id: String,
    pub file_id: Option<String>,
    pub filename: String,
    pub execution: String,
    pub arguments: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    pub fn into_record(self) -> Result<TaskRecord, StoreError> {
        Ok(TaskRecord {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            file_id: parse_opt_uuid(&self.file_id)?,
            filename: self.filename,
            execution: self.execution,
            arguments: self.arguments,
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code.map(|c| c as i32),
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: String,
    pub transfer_id: Option<String>,
    pub sip_id: Option<String>,
    pub original_location: String,
    pub current_location: String,
    pub file_group_use: String,
}

impl FileRow {
    pub fn into_record(self) -> Result<FileRecord, StoreError> {
        Ok(FileRecord {
            id: parse_uuid(&self.id)?,
            transfer_id: parse_opt_uuid(&self.transfer_id)?,
            sip_id: parse_opt_uuid(&self.sip_id)?,
            original_location: self.original_location,
            current_location: self.current_location,
            file_group_use: self.file_group_use,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UnitVariableRow {
    pub unit_type: String,
    pub unit_id: String,
    pub variable: String,
    pub value: String,
    pub chain_link_id: Option<String>,
}

impl UnitVariableRow {
    pub fn into_record(self) -> Result<UnitVariableRecord, StoreError> {
        Ok(UnitVariableRecord {
            unit_type: self.unit_type,
            unit_id: parse_uuid(&self.unit_id)?,
            variable: self.variable,
            value: self.value,
            chain_link_id: parse_opt_uuid(&self.chain_link_id)?,
        })
    }
}
