// gRPC protocol for the transfer service.
//
// The proto is the transport layer; the engine's record types remain the
// source of truth. This crate carries the conversions between the two.

use chrono::{DateTime, TimeZone, Utc};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("arcflow.api.transferservice.v1beta1");
}

// Re-export for convenience
pub use proto::transfer_service_client::TransferServiceClient;
pub use proto::transfer_service_server::{TransferService, TransferServiceServer};

use arcflow_core::{
    CompressionAlgorithm, JobRecord, JobStatus, PackageStatus, ProcessingConfig, TaskRecord,
};

pub fn datetime_to_timestamp(datetime: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: datetime.timestamp(),
        nanos: datetime.timestamp_subsec_nanos() as i32,
    }
}

pub fn timestamp_to_datetime(timestamp: &prost_types::Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
        .unwrap_or_default()
}

/// Wire job status for an engine job status. `AwaitingDecision` and
/// `Executing` both surface as processing; the wire has no finer state.
pub fn job_status_to_proto(status: JobStatus) -> proto::job::Status {
    match status {
        JobStatus::Unknown => proto::job::Status::Unspecified,
        JobStatus::CompletedOk => proto::job::Status::Complete,
        JobStatus::Executing | JobStatus::AwaitingDecision => proto::job::Status::Processing,
        JobStatus::Failed => proto::job::Status::Failed,
    }
}

pub fn package_status_to_proto(status: PackageStatus) -> proto::PackageStatus {
    match status {
        PackageStatus::Unspecified => proto::PackageStatus::Unspecified,
        PackageStatus::Failed => proto::PackageStatus::Failed,
        PackageStatus::Rejected => proto::PackageStatus::Rejected,
        PackageStatus::Complete => proto::PackageStatus::Complete,
        PackageStatus::Processing => proto::PackageStatus::Processing,
    }
}

pub fn job_to_proto(job: &JobRecord) -> proto::Job {
    proto::Job {
        id: job.id.to_string(),
        name: job.name.clone(),
        group: job.group.clone(),
        link_id: job.link_id.to_string(),
        status: job_status_to_proto(job.status) as i32,
        start_time: Some(datetime_to_timestamp(job.created_at)),
    }
}

pub fn task_to_proto(task: &TaskRecord) -> proto::Task {
    proto::Task {
        id: task.id.to_string(),
        file_id: task
            .file_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        exit_code: task.exit_code.unwrap_or_default(),
        filename: task.filename.clone(),
        execution: task.execution.clone(),
        arguments: task.arguments.clone(),
        stdout: task.stdout.clone(),
        stderr: task.stderr.clone(),
        start_time: Some(datetime_to_timestamp(task.started_at)),
        end_time: task.ended_at.map(datetime_to_timestamp),
    }
}

impl From<proto::ProcessingConfig> for ProcessingConfig {
    fn from(config: proto::ProcessingConfig) -> Self {
        ProcessingConfig {
            assign_uuids_to_directories: config.assign_uuids_to_directories,
            examine_contents: config.examine_contents,
            generate_transfer_structure_report: config.generate_transfer_structure_report,
            document_empty_directories: config.document_empty_directories,
            extract_packages: config.extract_packages,
            delete_packages_after_extraction: config.delete_packages_after_extraction,
            identify_transfer: config.identify_transfer,
            identify_submission_and_metadata: config.identify_submission_and_metadata,
            identify_before_normalization: config.identify_before_normalization,
            normalize: config.normalize,
            transcribe_files: config.transcribe_files,
            perform_policy_checks_on_originals: config.perform_policy_checks_on_originals,
            perform_policy_checks_on_preservation_derivatives: config
                .perform_policy_checks_on_preservation_derivatives,
            aip_compression_level: config.aip_compression_level,
            aip_compression_algorithm: CompressionAlgorithm::from_i32(
                config.aip_compression_algorithm,
            ),
        }
    }
}

impl From<&ProcessingConfig> for proto::ProcessingConfig {
    fn from(config: &ProcessingConfig) -> Self {
        proto::ProcessingConfig {
            assign_uuids_to_directories: config.assign_uuids_to_directories,
            examine_contents: config.examine_contents,
            generate_transfer_structure_report: config.generate_transfer_structure_report,
            document_empty_directories: config.document_empty_directories,
            extract_packages: config.extract_packages,
            delete_packages_after_extraction: config.delete_packages_after_extraction,
            identify_transfer: config.identify_transfer,
            identify_submission_and_metadata: config.identify_submission_and_metadata,
            identify_before_normalization: config.identify_before_normalization,
            normalize: config.normalize,
            transcribe_files: config.transcribe_files,
            perform_policy_checks_on_originals: config.perform_policy_checks_on_originals,
            perform_policy_checks_on_preservation_derivatives: config
                .perform_policy_checks_on_preservation_derivatives,
            aip_compression_level: config.aip_compression_level,
            aip_compression_algorithm: config.aip_compression_algorithm.as_i32(),
        }
    }
}
