// gRPC transfer service: a thin layer mapping the wire protocol onto the
// engine facade.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use arcflow_core::{Engine, EngineError, ProcessingConfig, QueueError, StoreError};
use arcflow_protocol::proto::{
    ListTasksRequest, ListTasksResponse, ReadRequest, ReadResponse, SubmitRequest, SubmitResponse,
};
use arcflow_protocol::{job_to_proto, package_status_to_proto, task_to_proto, TransferService};

pub struct TransferServiceImpl {
    engine: Arc<Engine>,
}

impl TransferServiceImpl {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl TransferService for TransferServiceImpl {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let message = request.into_inner();
        let config = message.config.map(ProcessingConfig::from);
        let id = self
            .engine
            .submit(&message.name, &message.url, config)
            .await
            .map_err(to_status)?;
        Ok(Response::new(SubmitResponse { id: id.to_string() }))
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let message = request.into_inner();
        let id: Uuid = message
            .id
            .parse()
            .map_err(|_| Status::invalid_argument("id is not a valid uuid"))?;
        let report = self.engine.status(id).await.map_err(to_status)?;
        Ok(Response::new(ReadResponse {
            status: package_status_to_proto(report.status) as i32,
            job: report.job.unwrap_or_default(),
            jobs: report.jobs.iter().map(job_to_proto).collect(),
        }))
    }

    async fn list_tasks(
        &self,
        request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let message = request.into_inner();
        let job_id: Uuid = message
            .job_id
            .parse()
            .map_err(|_| Status::invalid_argument("job_id is not a valid uuid"))?;
        let tasks = self.engine.list_tasks(job_id).await.map_err(to_status)?;
        Ok(Response::new(ListTasksResponse {
            tasks: tasks.iter().map(task_to_proto).collect(),
        }))
    }
}

fn to_status(err: EngineError) -> Status {
    match err {
        EngineError::Queue(QueueError::Full) => Status::resource_exhausted(err.to_string()),
        EngineError::Queue(QueueError::Shutdown) => Status::unavailable(err.to_string()),
        EngineError::Store(StoreError::PackageNotFound(_)) => Status::not_found(err.to_string()),
        EngineError::InvalidArgument(message) => Status::invalid_argument(message),
        other => Status::internal(other.to_string()),
    }
}
