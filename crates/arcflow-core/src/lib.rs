// Arcflow core: the workflow execution engine.
//
// A submission creates a Package, admitted through the PackageQueue under a
// concurrency cap. A JobChain walks the workflow graph link by link; each
// link runs as a Job on the worker pool, generating Tasks executed by the
// TaskBackend. Terminal links record the package's final status and free a
// concurrency slot.

pub mod backend;
pub mod chain;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod job;
pub mod metrics;
pub mod package;
pub mod queue;
pub mod store;
pub mod task;
pub mod workflow;

pub use backend::{LocalTaskBackend, ProcessExecutor, TaskExecutor};
pub use chain::JobChain;
pub use config::{CompressionAlgorithm, EngineConfig, ProcessingConfig, SharedDirectories};
pub use context::ReplacementContext;
pub use engine::{Engine, EngineContext, PackageStatusReport};
pub use error::{BackendError, EngineError, QueueError, Result, StoreError, WorkflowError};
pub use job::{Job, JobCompletion, JobStatus};
pub use metrics::EngineMetrics;
pub use package::{Package, PackageStatus, PackageType, Stage};
pub use queue::PackageQueue;
pub use store::{
    FileRecord, JobRecord, MemoryStore, PackageRecord, StateStore, TaskRecord, UnitVariableRecord,
};
pub use task::{Task, TaskOutcome, TaskResult, TIMEOUT_EXIT_CODE};
pub use workflow::{Chain, Link, LinkManager, Workflow};
