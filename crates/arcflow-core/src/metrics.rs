// Prometheus metric families updated by the engine.
//
// The registry is owned here and exposed through `Engine::metrics` so the
// embedding binary can scrape or log it.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub struct EngineMetrics {
    registry: Registry,

    pub active_packages: IntGauge,
    pub active_jobs: IntGauge,
    pub job_queue_length: IntGauge,
    pub package_queue_length: IntGaugeVec,
    pub jobs_completed: IntCounterVec,
    pub tasks_executed: IntCounter,
    pub task_timeouts: IntCounter,
    pub task_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_packages = IntGauge::new(
            "arcflow_active_packages",
            "Packages currently active against the concurrency cap",
        )
        .expect("metric can be created");
        let active_jobs = IntGauge::new(
            "arcflow_active_jobs",
            "Jobs currently executing on the worker pool",
        )
        .expect("metric can be created");
        let job_queue_length = IntGauge::new(
            "arcflow_job_queue_length",
            "Jobs waiting on the active job queue",
        )
        .expect("metric can be created");
        let package_queue_length = IntGaugeVec::new(
            Opts::new(
                "arcflow_package_queue_length",
                "Packages waiting for a concurrency slot",
            ),
            &["package_type"],
        )
        .expect("metric can be created");
        let jobs_completed = IntCounterVec::new(
            Opts::new("arcflow_jobs_completed_total", "Jobs completed, by status"),
            &["status"],
        )
        .expect("metric can be created");
        let tasks_executed = IntCounter::new(
            "arcflow_tasks_executed_total",
            "Tasks dispatched to the task backend",
        )
        .expect("metric can be created");
        let task_timeouts = IntCounter::new(
            "arcflow_task_timeouts_total",
            "Tasks cancelled for exceeding the wall-clock budget",
        )
        .expect("metric can be created");
        let task_duration = Histogram::with_opts(HistogramOpts::new(
            "arcflow_task_duration_seconds",
            "Wall-clock duration of task execution",
        ))
        .expect("metric can be created");

        for collector in [
            Box::new(active_packages.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_jobs.clone()),
            Box::new(job_queue_length.clone()),
            Box::new(package_queue_length.clone()),
            Box::new(jobs_completed.clone()),
            Box::new(tasks_executed.clone()),
            Box::new(task_timeouts.clone()),
            Box::new(task_duration.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric can be registered");
        }

        Self {
            registry,
            active_packages,
            active_jobs,
            job_queue_length,
            package_queue_length,
            jobs_completed,
            tasks_executed,
            task_timeouts,
            task_duration,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
