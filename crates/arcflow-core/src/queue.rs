// Package queue: bounded-concurrency admission and active job dispatch.
//
// At most `max_concurrent_packages` packages are active at once. Jobs for
// active packages go straight onto the bounded active job queue; jobs for
// new packages wait on one of three class queues (DIP first, then SIP, then
// Transfer) until a slot frees. The scheduler loop in `work` is the sole
// consumer of the job channel and of worker completions.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::EngineContext;
use crate::error::QueueError;
use crate::job::{Job, JobCompletion};
use crate::metrics::EngineMetrics;
use crate::package::PackageType;

pub struct PackageQueue {
    max_concurrent_packages: usize,
    max_queued_packages: usize,
    shutdown_timeout: std::time::Duration,
    /// Extra per-job diagnostic logging, off by default
    debug: bool,

    /// Packages currently counted against the concurrency cap
    active: Mutex<HashSet<Uuid>>,

    job_tx: mpsc::Sender<Job>,
    job_rx: Mutex<Option<mpsc::Receiver<Job>>>,

    dip_queue: Mutex<VecDeque<Job>>,
    sip_queue: Mutex<VecDeque<Job>>,
    transfer_queue: Mutex<VecDeque<Job>>,

    workers: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
}

impl PackageQueue {
    pub fn new(config: &EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.max_concurrent_packages);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if config.debug {
            debug!(
                max_concurrent_packages = config.max_concurrent_packages,
                "package queue initialized"
            );
        }

        Self {
            max_concurrent_packages: config.max_concurrent_packages,
            max_queued_packages: config.max_queued_packages,
            shutdown_timeout: config.shutdown_timeout,
            debug: config.debug,
            active: Mutex::new(HashSet::new()),
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
            dip_queue: Mutex::new(VecDeque::new()),
            sip_queue: Mutex::new(VecDeque::new()),
            transfer_queue: Mutex::new(VecDeque::new()),
            workers: Arc::new(Semaphore::new(config.worker_threads)),
            shutdown_tx,
            shutdown_rx,
            metrics,
        }
    }

    /// Shutdown signal observed by the task backend.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_package_active(&self, package_uuid: Uuid) -> bool {
        self.active
            .lock()
            .expect("active package lock poisoned")
            .contains(&package_uuid)
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .expect("active package lock poisoned")
            .len()
    }

    /// Add a job to the queue.
    ///
    /// A job for an already-active package goes straight onto the active job
    /// queue, blocking when it is full (intentional backpressure within a
    /// package). Otherwise the job waits on its package-class queue and a
    /// waiting package is promoted if a slot is free.
    pub async fn schedule_job(&self, job: Job) -> Result<(), QueueError> {
        if *self.shutdown_rx.borrow() {
            return Err(QueueError::Shutdown);
        }

        let package_uuid = job.package_uuid();
        let already_active = self
            .active
            .lock()
            .expect("active package lock poisoned")
            .contains(&package_uuid);

        if already_active {
            self.job_tx
                .send(job)
                .await
                .map_err(|_| QueueError::Shutdown)?;
            self.metrics.job_queue_length.inc();
            return Ok(());
        }

        let job_id = job.id;
        let kind = job.package_kind();
        self.put_waiting(job)?;
        if self.debug {
            debug!(
                job_id = %job_id,
                package_id = %package_uuid,
                package_type = kind.as_str(),
                queue_size = self.waiting_count(),
                "job queued for an inactive package"
            );
        }
        self.promote_next();
        Ok(())
    }

    fn waiting_count(&self) -> usize {
        [&self.dip_queue, &self.sip_queue, &self.transfer_queue]
            .iter()
            .map(|queue| queue.lock().expect("waiting queue lock poisoned").len())
            .sum()
    }

    /// Trigger queue shutdown.
    pub fn stop(&self) {
        info!("package queue stopping");
        let _ = self.shutdown_tx.send(true);
    }

    /// The processing loop: pull jobs from the active queue, run them on the
    /// worker pool, and fold completions back into scheduling. Returns when
    /// `stop` has been observed and in-flight jobs have drained (or the
    /// shutdown deadline has passed).
    pub async fn work(&self, ctx: Arc<EngineContext>) {
        let mut job_rx = self
            .job_rx
            .lock()
            .expect("job queue lock poisoned")
            .take()
            .expect("work() may only be called once");

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobCompletion>();
        let mut inflight = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();

        info!(
            max_concurrent_packages = self.max_concurrent_packages,
            "package queue processing started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(done) = done_rx.recv() => {
                    self.handle_completion(done, &ctx, false).await;
                }
                maybe_job = job_rx.recv() => {
                    match maybe_job {
                        Some(job) => self.dispatch(job, &ctx, &done_tx, &mut inflight),
                        None => break,
                    }
                }
            }
        }

        self.drain(&ctx, inflight, done_rx).await;
    }

    fn dispatch(
        &self,
        job: Job,
        ctx: &Arc<EngineContext>,
        done_tx: &mpsc::UnboundedSender<JobCompletion>,
        inflight: &mut JoinSet<()>,
    ) {
        self.metrics.job_queue_length.dec();
        self.metrics.active_jobs.inc();

        let ctx = ctx.clone();
        let done_tx = done_tx.clone();
        let workers = self.workers.clone();
        inflight.spawn(async move {
            let _permit = workers.acquire_owned().await.ok();
            let completion = job.run(ctx).await;
            let _ = done_tx.send(completion);
        });
    }

    /// Fold one worker completion back into the queue. During drain no new
    /// jobs are scheduled and no waiting package is promoted.
    async fn handle_completion(&self, done: JobCompletion, ctx: &Arc<EngineContext>, draining: bool) {
        self.metrics.active_jobs.dec();
        self.metrics
            .jobs_completed
            .with_label_values(&[done.status.as_str()])
            .inc();

        if let Some(status) = done.final_status {
            if let Err(err) = ctx
                .store
                .update_package_status(done.package_uuid, status)
                .await
            {
                error!(
                    package_id = %done.package_uuid,
                    error = %err,
                    "failed to persist final package status"
                );
            }
        }

        match done.next {
            Some(next) if !draining => {
                if done.terminal {
                    warn!(
                        package_id = %done.package_uuid,
                        "job on a terminal link produced a next job; check the workflow's end flags"
                    );
                }
                // The completed job freed this package's slot on the channel,
                // and only one job per package is ever in flight, so a
                // reservation is available.
                match self.job_tx.try_reserve() {
                    Ok(permit) => {
                        self.metrics.job_queue_length.inc();
                        permit.send(next);
                    }
                    Err(_) => {
                        error!(
                            package_id = %done.package_uuid,
                            "active job queue unexpectedly full; deferring next job"
                        );
                        let job_tx = self.job_tx.clone();
                        self.metrics.job_queue_length.inc();
                        tokio::spawn(async move {
                            let _ = job_tx.send(next).await;
                        });
                    }
                }
            }
            Some(_) => {
                debug!(
                    package_id = %done.package_uuid,
                    "discarding next job during shutdown"
                );
            }
            None => {
                self.deactivate(done.package_uuid);
                if !draining {
                    self.promote_next();
                }
            }
        }
    }

    async fn drain(
        &self,
        ctx: &Arc<EngineContext>,
        mut inflight: JoinSet<()>,
        mut done_rx: mpsc::UnboundedReceiver<JobCompletion>,
    ) {
        info!(inflight = inflight.len(), "package queue draining");

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        while !inflight.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        abandoned = inflight.len(),
                        "shutdown deadline reached; abandoning in-flight jobs"
                    );
                    inflight.shutdown().await;
                    break;
                }
                Some(done) = done_rx.recv() => {
                    self.handle_completion(done, ctx, true).await;
                }
                _ = inflight.join_next() => {}
            }
        }

        // Completions that raced the join still carry final statuses.
        while let Ok(done) = done_rx.try_recv() {
            self.handle_completion(done, ctx, true).await;
        }

        info!("package queue stopped");
    }

    fn put_waiting(&self, job: Job) -> Result<(), QueueError> {
        let kind = job.package_kind();
        let queue = self.waiting_queue(kind);
        let mut queue = queue.lock().expect("waiting queue lock poisoned");
        if queue.len() >= self.max_queued_packages {
            return Err(QueueError::Full);
        }
        queue.push_back(job);
        self.metrics
            .package_queue_length
            .with_label_values(&[kind.as_str()])
            .inc();
        Ok(())
    }

    fn take_waiting(&self) -> Option<Job> {
        // Strict priority: DIP, then SIP, then Transfer. Transfer starvation
        // is tolerated; transfer work always eventually produces SIP/DIP
        // work, which drains.
        for queue in [&self.dip_queue, &self.sip_queue, &self.transfer_queue] {
            let job = queue
                .lock()
                .expect("waiting queue lock poisoned")
                .pop_front();
            if let Some(job) = job {
                self.metrics
                    .package_queue_length
                    .with_label_values(&[job.package_kind().as_str()])
                    .dec();
                return Some(job);
            }
        }
        None
    }

    fn waiting_queue(&self, kind: PackageType) -> &Mutex<VecDeque<Job>> {
        match kind {
            PackageType::Dip => &self.dip_queue,
            PackageType::Sip => &self.sip_queue,
            PackageType::Transfer => &self.transfer_queue,
        }
    }

    /// Promote one waiting package if there is capacity. The active lock is
    /// held across the pop and the activation so the cap cannot be exceeded
    /// by concurrent promoters.
    fn promote_next(&self) {
        let mut active = self.active.lock().expect("active package lock poisoned");
        if active.len() >= self.max_concurrent_packages {
            if self.debug {
                debug!(
                    active = active.len(),
                    "not promoting; concurrency cap reached"
                );
            }
            return;
        }

        let Some(job) = self.take_waiting() else {
            return;
        };

        match self.job_tx.try_reserve() {
            Ok(permit) => {
                let package_uuid = job.package_uuid();
                if active.insert(package_uuid) {
                    self.metrics.active_packages.inc();
                    if self.debug {
                        debug!(package_id = %package_uuid, "package activated");
                    }
                } else {
                    warn!(package_id = %package_uuid, "package was already active");
                }
                self.metrics.job_queue_length.inc();
                permit.send(job);
            }
            Err(_) => {
                // No channel slot; put the job back at the head of its queue.
                let kind = job.package_kind();
                self.waiting_queue(kind)
                    .lock()
                    .expect("waiting queue lock poisoned")
                    .push_front(job);
                self.metrics
                    .package_queue_length
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
        }
    }

    fn deactivate(&self, package_uuid: Uuid) {
        let removed = self
            .active
            .lock()
            .expect("active package lock poisoned")
            .remove(&package_uuid);
        if removed {
            self.metrics.active_packages.dec();
            if self.debug {
                debug!(package_id = %package_uuid, "package deactivated");
            }
        } else {
            warn!(
                package_id = %package_uuid,
                "package was deactivated but was not marked active"
            );
        }
    }
}
