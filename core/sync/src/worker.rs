//! Worker pool draining the shared job queue.
//!
//! Every worker polls the queue on a short interval and runs at most one
//! job at a time. A job ends in one of three ways:
//! - done: the dataset lock is released
//! - failed: retried with back-off while attempts remain, then dropped
//! - interrupted: re-queued as is, without counting an attempt

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rdmsync_common::{Error, Result};
use rdmsync_store::keys;

use crate::persist::PersistPipeline;
use crate::queue::{Job, JobQueue};
use crate::retry::RetryConfig;
use crate::services::Services;

/// Fixed-size pool of queue workers.
#[derive(Clone)]
pub struct WorkerPool {
    services: Services,
    queue: JobQueue,
    pipeline: PersistPipeline,
    backoff: RetryConfig,
}

impl WorkerPool {
    pub fn new(services: Services) -> Self {
        let config = &services.config;
        let backoff = RetryConfig::exponential(Duration::from_secs(1), config.retry_backoff_cap);
        Self {
            queue: JobQueue::new(services.store.clone(), config.clone()),
            pipeline: PersistPipeline::new(services.clone()),
            backoff,
            services,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Start the configured number of workers.
    ///
    /// Cancelling `shutdown` stops every worker and interrupts running jobs.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.services.config.workers.max(1);
        info!("Starting {} workers", workers);
        (0..workers)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    /// Worker loop. Returns once `shutdown` fires.
    pub async fn run_worker(&self, worker: usize, shutdown: CancellationToken) {
        let mut ticker = interval(self.services.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Worker {} started", worker);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Worker {} shutting down", worker);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_next(&shutdown).await {
                        error!("Worker {}: {}", worker, e);
                    }
                }
            }
        }
    }

    /// Take one job off the queue and see it through.
    ///
    /// Returns `false` if the queue was empty.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<bool> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        self.handle(job, shutdown).await;
        Ok(true)
    }

    async fn handle(&self, mut job: Job, shutdown: &CancellationToken) {
        let deadline = self.services.config.job_deadline;
        job.deadline = chrono::Duration::from_std(deadline)
            .ok()
            .map(|d| Utc::now() + d);
        info!(
            "Processing job {} for {} ({} nodes, attempt {})",
            job.id,
            job.dataset,
            job.writable_nodes.len(),
            job.retries + 1
        );

        let token = shutdown.child_token();
        let result = {
            let run = self.pipeline.run(&mut job, &token);
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => result,
                _ = sleep(deadline) => {
                    warn!("Job deadline of {:?} reached, interrupting", deadline);
                    token.cancel();
                    run.await
                }
            }
        };

        match result {
            Ok(()) if job.writable_nodes.is_empty() => self.finish(&job).await,
            Ok(()) => {
                warn!(
                    "Job {} left {} nodes behind, re-queueing",
                    job.id,
                    job.writable_nodes.len()
                );
                self.requeue(job).await;
            }
            Err(e) if e.is_cancelled() => {
                info!(
                    "Job {} interrupted with {} nodes left",
                    job.id,
                    job.writable_nodes.len()
                );
                self.requeue(job).await;
            }
            Err(e) if !e.is_retryable() => self.give_up(&job, &e).await,
            Err(e) => {
                job.retries += 1;
                if job.retries > self.services.config.max_retries {
                    self.give_up(&job, &e).await;
                    return;
                }
                let delay = self.backoff.delay(job.retries);
                warn!(
                    "Job {} failed (attempt {}): {}. Retrying in {:?}",
                    job.id, job.retries, e, delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(delay) => {}
                }
                self.requeue(job).await;
            }
        }
    }

    async fn requeue(&self, job: Job) {
        if job.writable_nodes.is_empty() {
            self.finish(&job).await;
            return;
        }
        if let Err(e) = self.queue.enqueue(&job, false).await {
            error!("Could not re-queue job {}: {}", job.id, e);
            self.give_up(&job, &e).await;
        }
    }

    async fn finish(&self, job: &Job) {
        self.release(job).await;
        info!("Job {} for {} done", job.id, job.dataset);
        if job.send_email_on_success {
            self.notify(job, "Files were synchronized").await;
        }
    }

    /// Drop a job for good and leave a message for the UI.
    async fn give_up(&self, job: &Job, err: &Error) {
        error!(
            "Dropping job {} for {} after {} failed attempts: {}",
            job.id,
            job.dataset,
            job.retries.max(1),
            err
        );
        let marker = keys::job_error(job.dataset.as_str());
        if let Err(e) = self
            .services
            .store
            .set(&marker, &err.to_string(), Some(self.services.config.progress_ttl))
            .await
        {
            warn!("Could not record failure of {}: {}", job.dataset, e);
        }
        self.release(job).await;
        self.notify(job, "Updating files in the dataset has failed").await;
    }

    async fn release(&self, job: &Job) {
        if let Err(e) = self.queue.unlock(&job.dataset).await {
            error!("Could not release lock on {}: {}", job.dataset, e);
        }
    }

    async fn notify(&self, job: &Job, subject: &str) {
        match self.services.destination.user_email(&job.credentials).await {
            Ok(email) => info!("Notifying {}: {} ({})", email, subject, job.dataset),
            Err(e) => debug!("No address to notify about {}: {}", job.dataset, e),
        }
    }
}
