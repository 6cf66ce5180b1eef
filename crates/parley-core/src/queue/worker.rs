//! Worker pool pulling tasks from the durable queue

use super::{Task, TaskQueue};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parley_common::{Error, Result};
use parley_storage::models::Job;
use parley_storage::repository::JobRepository;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do with a task after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Run the same task again once the delay has passed
    RunAgainAfter(std::time::Duration),
}

/// Executes tasks claimed by the worker pool
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<TaskOutcome>;
}

/// Pool of independent workers per queue
pub struct WorkerPool {
    jobs: Arc<dyn JobRepository>,
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    poll_interval: std::time::Duration,
}

impl WorkerPool {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: TaskQueue,
        handler: Arc<dyn TaskHandler>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            handler,
            poll_interval,
        }
    }

    /// Spawn `concurrency` workers on `queue_name`, stopping when `shutdown` flips to true
    pub fn spawn(
        self: &Arc<Self>,
        queue_name: &'static str,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|worker| {
                let pool = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(queue_name, worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        queue_name: &'static str,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(queue = queue_name, worker, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(queue_name).await {
                // Drain the queue before idling
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(queue = queue_name, worker, error = %e, "Error claiming job"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(queue = queue_name, worker, "Worker stopped");
    }

    /// Claim and process one due job. Returns `false` when none was due.
    pub async fn run_once(&self, queue_name: &str) -> Result<bool> {
        let Some(job) = self.jobs.claim_next(queue_name, Utc::now()).await? else {
            return Ok(false);
        };
        self.process(job).await;
        Ok(true)
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        debug!(job_id = %job_id, queue = %job.queue, attempt = job.attempts, "Processing job");

        let task: Task = match serde_json::from_value(job.payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to parse job payload");
                if let Err(e) = self.jobs.fail(job_id, &e.to_string()).await {
                    error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
                }
                return;
            }
        };

        let result = match self.handler.handle(&task).await {
            Ok(TaskOutcome::Done) => self.jobs.complete(job_id).await,
            Ok(TaskOutcome::RunAgainAfter(delay)) => {
                match self.queue.enqueue_after(&task, delay).await {
                    Ok(_) => self.jobs.complete(job_id).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                // Errors without a Parley classification are treated as retryable
                let retryable = Error::find_in(&e).map_or(true, Error::is_retryable);
                if !retryable {
                    error!(job_id = %job_id, ?task, error = %e, "Job failed with a permanent error");
                    self.jobs.fail(job_id, &e.to_string()).await
                } else if job.attempts >= job.max_attempts {
                    error!(job_id = %job_id, ?task, error = %e, "Job exceeded max attempts");
                    self.jobs.fail(job_id, &e.to_string()).await
                } else {
                    let run_at = Utc::now() + calculate_backoff(job.attempts);
                    warn!(
                        job_id = %job_id,
                        ?task,
                        error = %e,
                        retry_at = %run_at,
                        "Job failed, scheduling retry"
                    );
                    self.jobs.retry(job_id, &e.to_string(), run_at).await
                }
            }
        };

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }
}

/// Exponential backoff: 10s doubling per attempt, capped at 10 minutes
pub fn calculate_backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = 10_i64.saturating_mul(2_i64.pow(exponent)).min(600);
    Duration::seconds(secs)
}
