//! Durable task queue
//!
//! Tasks are stored as jobs so that a batch activation or a webhook
//! reconciliation survives a worker crash. Workers pull from one named
//! queue per task kind.

mod worker;

pub use worker::{calculate_backoff, TaskHandler, TaskOutcome, WorkerPool};

use crate::campaign::{BatchOutcome, DispatchScheduler};
use crate::webhook::StatusReconciler;
use async_trait::async_trait;
use chrono::Utc;
use parley_common::types::{CampaignId, JobId, TenantId, TenantScope, WebhookLogId};
use parley_common::{Error, Result};
use parley_storage::repository::JobRepository;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DISPATCH_QUEUE: &str = "dispatch";
pub const RECONCILE_QUEUE: &str = "reconcile";

/// Unit of background work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// One scheduler activation for a campaign
    DispatchBatch {
        tenant_id: TenantId,
        campaign_id: CampaignId,
    },
    /// Reconcile one stored webhook log entry
    ReconcileWebhook {
        tenant_id: TenantId,
        log_id: WebhookLogId,
    },
}

impl Task {
    pub fn queue(&self) -> &'static str {
        match self {
            Task::DispatchBatch { .. } => DISPATCH_QUEUE,
            Task::ReconcileWebhook { .. } => RECONCILE_QUEUE,
        }
    }

    pub fn scope(&self) -> TenantScope {
        match self {
            Task::DispatchBatch { tenant_id, .. } | Task::ReconcileWebhook { tenant_id, .. } => {
                TenantScope::new(*tenant_id)
            }
        }
    }
}

/// Enqueues tasks onto the jobs table
#[derive(Clone)]
pub struct TaskQueue {
    jobs: Arc<dyn JobRepository>,
    max_attempts: i32,
}

impl TaskQueue {
    pub fn new(jobs: Arc<dyn JobRepository>, max_attempts: i32) -> Self {
        Self { jobs, max_attempts }
    }

    pub async fn enqueue(&self, task: &Task) -> Result<JobId> {
        self.enqueue_after(task, Duration::ZERO).await
    }

    /// Enqueue a task that becomes runnable after `delay`
    pub async fn enqueue_after(&self, task: &Task, delay: Duration) -> Result<JobId> {
        let payload =
            serde_json::to_value(task).map_err(|e| Error::Internal(e.to_string()))?;
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::Internal(format!("delay out of range: {}", e)))?;

        let id = self
            .jobs
            .enqueue(task.queue(), payload, Utc::now() + delay, self.max_attempts)
            .await?;
        debug!(job_id = %id, queue = task.queue(), ?task, "Enqueued task");
        Ok(id)
    }

    /// Enqueue unless the same task is already pending or running.
    ///
    /// Returns `None` when an equivalent job is live.
    pub async fn enqueue_unique(&self, task: &Task) -> Result<Option<JobId>> {
        let payload =
            serde_json::to_value(task).map_err(|e| Error::Internal(e.to_string()))?;

        let id = self
            .jobs
            .enqueue_if_absent(task.queue(), payload, Utc::now(), self.max_attempts)
            .await?;
        if let Some(id) = id {
            debug!(job_id = %id, queue = task.queue(), ?task, "Enqueued task");
        }
        Ok(id)
    }
}

/// Routes each task to the component that handles it
pub struct TaskRouter {
    scheduler: Arc<DispatchScheduler>,
    reconciler: Arc<StatusReconciler>,
}

impl TaskRouter {
    pub fn new(scheduler: Arc<DispatchScheduler>, reconciler: Arc<StatusReconciler>) -> Self {
        Self {
            scheduler,
            reconciler,
        }
    }
}

#[async_trait]
impl TaskHandler for TaskRouter {
    async fn handle(&self, task: &Task) -> anyhow::Result<TaskOutcome> {
        let scope = task.scope();
        match *task {
            Task::DispatchBatch { campaign_id, .. } => {
                match self.scheduler.run_batch(scope, campaign_id).await? {
                    BatchOutcome::Rearm(delay) => Ok(TaskOutcome::RunAgainAfter(delay)),
                    BatchOutcome::Completed | BatchOutcome::Halted => Ok(TaskOutcome::Done),
                }
            }
            Task::ReconcileWebhook { log_id, .. } => {
                self.reconciler.reconcile(scope, log_id).await?;
                Ok(TaskOutcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_task_serialization() {
        let tenant_id = Uuid::new_v4();
        let campaign_id = Uuid::new_v4();
        let task = Task::DispatchBatch {
            tenant_id,
            campaign_id,
        };

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "dispatch_batch");
        assert_eq!(task.queue(), DISPATCH_QUEUE);
        assert_eq!(task.scope(), TenantScope::new(tenant_id));
        assert_eq!(serde_json::from_value::<Task>(json).unwrap(), task);
    }

    #[tokio::test]
    async fn test_enqueue_after_delays_run_at() {
        let store = MemoryStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()), 3);
        let task = Task::ReconcileWebhook {
            tenant_id: Uuid::new_v4(),
            log_id: Uuid::new_v4(),
        };

        queue
            .enqueue_after(&task, Duration::from_secs(60))
            .await
            .unwrap();

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, RECONCILE_QUEUE);
        assert_eq!(jobs[0].max_attempts, 3);
        assert!(jobs[0].run_at > Utc::now() + chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_enqueue_unique_skips_live_task() {
        let store = MemoryStore::new();
        let queue = TaskQueue::new(Arc::new(store.clone()), 3);
        let task = Task::DispatchBatch {
            tenant_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
        };

        assert!(queue.enqueue_unique(&task).await.unwrap().is_some());
        assert_eq!(queue.enqueue_unique(&task).await.unwrap(), None);

        let other = Task::DispatchBatch {
            tenant_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
        };
        assert!(queue.enqueue_unique(&other).await.unwrap().is_some());
        assert_eq!(store.jobs().len(), 2);
    }
}
