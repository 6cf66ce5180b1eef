//! Periodic maintenance sweeps
//!
//! One loop per process. Every tick it recovers stale jobs and claims,
//! starts due scheduled campaigns, re-arms RUNNING campaigns that lost their
//! dispatch job, re-enqueues unprocessed webhooks, resets daily send
//! counters, and (less often) polls session health.

use crate::campaign::CampaignManager;
use crate::queue::{Task, TaskQueue};
use crate::sessions::SessionManager;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use parley_common::config::{DispatchConfig, WebhookConfig, WorkerConfig};
use parley_common::types::TenantScope;
use parley_storage::repository::{Repositories, UnprocessedFilter};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

const COMPLETED_JOB_RETENTION_DAYS: i64 = 7;

/// Work done by one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued_jobs: u64,
    pub purged_jobs: u64,
    pub started_campaigns: usize,
    pub requeued_campaigns: usize,
    pub rearmed_campaigns: usize,
    pub swept_webhooks: usize,
    pub reset_sessions: u64,
    pub health_checked: usize,
}

pub struct MaintenanceLoop {
    repos: Repositories,
    queue: TaskQueue,
    campaigns: Arc<CampaignManager>,
    sessions: Arc<SessionManager>,
    dispatch: DispatchConfig,
    webhook: WebhookConfig,
    workers: WorkerConfig,
    last_health_check: Option<DateTime<Utc>>,
}

impl MaintenanceLoop {
    pub fn new(
        repos: Repositories,
        queue: TaskQueue,
        campaigns: Arc<CampaignManager>,
        sessions: Arc<SessionManager>,
        dispatch: DispatchConfig,
        webhook: WebhookConfig,
        workers: WorkerConfig,
    ) -> Self {
        Self {
            repos,
            queue,
            campaigns,
            sessions,
            dispatch,
            webhook,
            workers,
            last_health_check: None,
        }
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.workers.maintenance_interval());
        info!(
            interval_secs = self.workers.maintenance_interval_secs,
            "Maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick(Utc::now()).await {
                Ok(report) if report != MaintenanceReport::default() => {
                    info!(?report, "Maintenance tick")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Maintenance tick failed"),
            }
        }

        info!("Maintenance loop stopped");
    }

    /// Run every sweep once as of `now`
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport {
            requeued_jobs: self
                .repos
                .jobs
                .requeue_stale(before(now, self.workers.job_lease())?)
                .await?,
            purged_jobs: self
                .repos
                .jobs
                .purge_completed(now - Duration::days(COMPLETED_JOB_RETENTION_DAYS))
                .await?,
            ..Default::default()
        };

        let check_health = self.last_health_check.map_or(true, |last| {
            before(now, self.workers.health_check_interval()).is_ok_and(|due| last <= due)
        });

        for tenant in self.repos.tenants.list_active().await? {
            let scope = TenantScope::new(tenant.id);
            if let Err(e) = self.tick_tenant(scope, now, check_health, &mut report).await {
                error!(tenant_id = %scope, error = %e, "Tenant maintenance failed");
            }
        }

        if check_health {
            self.last_health_check = Some(now);
        }
        Ok(report)
    }

    async fn tick_tenant(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
        check_health: bool,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        report.started_campaigns += self.campaigns.start_due_scheduled(scope, now).await?;

        // Orphaned claims go back to PENDING and their campaigns get a fresh activation
        let stale = self
            .repos
            .items
            .requeue_stale(scope, before(now, self.dispatch.stale_claim_after())?)
            .await?;
        for campaign_id in &stale {
            self.queue
                .enqueue_unique(&Task::DispatchBatch {
                    tenant_id: scope.tenant_id,
                    campaign_id: *campaign_id,
                })
                .await?;
        }
        report.requeued_campaigns += stale.len();

        // A RUNNING campaign with pending items and no live dispatch job has lost its chain
        for campaign_id in self.repos.campaigns.list_running_with_pending(scope).await? {
            let rearmed = self
                .queue
                .enqueue_unique(&Task::DispatchBatch {
                    tenant_id: scope.tenant_id,
                    campaign_id,
                })
                .await?;
            if rearmed.is_some() {
                info!(tenant_id = %scope, campaign_id = %campaign_id, "Re-armed stalled campaign");
                report.rearmed_campaigns += 1;
            }
        }

        let filter = UnprocessedFilter {
            created_before: before(now, self.webhook.sweep_after())?,
            lease_cutoff: before(now, self.webhook.processing_lease())?,
            max_attempts: self.webhook.max_attempts,
            limit: self.webhook.sweep_batch,
        };
        let mut swept = 0;
        for log_id in self.repos.webhook_logs.list_unprocessed(scope, &filter).await? {
            let enqueued = self
                .queue
                .enqueue_unique(&Task::ReconcileWebhook {
                    tenant_id: scope.tenant_id,
                    log_id,
                })
                .await?;
            if enqueued.is_some() {
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(tenant_id = %scope, count = swept, "Re-enqueued unprocessed webhooks");
        }
        report.swept_webhooks += swept;

        report.reset_sessions += self
            .repos
            .sessions
            .reset_daily_counters(scope, start_of_day(now))
            .await?;

        if check_health {
            report.health_checked += self.sessions.check_health(scope).await?.checked;
        }

        Ok(())
    }
}

fn before(now: DateTime<Utc>, age: std::time::Duration) -> Result<DateTime<Utc>> {
    let age = Duration::from_std(age).context("interval out of range")?;
    Ok(now - age)
}

/// Midnight UTC of the day containing `now`
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectionState;
    use crate::queue::{DISPATCH_QUEUE, RECONCILE_QUEUE};
    use crate::testing::Fixture;
    use parley_storage::models::{CampaignStatus, ItemStatus, TargetingRule, WebhookLog};
    use parley_storage::repository::{
        CampaignItemRepository, CampaignRepository, CreateWebhookLog, JobRepository,
        SessionRepository, WebhookLogRepository,
    };
    use pretty_assertions::assert_eq;

    fn maintenance(fx: &Fixture) -> MaintenanceLoop {
        let queue = TaskQueue::new(Arc::new(fx.store.clone()), 5);
        MaintenanceLoop::new(
            fx.repos.clone(),
            queue.clone(),
            Arc::new(CampaignManager::new(fx.repos.clone(), queue)),
            Arc::new(SessionManager::new(
                fx.repos.clone(),
                fx.gateway.clone(),
                "http://localhost",
            )),
            Fixture::dispatch_config(),
            WebhookConfig::default(),
            WorkerConfig::default(),
        )
    }

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 17, 45, 3).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stale_claims_are_requeued() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 2).await;
        CampaignItemRepository::claim_pending(&fx.store, fx.scope, campaign.id, 10)
            .await
            .unwrap();
        let mut maintenance = maintenance(&fx);

        // Fresh claims are left alone
        let report = maintenance.tick(Utc::now()).await.unwrap();
        assert_eq!(report.requeued_campaigns, 0);

        let report = maintenance.tick(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.requeued_campaigns, 1);

        let items = CampaignItemRepository::list(&fx.store, fx.scope, campaign.id)
            .await
            .unwrap();
        assert!(items
            .iter()
            .all(|i| i.status_enum() == Some(ItemStatus::Pending)));

        let jobs = fx.store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, DISPATCH_QUEUE);
    }

    async fn stored_webhook(fx: &Fixture) -> WebhookLog {
        WebhookLogRepository::create(
            &fx.store,
            fx.scope,
            CreateWebhookLog {
                session_id: fx.session.id,
                event_type: "messages.update".into(),
                payload: serde_json::json!({ "event": "messages.update", "data": {} }),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_running_campaign_without_job_is_rearmed() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 3).await;
        let mut maintenance = maintenance(&fx);

        let report = maintenance.tick(Utc::now()).await.unwrap();
        assert_eq!(report.rearmed_campaigns, 1);
        let jobs = fx.store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, DISPATCH_QUEUE);
        assert_eq!(jobs[0].payload["campaign_id"], campaign.id.to_string());

        // The live job is not duplicated
        let report = maintenance.tick(Utc::now()).await.unwrap();
        assert_eq!(report.rearmed_campaigns, 0);
        assert_eq!(fx.store.jobs().len(), 1);

        // Once that job is gone for good the next tick re-arms again
        JobRepository::fail(&fx.store, jobs[0].id, "worker lost")
            .await
            .unwrap();
        let report = maintenance.tick(Utc::now()).await.unwrap();
        assert_eq!(report.rearmed_campaigns, 1);
        assert_eq!(fx.store.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_drained_or_paused_campaigns_are_not_rearmed() {
        let fx = Fixture::new().await;
        let claimed = fx.running_campaign("Hi", 2).await;
        CampaignItemRepository::claim_pending(&fx.store, fx.scope, claimed.id, 10)
            .await
            .unwrap();
        let paused = fx.running_campaign("Hi", 2).await;
        fx.store
            .transition(fx.scope, paused.id, &[CampaignStatus::Running], CampaignStatus::Paused)
            .await
            .unwrap();
        let mut maintenance = maintenance(&fx);

        assert_eq!(maintenance.tick(Utc::now()).await.unwrap().rearmed_campaigns, 0);
        assert!(fx.store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_sweeps_enqueue_one_reconcile_job() {
        let fx = Fixture::new().await;
        stored_webhook(&fx).await;
        let mut maintenance = maintenance(&fx);
        let now = Utc::now();

        let mut swept = 0;
        for minutes in [5, 6, 7, 8] {
            swept += maintenance
                .tick(now + Duration::minutes(minutes))
                .await
                .unwrap()
                .swept_webhooks;
        }
        assert_eq!(swept, 1);
        let reconcile_jobs = fx
            .store
            .jobs()
            .into_iter()
            .filter(|j| j.queue == RECONCILE_QUEUE)
            .count();
        assert_eq!(reconcile_jobs, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_leased_and_exhausted_entries() {
        let fx = Fixture::new().await;
        let leased = stored_webhook(&fx).await;
        let exhausted = stored_webhook(&fx).await;
        let now = Utc::now();
        let mut maintenance = maintenance(&fx);

        // An attempt is in flight on one entry
        fx.store
            .begin_processing(fx.scope, leased.id, now - Duration::minutes(10))
            .await
            .unwrap();
        // The other has used up every attempt
        for _ in 0..WebhookConfig::default().max_attempts {
            fx.store
                .begin_processing(fx.scope, exhausted.id, now + Duration::hours(1))
                .await
                .unwrap();
            fx.store
                .record_error(fx.scope, exhausted.id, "unparseable")
                .await
                .unwrap();
        }

        let report = maintenance.tick(now + Duration::seconds(90)).await.unwrap();
        assert_eq!(report.swept_webhooks, 0);

        // The lease lapses; the exhausted entry stays parked
        let report = maintenance.tick(now + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.swept_webhooks, 1);
        let jobs = fx.store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["log_id"], leased.id.to_string());
    }

    #[tokio::test]
    async fn test_unprocessed_webhooks_are_swept() {
        let fx = Fixture::new().await;
        let log = stored_webhook(&fx).await;
        let mut maintenance = maintenance(&fx);

        assert_eq!(maintenance.tick(Utc::now()).await.unwrap().swept_webhooks, 0);

        let report = maintenance
            .tick(Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(report.swept_webhooks, 1);

        let jobs = fx.store.jobs();
        assert_eq!(jobs[0].queue, RECONCILE_QUEUE);
        assert_eq!(jobs[0].payload["log_id"], log.id.to_string());
    }

    #[tokio::test]
    async fn test_daily_counters_reset_on_new_day() {
        let fx = Fixture::new().await;
        for _ in 0..2 {
            SessionRepository::record_send(&fx.store, fx.scope, fx.session.id)
                .await
                .unwrap();
        }
        let mut maintenance = maintenance(&fx);

        assert_eq!(maintenance.tick(Utc::now()).await.unwrap().reset_sessions, 0);
        assert_eq!(
            maintenance
                .tick(Utc::now() + Duration::days(1))
                .await
                .unwrap()
                .reset_sessions,
            1
        );

        let session = SessionRepository::get(&fx.store, fx.scope, fx.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages_sent_today, 0);
    }

    #[tokio::test]
    async fn test_health_checks_follow_their_interval() {
        let fx = Fixture::new().await;
        fx.gateway.set_state(Some(ConnectionState::Open));
        let mut maintenance = maintenance(&fx);
        let now = Utc::now();

        assert_eq!(maintenance.tick(now).await.unwrap().health_checked, 1);
        assert_eq!(
            maintenance
                .tick(now + Duration::seconds(30))
                .await
                .unwrap()
                .health_checked,
            0
        );
        assert_eq!(
            maintenance
                .tick(now + Duration::seconds(300))
                .await
                .unwrap()
                .health_checked,
            1
        );
    }

    #[tokio::test]
    async fn test_due_scheduled_campaigns_start() {
        let fx = Fixture::new().await;
        let tag = fx.tagged_contacts(&[("Ana", "1111")]);
        let campaign = fx
            .draft_campaign(
                "Hi",
                TargetingRule {
                    tag_ids: vec![tag],
                    ..Default::default()
                },
            )
            .await;
        let mut maintenance = maintenance(&fx);
        let at = Utc::now() + Duration::minutes(2);
        maintenance
            .campaigns
            .schedule(fx.scope, campaign.id, at)
            .await
            .unwrap();

        assert_eq!(maintenance.tick(Utc::now()).await.unwrap().started_campaigns, 0);
        assert_eq!(
            maintenance
                .tick(at + Duration::seconds(1))
                .await
                .unwrap()
                .started_campaigns,
            1
        );
        assert_eq!(fx.campaign(campaign.id).await.status, "running");
    }
}
