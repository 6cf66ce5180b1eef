//! Campaign Manager - Handles campaign lifecycle transitions

use super::resolver::RecipientResolver;
use crate::queue::{Task, TaskQueue};
use chrono::{DateTime, Utc};
use parley_common::types::{CampaignId, TenantScope};
use parley_storage::models::{Campaign, CampaignCounters, CampaignStatus};
use parley_storage::repository::Repositories;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Cannot {action} a campaign in status {status}")]
    InvalidState { status: String, action: &'static str },

    #[error("No target selected")]
    NoTargetSelected,

    #[error("No recipients found for the selected target")]
    NoRecipientsFound,

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Storage(#[from] parley_common::Error),
}

/// Stored counters next to a fresh aggregate of the campaign's items
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterReport {
    pub stored: CampaignCounters,
    pub actual: CampaignCounters,
    pub drifted: bool,
    pub applied: bool,
}

/// Campaign Manager - Owns every user-driven status change
pub struct CampaignManager {
    repos: Repositories,
    resolver: RecipientResolver,
    queue: TaskQueue,
}

impl CampaignManager {
    pub fn new(repos: Repositories, queue: TaskQueue) -> Self {
        Self {
            resolver: RecipientResolver::new(repos.contacts.clone()),
            repos,
            queue,
        }
    }

    pub async fn get(&self, scope: TenantScope, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.repos
            .campaigns
            .get(scope, id)
            .await?
            .ok_or(CampaignError::NotFound)
    }

    /// Start a campaign.
    ///
    /// DRAFT and SCHEDULED campaigns get their recipients resolved and their
    /// items created first. PAUSED and FAILED campaigns go straight back to
    /// RUNNING. Starting a RUNNING campaign is a no-op.
    pub async fn start(&self, scope: TenantScope, id: CampaignId) -> Result<Campaign, CampaignError> {
        let campaign = self.get(scope, id).await?;

        let started = match campaign.status_enum() {
            Some(CampaignStatus::Running) => {
                debug!(campaign_id = %id, "Campaign already running");
                return Ok(campaign);
            }
            Some(CampaignStatus::Draft | CampaignStatus::Scheduled) => {
                let items = self
                    .resolver
                    .resolve(scope, &campaign.targeting_rule())
                    .await?;
                if items.is_empty() {
                    return Err(CampaignError::NoRecipientsFound);
                }

                match self.repos.campaigns.populate_and_start(scope, id, items).await? {
                    Some(started) => started,
                    // Someone else moved it first
                    None => return self.expect_running(scope, id, "start").await,
                }
            }
            Some(CampaignStatus::Paused | CampaignStatus::Failed) => {
                match self
                    .repos
                    .campaigns
                    .transition(
                        scope,
                        id,
                        &[CampaignStatus::Paused, CampaignStatus::Failed],
                        CampaignStatus::Running,
                    )
                    .await?
                {
                    Some(started) => started,
                    None => return self.expect_running(scope, id, "start").await,
                }
            }
            Some(CampaignStatus::Completed | CampaignStatus::Cancelled) | None => {
                return Err(invalid_state(&campaign, "start"))
            }
        };

        self.queue
            .enqueue(&Task::DispatchBatch {
                tenant_id: scope.tenant_id,
                campaign_id: id,
            })
            .await?;

        info!(
            tenant_id = %scope,
            campaign_id = %id,
            recipients = started.total_recipients,
            "Campaign started"
        );
        Ok(started)
    }

    /// Resume a PAUSED or FAILED campaign
    pub async fn resume(&self, scope: TenantScope, id: CampaignId) -> Result<Campaign, CampaignError> {
        let campaign = self.get(scope, id).await?;
        match campaign.status_enum() {
            Some(CampaignStatus::Paused | CampaignStatus::Failed | CampaignStatus::Running) => {
                self.start(scope, id).await
            }
            _ => Err(invalid_state(&campaign, "resume")),
        }
    }

    /// Pause a running campaign; the scheduler halts at its next status check
    pub async fn pause(&self, scope: TenantScope, id: CampaignId) -> Result<Campaign, CampaignError> {
        let paused = self
            .repos
            .campaigns
            .transition(scope, id, &[CampaignStatus::Running], CampaignStatus::Paused)
            .await?;

        match paused {
            Some(campaign) => {
                info!(tenant_id = %scope, campaign_id = %id, "Campaign paused");
                Ok(campaign)
            }
            None => Err(invalid_state(&self.get(scope, id).await?, "pause")),
        }
    }

    /// Cancel a campaign that has not finished; pending items are left unsent
    pub async fn cancel(&self, scope: TenantScope, id: CampaignId) -> Result<Campaign, CampaignError> {
        let cancelled = self
            .repos
            .campaigns
            .transition(
                scope,
                id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Running,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;

        match cancelled {
            Some(campaign) => {
                info!(tenant_id = %scope, campaign_id = %id, "Campaign cancelled");
                Ok(campaign)
            }
            None => Err(invalid_state(&self.get(scope, id).await?, "cancel")),
        }
    }

    /// Schedule a DRAFT campaign to start at `at`
    pub async fn schedule(
        &self,
        scope: TenantScope,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        if at <= Utc::now() {
            return Err(CampaignError::InvalidSchedule(
                "scheduled time must be in the future".into(),
            ));
        }

        match self.repos.campaigns.schedule(scope, id, at).await? {
            Some(campaign) => {
                info!(tenant_id = %scope, campaign_id = %id, scheduled_at = %at, "Campaign scheduled");
                Ok(campaign)
            }
            None => Err(invalid_state(&self.get(scope, id).await?, "schedule")),
        }
    }

    /// Start every SCHEDULED campaign whose time has come.
    ///
    /// A campaign whose target resolves to nobody goes back to DRAFT so it is
    /// not retried on every tick.
    pub async fn start_due_scheduled(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
    ) -> Result<usize, CampaignError> {
        let due = self.repos.campaigns.list_due_scheduled(scope, now).await?;
        let mut started = 0;

        for campaign in due {
            match self.start(scope, campaign.id).await {
                Ok(_) => started += 1,
                Err(e @ (CampaignError::NoTargetSelected | CampaignError::NoRecipientsFound)) => {
                    warn!(
                        tenant_id = %scope,
                        campaign_id = %campaign.id,
                        error = %e,
                        "Scheduled campaign has no recipients, returning it to draft"
                    );
                    self.repos
                        .campaigns
                        .transition(
                            scope,
                            campaign.id,
                            &[CampaignStatus::Scheduled],
                            CampaignStatus::Draft,
                        )
                        .await?;
                }
                Err(CampaignError::InvalidState { status, .. }) => {
                    debug!(campaign_id = %campaign.id, status = %status, "Scheduled campaign moved on");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(started)
    }

    /// Re-aggregate a campaign's counters from its items
    pub async fn recalculate_counters(
        &self,
        scope: TenantScope,
        id: CampaignId,
        dry_run: bool,
    ) -> Result<CounterReport, CampaignError> {
        let campaign = self.get(scope, id).await?;
        let stored = campaign.counters();
        let actual = self.repos.campaigns.aggregate_counters(scope, id).await?;
        let drifted = stored != actual;

        let applied = drifted && !dry_run;
        if applied {
            self.repos
                .campaigns
                .overwrite_counters(scope, id, &actual)
                .await?;
            warn!(
                tenant_id = %scope,
                campaign_id = %id,
                ?stored,
                ?actual,
                "Campaign counters drifted, rewritten from items"
            );
        }

        Ok(CounterReport {
            stored,
            actual,
            drifted,
            applied,
        })
    }

    async fn expect_running(
        &self,
        scope: TenantScope,
        id: CampaignId,
        action: &'static str,
    ) -> Result<Campaign, CampaignError> {
        let campaign = self.get(scope, id).await?;
        if campaign.status_enum() == Some(CampaignStatus::Running) {
            Ok(campaign)
        } else {
            Err(invalid_state(&campaign, action))
        }
    }
}

fn invalid_state(campaign: &Campaign, action: &'static str) -> CampaignError {
    CampaignError::InvalidState {
        status: campaign.status.clone(),
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use chrono::Duration;
    use parley_storage::models::{ItemStatus, TargetingRule};
    use parley_storage::repository::{CampaignItemRepository, CampaignRepository};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn manager(fx: &Fixture) -> CampaignManager {
        CampaignManager::new(fx.repos.clone(), TaskQueue::new(Arc::new(fx.store.clone()), 5))
    }

    fn tag_rule(tag: uuid::Uuid) -> TargetingRule {
        TargetingRule {
            tag_ids: vec![tag],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_populates_items_once() {
        let fx = Fixture::new().await;
        let tag = fx.tagged_contacts(&[("Ana", "1111"), ("Bia", "2222"), ("Caio", "3333")]);
        let campaign = fx.draft_campaign("Oi {{first_name}}", tag_rule(tag)).await;
        let manager = manager(&fx);

        let started = manager.start(fx.scope, campaign.id).await.unwrap();
        assert_eq!(started.status, "running");
        assert_eq!(started.total_recipients, 3);
        assert!(started.started_at.is_some());

        // Second start is a no-op
        let again = manager.start(fx.scope, campaign.id).await.unwrap();
        assert_eq!(again.status, "running");

        let items = CampaignItemRepository::list(&fx.store, fx.scope, campaign.id)
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
        assert!(items
            .iter()
            .all(|i| i.status_enum() == Some(ItemStatus::Pending)));
        assert_eq!(fx.store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_start_without_recipients_stays_draft() {
        let fx = Fixture::new().await;
        let tag = fx.store.insert_tag(fx.scope, "empty", None);
        let campaign = fx.draft_campaign("Oi", tag_rule(tag.id)).await;
        let manager = manager(&fx);

        let err = manager.start(fx.scope, campaign.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::NoRecipientsFound));

        let err = {
            let empty = fx.draft_campaign("Oi", TargetingRule::default()).await;
            manager.start(fx.scope, empty.id).await.unwrap_err()
        };
        assert!(matches!(err, CampaignError::NoTargetSelected));

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "draft");
        assert_eq!(stored.total_recipients, 0);
        assert!(CampaignItemRepository::list(&fx.store, fx.scope, campaign.id)
            .await
            .unwrap()
            .is_empty());
        assert!(fx.store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_cancel() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Oi", 2).await;
        let manager = manager(&fx);

        let paused = manager.pause(fx.scope, campaign.id).await.unwrap();
        assert_eq!(paused.status, "paused");

        let err = manager.pause(fx.scope, campaign.id).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidState { ref status, action: "pause" } if status == "paused"
        ));

        let resumed = manager.resume(fx.scope, campaign.id).await.unwrap();
        assert_eq!(resumed.status, "running");
        assert_eq!(fx.store.jobs().len(), 1);

        let cancelled = manager.cancel(fx.scope, campaign.id).await.unwrap();
        assert_eq!(cancelled.status, "cancelled");
        assert!(manager.start(fx.scope, campaign.id).await.is_err());
        assert!(manager.cancel(fx.scope, campaign.id).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_requires_paused_or_failed() {
        let fx = Fixture::new().await;
        let campaign = fx.draft_campaign("Oi", TargetingRule::default()).await;

        let err = manager(&fx).resume(fx.scope, campaign.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::InvalidState { action: "resume", .. }));
    }

    #[tokio::test]
    async fn test_unknown_campaign() {
        let fx = Fixture::new().await;
        let err = manager(&fx)
            .start(fx.scope, uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::NotFound));
    }

    #[tokio::test]
    async fn test_scheduled_campaign_starts_when_due() {
        let fx = Fixture::new().await;
        let tag = fx.tagged_contacts(&[("Ana", "1111")]);
        let campaign = fx.draft_campaign("Oi", tag_rule(tag)).await;
        let manager = manager(&fx);

        let err = manager
            .schedule(fx.scope, campaign.id, Utc::now() - Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::InvalidSchedule(_)));

        let at = Utc::now() + Duration::minutes(10);
        let scheduled = manager.schedule(fx.scope, campaign.id, at).await.unwrap();
        assert_eq!(scheduled.status, "scheduled");

        assert_eq!(manager.start_due_scheduled(fx.scope, Utc::now()).await.unwrap(), 0);
        assert_eq!(
            manager
                .start_due_scheduled(fx.scope, at + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(fx.campaign(campaign.id).await.status, "running");
    }

    #[tokio::test]
    async fn test_scheduled_campaign_without_recipients_returns_to_draft() {
        let fx = Fixture::new().await;
        let tag = fx.store.insert_tag(fx.scope, "empty", None);
        let campaign = fx.draft_campaign("Oi", tag_rule(tag.id)).await;
        let manager = manager(&fx);
        let at = Utc::now() + Duration::minutes(1);
        manager.schedule(fx.scope, campaign.id, at).await.unwrap();

        let started = manager
            .start_due_scheduled(fx.scope, at + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(started, 0);
        assert_eq!(fx.campaign(campaign.id).await.status, "draft");
    }

    #[tokio::test]
    async fn test_recalculate_counters() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Oi", 3).await;
        let manager = manager(&fx);

        let clean = manager
            .recalculate_counters(fx.scope, campaign.id, false)
            .await
            .unwrap();
        assert!(!clean.drifted);
        assert!(!clean.applied);

        let skewed = CampaignCounters {
            total_recipients: 3,
            sent: 7,
            ..Default::default()
        };
        CampaignRepository::overwrite_counters(&fx.store, fx.scope, campaign.id, &skewed)
            .await
            .unwrap();

        let report = manager
            .recalculate_counters(fx.scope, campaign.id, true)
            .await
            .unwrap();
        assert!(report.drifted);
        assert!(!report.applied);
        assert_eq!(report.stored, skewed);
        assert_eq!(fx.campaign(campaign.id).await.sent_count, 7);

        let report = manager
            .recalculate_counters(fx.scope, campaign.id, false)
            .await
            .unwrap();
        assert!(report.applied);
        assert_eq!(report.actual.sent, 0);
        assert_eq!(fx.campaign(campaign.id).await.counters(), report.actual);
    }
}
