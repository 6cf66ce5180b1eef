//! Dispatch Scheduler - Sends one claimed batch per activation

use super::pacing::Pacer;
use super::template::TemplateRenderer;
use crate::gateway::GatewayClient;
use parley_common::config::DispatchConfig;
use parley_common::types::{CampaignId, TenantScope};
use parley_common::Result;
use parley_storage::models::{Campaign, CampaignItem, CampaignStatus, GatewaySession};
use parley_storage::repository::Repositories;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How an activation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The campaign is not running (any more); nothing to re-arm
    Halted,
    /// Every item reached an outcome and the campaign was completed
    Completed,
    /// Run another activation after the delay
    Rearm(Duration),
}

/// Dispatch Scheduler
///
/// Activations are re-entrant: several may run for the same campaign at
/// once, and the claim step guarantees they never hold the same item.
pub struct DispatchScheduler {
    repos: Repositories,
    gateway: Arc<dyn GatewayClient>,
    renderer: TemplateRenderer,
    pacer: Pacer,
    config: DispatchConfig,
}

impl DispatchScheduler {
    pub fn new(repos: Repositories, gateway: Arc<dyn GatewayClient>, config: DispatchConfig) -> Self {
        Self {
            repos,
            gateway,
            renderer: TemplateRenderer::new(),
            pacer: Pacer::new(config.pacing_enabled),
            config,
        }
    }

    /// Run one activation for a campaign
    pub async fn run_batch(&self, scope: TenantScope, campaign_id: CampaignId) -> Result<BatchOutcome> {
        let Some(campaign) = self.repos.campaigns.get(scope, campaign_id).await? else {
            warn!(tenant_id = %scope, campaign_id = %campaign_id, "Campaign not found for dispatch");
            return Ok(BatchOutcome::Halted);
        };
        if campaign.status_enum() != Some(CampaignStatus::Running) {
            debug!(campaign_id = %campaign_id, status = %campaign.status, "Campaign not running, skipping batch");
            return Ok(BatchOutcome::Halted);
        }

        let session = match self.repos.sessions.get(scope, campaign.session_id).await? {
            Some(session) if session.is_active => session,
            _ => {
                warn!(
                    tenant_id = %scope,
                    campaign_id = %campaign_id,
                    session_id = %campaign.session_id,
                    "Gateway session missing or deactivated, failing campaign"
                );
                self.repos
                    .campaigns
                    .transition(
                        scope,
                        campaign_id,
                        &[CampaignStatus::Running],
                        CampaignStatus::Failed,
                    )
                    .await?;
                return Ok(BatchOutcome::Halted);
            }
        };

        let quota = i64::from(session.remaining_messages_today());
        if quota == 0 {
            info!(
                campaign_id = %campaign_id,
                session_id = %session.id,
                "Daily message limit reached, backing off"
            );
            return Ok(BatchOutcome::Rearm(self.config.quota_backoff()));
        }

        let items = self
            .repos
            .items
            .claim_pending(scope, campaign_id, self.config.batch_size.min(quota))
            .await?;
        if items.is_empty() {
            return self.finish(scope, campaign_id, self.config.locked_retry_delay()).await;
        }

        debug!(campaign_id = %campaign_id, claimed = items.len(), "Claimed batch");

        for (index, item) in items.iter().enumerate() {
            let body = self.renderer.render(&campaign.message, &item.substitutions);

            // Pause and cancel take effect before each send, on both sides of the delay
            let keep_going = self.is_running(scope, campaign_id).await? && {
                self.pacer.wait(&body).await;
                self.is_running(scope, campaign_id).await?
            };
            if !keep_going {
                let unsent: Vec<_> = items[index..].iter().map(|i| i.id).collect();
                let released = self.repos.items.release(scope, &unsent).await?;
                info!(
                    campaign_id = %campaign_id,
                    sent = index,
                    released,
                    "Campaign stopped mid-batch"
                );
                return Ok(BatchOutcome::Halted);
            }

            self.send_item(scope, &campaign, &session, item, &body).await?;
        }

        self.finish(scope, campaign_id, self.config.rearm_delay()).await
    }

    /// Complete the campaign if drained, otherwise re-arm.
    ///
    /// `pending_delay` applies while PENDING items remain. QUEUED items held by
    /// another activation always wait `locked_retry_delay`.
    async fn finish(
        &self,
        scope: TenantScope,
        campaign_id: CampaignId,
        pending_delay: Duration,
    ) -> Result<BatchOutcome> {
        let remaining = self.repos.items.count_unfinished(scope, campaign_id).await?;

        if remaining.pending > 0 {
            return Ok(BatchOutcome::Rearm(pending_delay));
        }
        if remaining.queued > 0 {
            debug!(
                campaign_id = %campaign_id,
                queued = remaining.queued,
                "Remaining items claimed elsewhere"
            );
            return Ok(BatchOutcome::Rearm(self.config.locked_retry_delay()));
        }

        if self.repos.campaigns.complete_if_drained(scope, campaign_id).await? {
            info!(tenant_id = %scope, campaign_id = %campaign_id, "Campaign completed");
            Ok(BatchOutcome::Completed)
        } else {
            Ok(BatchOutcome::Halted)
        }
    }

    async fn is_running(&self, scope: TenantScope, campaign_id: CampaignId) -> Result<bool> {
        Ok(self.repos.campaigns.status(scope, campaign_id).await? == Some(CampaignStatus::Running))
    }

    async fn send_item(
        &self,
        scope: TenantScope,
        campaign: &Campaign,
        session: &GatewaySession,
        item: &CampaignItem,
        body: &str,
    ) -> Result<()> {
        let sent = match campaign.media() {
            Some((media_url, media_type)) => {
                self.gateway
                    .send_media(
                        &session.instance_id,
                        &item.recipient_phone,
                        media_url,
                        media_type,
                        body,
                    )
                    .await
            }
            None => {
                self.gateway
                    .send_text(&session.instance_id, &item.recipient_phone, body)
                    .await
            }
        };

        match sent {
            Ok(receipt) => {
                if receipt.message_id.is_none() {
                    warn!(
                        campaign_id = %campaign.id,
                        item_id = %item.id,
                        "Gateway response carried no message id, delivery updates cannot be matched"
                    );
                }
                let recorded = self
                    .repos
                    .items
                    .record_sent(scope, item.id, receipt.message_id.as_deref())
                    .await?;
                if !recorded {
                    warn!(item_id = %item.id, "Item left QUEUED before the send was recorded");
                }
                self.repos.sessions.record_send(scope, session.id).await?;
                debug!(item_id = %item.id, message_id = ?receipt.message_id, "Message sent");
            }
            Err(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    item_id = %item.id,
                    error = %e,
                    "Send failed"
                );
                self.repos
                    .items
                    .record_failed(scope, item.id, &e.to_string())
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use parley_storage::models::{ItemStatus, TargetingRule};
    use parley_storage::repository::{
        CampaignItemRepository, CampaignRepository, CreateCampaign, SessionRepository,
    };
    use pretty_assertions::assert_eq;

    fn scheduler(fx: &Fixture, config: DispatchConfig) -> DispatchScheduler {
        DispatchScheduler::new(fx.repos.clone(), fx.gateway.clone(), config)
    }

    async fn statuses(fx: &Fixture, id: CampaignId) -> Vec<ItemStatus> {
        CampaignItemRepository::list(&fx.store, fx.scope, id)
            .await
            .unwrap()
            .iter()
            .filter_map(|i| i.status_enum())
            .collect()
    }

    #[tokio::test]
    async fn test_batch_sends_everything_and_completes() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hello {{name}}!", 3).await;
        let scheduler = scheduler(&fx, Fixture::dispatch_config());

        let outcome = scheduler.run_batch(fx.scope, campaign.id).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Completed);

        let sent = fx.gateway.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].text, "Hello Recipient 0!");
        assert_eq!(sent[0].instance, "acme-main");
        assert_eq!(sent[2].phone, "5511900000002");

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.sent_count, 3);
        assert!(stored.completed_at.is_some());

        let items = CampaignItemRepository::list(&fx.store, fx.scope, campaign.id)
            .await
            .unwrap();
        assert_eq!(items[1].message_id.as_deref(), Some("gw-2"));
        assert!(items.iter().all(|i| i.sent_at.is_some()));

        let session = SessionRepository::get(&fx.store, fx.scope, fx.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages_sent_today, 3);
        assert!(session.last_message_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_concurrent_activations_send_each_item_once() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi {{name}}", 25).await;
        let scheduler = Arc::new(scheduler(&fx, Fixture::dispatch_config()));

        // Keep activating until the campaign drains, the way re-arming would
        for _ in 0..10 {
            let activations: Vec<_> = (0..3)
                .map(|_| {
                    let scheduler = scheduler.clone();
                    let scope = fx.scope;
                    let id = campaign.id;
                    tokio::spawn(async move { scheduler.run_batch(scope, id).await })
                })
                .collect();
            for activation in activations {
                activation.await.unwrap().unwrap();
            }
            if fx.campaign(campaign.id).await.status == "completed" {
                break;
            }
        }

        let sent = fx.gateway.sent();
        assert_eq!(sent.len(), 25);
        let unique: std::collections::HashSet<_> = sent.iter().map(|s| &s.phone).collect();
        assert_eq!(unique.len(), 25);

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.sent_count, 25);
        assert!(statuses(&fx, campaign.id)
            .await
            .iter()
            .all(|s| *s == ItemStatus::Sent));
    }

    #[tokio::test]
    async fn test_remaining_items_rearm() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 3).await;
        let config = DispatchConfig {
            batch_size: 2,
            ..Fixture::dispatch_config()
        };
        let scheduler = scheduler(&fx, config.clone());

        assert_eq!(
            scheduler.run_batch(fx.scope, campaign.id).await.unwrap(),
            BatchOutcome::Rearm(config.rearm_delay())
        );
        assert_eq!(fx.gateway.sent().len(), 2);

        assert_eq!(
            scheduler.run_batch(fx.scope, campaign.id).await.unwrap(),
            BatchOutcome::Completed
        );
        assert_eq!(fx.campaign(campaign.id).await.sent_count, 3);
    }

    #[tokio::test]
    async fn test_pause_mid_batch_leaves_rest_unsent() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 10).await;
        fx.gateway.pause_after(3, &fx.store, fx.scope, campaign.id);
        let scheduler = scheduler(&fx, Fixture::dispatch_config());

        let outcome = scheduler.run_batch(fx.scope, campaign.id).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Halted);
        assert_eq!(fx.gateway.sent().len(), 3);

        let statuses = statuses(&fx, campaign.id).await;
        assert_eq!(&statuses[..3], &[ItemStatus::Sent; 3]);
        assert_eq!(&statuses[3..], &[ItemStatus::Pending; 7]);

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.status, "paused");
        assert_eq!(stored.sent_count, 3);

        // A stale activation for the paused campaign does nothing
        assert_eq!(
            scheduler.run_batch(fx.scope, campaign.id).await.unwrap(),
            BatchOutcome::Halted
        );
        assert_eq!(fx.gateway.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_abort_batch() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 3).await;
        fx.gateway.fail_phone("5511900000001");
        let scheduler = scheduler(&fx, Fixture::dispatch_config());

        assert_eq!(
            scheduler.run_batch(fx.scope, campaign.id).await.unwrap(),
            BatchOutcome::Completed
        );

        let stored = fx.campaign(campaign.id).await;
        assert_eq!(stored.sent_count, 2);
        assert_eq!(stored.failed_count, 1);
        assert_eq!(stored.sent_count + stored.failed_count, stored.total_recipients);

        let items = CampaignItemRepository::list(&fx.store, fx.scope, campaign.id)
            .await
            .unwrap();
        assert_eq!(items[1].status_enum(), Some(ItemStatus::Failed));
        assert!(items[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("number not on network"));
    }

    #[tokio::test]
    async fn test_media_campaign_uses_media_send() {
        let fx = Fixture::new().await;
        let campaign = CampaignRepository::create(
            &fx.store,
            fx.scope,
            CreateCampaign {
                session_id: fx.session.id,
                name: "Flyer".into(),
                message: "See attached, {{name}}".into(),
                media_url: Some("https://cdn.example.com/flyer.png".into()),
                media_type: Some("image".into()),
                target: TargetingRule::default(),
                created_by: None,
            },
        )
        .await
        .unwrap();
        fx.store
            .populate_and_start(
                fx.scope,
                campaign.id,
                vec![parley_storage::repository::NewCampaignItem {
                    contact_id: None,
                    recipient_name: "Ana".into(),
                    recipient_phone: "1111".into(),
                    substitutions: serde_json::json!({ "name": "Ana" }),
                }],
            )
            .await
            .unwrap();

        scheduler(&fx, Fixture::dispatch_config())
            .run_batch(fx.scope, campaign.id)
            .await
            .unwrap();

        let sent = fx.gateway.sent();
        assert_eq!(
            sent[0].media_url.as_deref(),
            Some("https://cdn.example.com/flyer.png")
        );
        assert_eq!(sent[0].text, "See attached, Ana");
    }

    #[tokio::test]
    async fn test_exhausted_quota_backs_off() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 2).await;
        for _ in 0..fx.session.daily_message_limit {
            SessionRepository::record_send(&fx.store, fx.scope, fx.session.id)
                .await
                .unwrap();
        }
        let config = Fixture::dispatch_config();

        assert_eq!(
            scheduler(&fx, config.clone())
                .run_batch(fx.scope, campaign.id)
                .await
                .unwrap(),
            BatchOutcome::Rearm(config.quota_backoff())
        );
        assert!(fx.gateway.sent().is_empty());
        assert_eq!(statuses(&fx, campaign.id).await, vec![ItemStatus::Pending; 2]);
    }

    #[tokio::test]
    async fn test_inactive_session_fails_campaign() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 2).await;
        SessionRepository::deactivate(&fx.store, fx.scope, fx.session.id)
            .await
            .unwrap();

        let outcome = scheduler(&fx, Fixture::dispatch_config())
            .run_batch(fx.scope, campaign.id)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Halted);
        assert_eq!(fx.campaign(campaign.id).await.status, "failed");
        assert!(fx.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_items_claimed_elsewhere_delay_completion() {
        let fx = Fixture::new().await;
        let campaign = fx.running_campaign("Hi", 2).await;
        // Another activation holds both items
        CampaignItemRepository::claim_pending(&fx.store, fx.scope, campaign.id, 10)
            .await
            .unwrap();
        let config = Fixture::dispatch_config();

        assert_eq!(
            scheduler(&fx, config.clone())
                .run_batch(fx.scope, campaign.id)
                .await
                .unwrap(),
            BatchOutcome::Rearm(config.locked_retry_delay())
        );
        assert_eq!(fx.campaign(campaign.id).await.status, "running");
    }
}
