//! Campaign Dispatcher - rate-limited bulk sends
//!
//! One dispatch loop per sending campaign. Each send waits for a token
//! from the campaign's bucket; pause and stop are observed at that token
//! boundary, never mid-send. A single target's failure moves the loop on
//! to the next target - only campaign-fatal conditions (no session) halt
//! the whole campaign, paused for operator intervention.

use super::rate_limit::TokenBucket;
use crate::connection::ConnectionManager;
use crate::flow::TemplateRenderer;
use crate::scheduler::JobScheduler;
use chatflow_common::config::CampaignConfig;
use chatflow_common::types::{CampaignId, ChatAddress, Direction, MessageKind};
use chatflow_common::{Error, Result};
use chatflow_storage::models::{
    Campaign, CampaignStatus, CampaignTarget, CreateCampaign, CreateCampaignTarget,
    CreateConversation, CreateMessage, MessageStatus,
};
use chatflow_storage::repository::{
    CampaignRepository, ConversationRepository, MessageRepository, TargetRepository,
};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One recipient of a campaign, before persistence
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub address: String,
    pub display_name: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

/// Campaign Dispatcher
pub struct CampaignDispatcher {
    campaigns: Arc<dyn CampaignRepository>,
    targets: Arc<dyn TargetRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    connections: Arc<ConnectionManager>,
    scheduler: Arc<JobScheduler>,
    renderer: TemplateRenderer,
    config: CampaignConfig,
    /// Live dispatch loops; reconstructible from campaigns in `sending`
    loops: Mutex<HashMap<CampaignId, JoinHandle<()>>>,
}

impl CampaignDispatcher {
    /// Create a new campaign dispatcher
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        targets: Arc<dyn TargetRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        connections: Arc<ConnectionManager>,
        scheduler: Arc<JobScheduler>,
        config: CampaignConfig,
    ) -> Self {
        Self {
            campaigns,
            targets,
            conversations,
            messages,
            connections,
            scheduler,
            renderer: TemplateRenderer::new(),
            config,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Create a campaign with its target list. Starts dispatch immediately
    /// unless `scheduled_at` lies in the future, in which case a one-shot
    /// start is registered with the scheduler.
    pub async fn create_campaign(
        self: &Arc<Self>,
        mut input: CreateCampaign,
        target_specs: Vec<TargetSpec>,
    ) -> Result<Campaign> {
        if target_specs.is_empty() {
            return Err(Error::Validation(
                "campaign requires a non-empty target list".to_string(),
            ));
        }
        if let Some(bad) = target_specs
            .iter()
            .find(|spec| ChatAddress::parse(&spec.address).is_none())
        {
            return Err(Error::Validation(format!(
                "malformed target address '{}'",
                bad.address
            )));
        }

        let rate = input
            .rate_limit_per_minute
            .unwrap_or(self.config.default_rate_limit_per_minute as i32);
        if rate < 1 {
            return Err(Error::Validation(
                "rate limit must be at least one message per minute".to_string(),
            ));
        }
        input.rate_limit_per_minute = Some(rate);

        let campaign = self.campaigns.create(input).await?;

        let targets: Vec<CreateCampaignTarget> = target_specs
            .into_iter()
            .map(|spec| CreateCampaignTarget {
                campaign_id: campaign.id,
                address: spec.address,
                display_name: spec.display_name,
                attributes: spec.attributes,
            })
            .collect();
        let count = self.targets.create_batch(targets).await?;
        self.campaigns
            .set_target_count(campaign.id, count as i32)
            .await?;

        match campaign.scheduled_at {
            Some(at) if at > Utc::now() => {
                self.scheduler.schedule_campaign(campaign.id, at).await;
                info!(campaign = %campaign.id, targets = count, %at, "Campaign deferred");
            }
            _ => {
                self.start_campaign(campaign.id).await?;
            }
        }

        self.campaigns
            .get(campaign.id)
            .await?
            .ok_or_else(|| Error::Internal("campaign vanished after creation".to_string()))
    }

    /// Move a scheduled campaign into `sending` and spawn its loop.
    /// A no-op when the campaign has been paused or stopped meanwhile.
    pub async fn start_campaign(self: &Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let started = self
            .campaigns
            .try_set_status(
                campaign_id,
                &[CampaignStatus::Scheduled],
                CampaignStatus::Sending,
                None,
            )
            .await?;
        if !started {
            debug!(campaign = %campaign_id, "Start skipped: campaign is not in scheduled state");
            return Ok(());
        }

        // A manual start supersedes any deferred one still registered
        self.scheduler.cancel_campaign(campaign_id).await;

        info!(campaign = %campaign_id, "Campaign sending");
        self.spawn_loop(campaign_id).await;
        Ok(())
    }

    /// Pause: the loop halts after the in-flight send completes
    pub async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        let paused = self
            .campaigns
            .try_set_status(
                campaign_id,
                &[CampaignStatus::Scheduled, CampaignStatus::Sending],
                CampaignStatus::Paused,
                None,
            )
            .await?;
        if !paused {
            return Err(Error::Conflict("campaign cannot be paused".to_string()));
        }

        // A deferred start must not fire into a paused campaign
        self.scheduler.cancel_campaign(campaign_id).await;
        info!(campaign = %campaign_id, "Campaign paused");
        Ok(())
    }

    /// Resume a paused campaign
    pub async fn resume_campaign(self: &Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        self.campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        let resumed = self
            .campaigns
            .try_set_status(
                campaign_id,
                &[CampaignStatus::Paused],
                CampaignStatus::Sending,
                None,
            )
            .await?;
        if !resumed {
            return Err(Error::Conflict("campaign is not paused".to_string()));
        }

        info!(campaign = %campaign_id, "Campaign resumed");
        self.spawn_loop(campaign_id).await;
        Ok(())
    }

    /// Stop: cancel remaining pending targets and finalize. A campaign
    /// that delivered anything counts as completed; one that never sent
    /// counts as failed.
    pub async fn stop_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        self.scheduler.cancel_campaign(campaign_id).await;
        let cancelled = self.targets.cancel_pending(campaign_id).await?;

        // Counts re-read after cancellation so the in-flight loop has
        // nothing left to claim
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;
        let final_status = if campaign.sent_count > 0 {
            CampaignStatus::Completed
        } else {
            CampaignStatus::Failed
        };

        let stopped = self
            .campaigns
            .try_set_status(
                campaign_id,
                &[
                    CampaignStatus::Scheduled,
                    CampaignStatus::Sending,
                    CampaignStatus::Paused,
                ],
                final_status,
                Some("stopped by operator".to_string()),
            )
            .await?;
        if !stopped {
            return Err(Error::Conflict("campaign already finished".to_string()));
        }

        info!(
            campaign = %campaign_id,
            cancelled,
            status = %final_status,
            "Campaign stopped"
        );
        Ok(())
    }

    /// Restart reconciliation: release targets claimed by dead loops and
    /// restart dispatch for every campaign persisted as `sending`
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let sending = self.campaigns.list_by_status(CampaignStatus::Sending).await?;

        for campaign in &sending {
            let released = self.targets.release_claimed(campaign.id).await?;
            if released > 0 {
                debug!(campaign = %campaign.id, released, "Released targets claimed by a dead loop");
            }
            self.spawn_loop(campaign.id).await;
        }

        if !sending.is_empty() {
            info!(count = sending.len(), "Recovered in-flight campaigns");
        }
        Ok(sending.len())
    }

    async fn spawn_loop(self: &Arc<Self>, campaign_id: CampaignId) {
        let mut loops = self.loops.lock().await;
        if let Some(handle) = loops.get(&campaign_id) {
            if !handle.is_finished() {
                debug!(campaign = %campaign_id, "Dispatch loop already running");
                return;
            }
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.clone().dispatch_loop(campaign_id).await {
                warn!(campaign = %campaign_id, error = %e, "Dispatch loop aborted");
            }
            this.loops.lock().await.remove(&campaign_id);
        });
        loops.insert(campaign_id, handle);
    }

    async fn dispatch_loop(self: Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        let mut bucket = TokenBucket::per_minute(campaign.rate_limit_per_minute.max(1) as u32);

        loop {
            // Each send waits for one token first; stop/pause are observed
            // here, at the token boundary
            bucket.acquire().await;

            let Some(campaign) = self.campaigns.get(campaign_id).await? else {
                return Ok(());
            };
            if campaign.status_enum() != Some(CampaignStatus::Sending) {
                info!(campaign = %campaign_id, status = %campaign.status, "Dispatch halting");
                return Ok(());
            }

            let Some(target) = self.targets.claim_next_pending(campaign_id).await? else {
                // Targets exhausted
                let completed = self
                    .campaigns
                    .try_set_status(
                        campaign_id,
                        &[CampaignStatus::Sending],
                        CampaignStatus::Completed,
                        None,
                    )
                    .await?;
                if completed {
                    info!(campaign = %campaign_id, "Campaign completed");
                }
                return Ok(());
            };

            if let Err(e) = self.send_target(&campaign, &target).await {
                match e {
                    Error::Connection(reason) => {
                        // Campaign-fatal: park everything for the operator
                        self.targets.release_to_pending(target.id).await?;
                        self.campaigns
                            .try_set_status(
                                campaign_id,
                                &[CampaignStatus::Sending],
                                CampaignStatus::Paused,
                                Some(format!("paused for operator: {}", reason)),
                            )
                            .await?;
                        warn!(campaign = %campaign_id, %reason, "Campaign paused on fatal error");
                        return Ok(());
                    }
                    other => return Err(other),
                }
            }
        }
    }

    /// Send to a single claimed target. A per-target SendFailure is
    /// absorbed here (counted, loop continues); connection loss bubbles up
    /// as campaign-fatal.
    async fn send_target(&self, campaign: &Campaign, target: &CampaignTarget) -> Result<()> {
        if self
            .connections
            .active_session(campaign.account_id)
            .await
            .is_none()
        {
            return Err(Error::Connection(
                "account has no active session".to_string(),
            ));
        }

        let content = self
            .renderer
            .render_for_target(&campaign.message_template, target);

        // Human pacing; separate from the rate limit and token-free
        if campaign.typing_simulation {
            tokio::time::sleep(typing_delay(&self.config, content.chars().count())).await;
        }

        let kind: MessageKind = campaign.kind.parse().unwrap_or_default();
        let conversation = self
            .conversations
            .upsert_remote(CreateConversation {
                account_id: campaign.account_id,
                remote_address: target.address.clone(),
                contact_name: target.display_name.clone(),
                attributes: None,
            })
            .await?;

        let message = self
            .messages
            .create(CreateMessage {
                account_id: campaign.account_id,
                conversation_id: conversation.id,
                direction: Direction::Outbound,
                kind,
                content: content.clone(),
                status: MessageStatus::Pending,
                gateway_message_id: None,
                campaign_target_id: Some(target.id),
            })
            .await?;

        match self
            .connections
            .send(campaign.account_id, &target.address, &content, kind)
            .await
        {
            Ok(receipt) => {
                self.messages
                    .mark_sent(message.id, &receipt.gateway_message_id)
                    .await?;
                self.targets.mark_sent(target.id, message.id).await?;
                self.campaigns.increment_sent(campaign.id).await?;
                self.conversations.touch_activity(conversation.id).await?;
                debug!(campaign = %campaign.id, target = %target.address, "Target sent");
                Ok(())
            }
            Err(Error::SendFailure(reason)) => {
                self.messages.mark_failed(message.id, &reason).await?;
                self.targets.mark_failed(target.id, &reason).await?;
                self.campaigns.increment_failed(campaign.id).await?;
                warn!(
                    campaign = %campaign.id,
                    target = %target.address,
                    %reason,
                    "Target failed; continuing with next"
                );
                Ok(())
            }
            Err(e @ Error::Connection(_)) => {
                self.messages.mark_failed(message.id, &e.to_string()).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Randomized, length-proportional, clamped pre-send delay
fn typing_delay(config: &CampaignConfig, content_len: usize) -> Duration {
    let base = (content_len as u64).saturating_mul(config.typing_ms_per_char);
    let jitter = rand::thread_rng().gen_range(0.6..=1.4);
    let ms = (base as f64 * jitter) as u64;
    Duration::from_millis(ms.clamp(config.typing_min_ms, config.typing_max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_harness, wait_until};
    use pretty_assertions::assert_eq;

    fn specs(addresses: &[&str]) -> Vec<TargetSpec> {
        addresses
            .iter()
            .map(|a| TargetSpec {
                address: a.to_string(),
                display_name: None,
                attributes: None,
            })
            .collect()
    }

    fn campaign_input(
        account_id: chatflow_common::types::AccountId,
        rate: i32,
    ) -> CreateCampaign {
        CreateCampaign {
            account_id,
            name: "launch".to_string(),
            message_template: "Hello {{name}}".to_string(),
            kind: MessageKind::Text,
            rate_limit_per_minute: Some(rate),
            typing_simulation: Some(false),
            scheduled_at: None,
        }
    }

    #[test]
    fn test_typing_delay_respects_clamp() {
        let config = CampaignConfig::default();
        for len in [0usize, 1, 40, 100_000] {
            let delay = typing_delay(&config, len);
            assert!(delay >= Duration::from_millis(config.typing_min_ms));
            assert!(delay <= Duration::from_millis(config.typing_max_ms));
        }
    }

    #[tokio::test]
    async fn empty_target_list_is_rejected() {
        let harness = test_harness().await;
        let err = harness
            .dispatcher
            .create_campaign(campaign_input(harness.account_id, 60), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_flaky_target_retries_inside_send_budget() {
        let harness = test_harness().await;
        // Second target fails twice, then succeeds - inside the
        // connection manager's 3-attempt budget
        harness.client.fail_sends_to("t2@c.gw", 2);

        let campaign = harness
            .dispatcher
            .create_campaign(
                campaign_input(harness.account_id, 60),
                specs(&["t1@c.gw", "t2@c.gw", "t3@c.gw"]),
            )
            .await
            .unwrap();
        assert_eq!(campaign.target_count, 3);

        wait_until(|| async {
            harness
                .campaigns
                .get(campaign.id)
                .await
                .unwrap()
                .unwrap()
                .status
                == "completed"
        })
        .await;

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 3);
        assert_eq!(campaign.failed_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_bad_target_never_aborts_the_campaign() {
        let harness = test_harness().await;
        // Beyond the retry budget: this target's sends always fail
        harness.client.fail_sends_to("bad@c.gw", 1000);

        let campaign = harness
            .dispatcher
            .create_campaign(
                campaign_input(harness.account_id, 60),
                specs(&["t1@c.gw", "bad@c.gw", "t3@c.gw"]),
            )
            .await
            .unwrap();

        wait_until(|| async {
            harness
                .campaigns
                .get(campaign.id)
                .await
                .unwrap()
                .unwrap()
                .status
                == "completed"
        })
        .await;

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 2);
        assert_eq!(campaign.failed_count, 1);
        // Aggregate invariants hold at the end state
        assert!(campaign.sent_count + campaign.failed_count <= campaign.target_count);
        assert!(campaign.delivered_count <= campaign.sent_count);
        assert!(campaign.read_count <= campaign.delivered_count);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_halts_at_token_boundary_and_resume_finishes() {
        let harness = test_harness().await;

        // Slow pacing so the campaign is mid-flight when we pause
        let campaign = harness
            .dispatcher
            .create_campaign(
                campaign_input(harness.account_id, 6),
                specs(&["t1@c.gw", "t2@c.gw", "t3@c.gw"]),
            )
            .await
            .unwrap();

        wait_until(|| async { harness.client.send_calls() >= 1 }).await;
        harness.dispatcher.pause_campaign(campaign.id).await.unwrap();

        wait_until(|| async {
            harness.dispatcher.loops.lock().await.is_empty()
        })
        .await;
        let sent_when_paused = harness.client.send_calls();

        // Long idle while paused: nothing moves
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(harness.client.send_calls(), sent_when_paused);

        harness.dispatcher.resume_campaign(campaign.id).await.unwrap();
        wait_until(|| async {
            harness
                .campaigns
                .get(campaign.id)
                .await
                .unwrap()
                .unwrap()
                .status
                == "completed"
        })
        .await;

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_pauses_campaign_for_operator() {
        let harness = test_harness().await;
        harness.connections.disconnect(harness.account_id).await.unwrap();

        let campaign = harness
            .dispatcher
            .create_campaign(
                campaign_input(harness.account_id, 60),
                specs(&["t1@c.gw", "t2@c.gw"]),
            )
            .await
            .unwrap();

        wait_until(|| async {
            harness
                .campaigns
                .get(campaign.id)
                .await
                .unwrap()
                .unwrap()
                .status
                == "paused"
        })
        .await;

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert!(campaign.status_reason.unwrap().contains("operator"));
        assert_eq!(campaign.sent_count, 0);
        // The claimed target went back to the pool
        assert_eq!(
            harness
                .targets
                .count_by_status(campaign.id, chatflow_storage::models::TargetStatus::Pending)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_and_finalizes_on_successes() {
        let harness = test_harness().await;

        let campaign = harness
            .dispatcher
            .create_campaign(
                campaign_input(harness.account_id, 6),
                specs(&["t1@c.gw", "t2@c.gw", "t3@c.gw"]),
            )
            .await
            .unwrap();

        wait_until(|| async { harness.client.send_calls() >= 1 }).await;
        harness.dispatcher.stop_campaign(campaign.id).await.unwrap();

        wait_until(|| async { harness.dispatcher.loops.lock().await.is_empty() }).await;

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "completed", "a stop after successes completes");
        assert!(campaign.sent_count >= 1);

        // Nothing left pending, no further sends after the stop
        let pending = harness
            .targets
            .count_by_status(campaign.id, chatflow_storage::models::TargetStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending, 0);

        let calls = harness.client.send_calls();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(harness.client.send_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_any_success_fails_the_campaign() {
        let harness = test_harness().await;

        // Deferred, so nothing has been sent when the stop arrives
        let mut input = campaign_input(harness.account_id, 6);
        input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));

        let campaign = harness
            .dispatcher
            .create_campaign(input, specs(&["t1@c.gw", "t2@c.gw"]))
            .await
            .unwrap();

        harness.dispatcher.stop_campaign(campaign.id).await.unwrap();

        let campaign = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "failed");
        assert_eq!(campaign.sent_count, 0);
        // The deferred start was cancelled with it
        assert!(harness.scheduler.status().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_campaign_waits_for_the_scheduler() {
        let harness = test_harness().await;

        let mut input = campaign_input(harness.account_id, 60);
        input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));

        let campaign = harness
            .dispatcher
            .create_campaign(input, specs(&["t1@c.gw"]))
            .await
            .unwrap();

        assert_eq!(campaign.status, "scheduled");
        assert_eq!(harness.client.send_calls(), 0);
        // Registered exactly one deferred start
        let jobs = harness.scheduler.status().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job, format!("campaign:{}", campaign.id));

        // The scheduler firing starts dispatch
        harness.dispatcher.start_campaign(campaign.id).await.unwrap();
        wait_until(|| async {
            harness
                .campaigns
                .get(campaign.id)
                .await
                .unwrap()
                .unwrap()
                .status
                == "completed"
        })
        .await;
        assert_eq!(harness.client.send_calls(), 1);
    }
}
