//! Event Processor - translates the inbound feed into state updates
//!
//! Delivery receipts move Message and CampaignTarget rows through guarded
//! transitions, so replayed or out-of-order receipts can never push
//! campaign counters past `read <= delivered <= sent`.

use super::{ConnectionState, DeliveryState, GatewayEvent};
use crate::connection::ConnectionManager;
use crate::flow::{FlowEngine, TriggerEvent};
use chatflow_common::types::Direction;
use chatflow_common::Result;
use chatflow_storage::models::{CreateConversation, CreateMessage, Message, MessageStatus};
use chatflow_storage::repository::{
    CampaignRepository, ConversationRepository, MessageRepository, TargetRepository,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event Processor
pub struct EventProcessor {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    targets: Arc<dyn TargetRepository>,
    connections: Arc<ConnectionManager>,
    engine: Arc<FlowEngine>,
}

impl EventProcessor {
    /// Create a new event processor
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        targets: Arc<dyn TargetRepository>,
        connections: Arc<ConnectionManager>,
        engine: Arc<FlowEngine>,
    ) -> Self {
        Self {
            conversations,
            messages,
            campaigns,
            targets,
            connections,
            engine,
        }
    }

    /// Drain the event feed until the sender side closes
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayEvent>) {
        info!("Event processor started");
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle_event(event).await {
                warn!(error = %e, "Event handling failed");
            }
        }
        info!("Event feed closed; processor stopping");
    }

    /// Apply a single feed event
    pub async fn handle_event(&self, event: GatewayEvent) -> Result<()> {
        match event {
            GatewayEvent::MessageReceived {
                account_id,
                remote_address,
                contact_name,
                content,
                kind,
                gateway_message_id,
            } => {
                // Duplicate feed deliveries are dropped on the floor
                if self
                    .messages
                    .find_by_gateway_id(account_id, &gateway_message_id)
                    .await?
                    .is_some()
                {
                    debug!(%gateway_message_id, "Duplicate inbound message ignored");
                    return Ok(());
                }

                let known = self
                    .conversations
                    .find_by_remote(account_id, &remote_address)
                    .await?
                    .is_some();

                let conversation = self
                    .conversations
                    .upsert_remote(CreateConversation {
                        account_id,
                        remote_address: remote_address.clone(),
                        contact_name,
                        attributes: None,
                    })
                    .await?;
                self.conversations.increment_unread(conversation.id).await?;

                self.messages
                    .create(CreateMessage {
                        account_id,
                        conversation_id: conversation.id,
                        direction: Direction::Inbound,
                        kind,
                        content: content.clone(),
                        status: MessageStatus::Delivered,
                        gateway_message_id: Some(gateway_message_id),
                        campaign_target_id: None,
                    })
                    .await?;

                if !known {
                    self.engine
                        .activate_event_triggers(
                            &conversation,
                            TriggerEvent::ConversationOpened,
                            Some(&content),
                        )
                        .await?;
                }
                self.engine
                    .activate_event_triggers(
                        &conversation,
                        TriggerEvent::MessageReceived,
                        Some(&content),
                    )
                    .await?;
                Ok(())
            }

            GatewayEvent::MessageSent {
                account_id,
                remote_address,
                content,
                kind,
                gateway_message_id,
            } => {
                // Sends made through this core are already recorded; the
                // echo only matters for messages sent elsewhere
                if self
                    .messages
                    .find_by_gateway_id(account_id, &gateway_message_id)
                    .await?
                    .is_some()
                {
                    return Ok(());
                }

                let conversation = self
                    .conversations
                    .upsert_remote(CreateConversation {
                        account_id,
                        remote_address,
                        contact_name: None,
                        attributes: None,
                    })
                    .await?;
                self.conversations.touch_activity(conversation.id).await?;

                self.messages
                    .create(CreateMessage {
                        account_id,
                        conversation_id: conversation.id,
                        direction: Direction::Outbound,
                        kind,
                        content,
                        status: MessageStatus::Sent,
                        gateway_message_id: Some(gateway_message_id),
                        campaign_target_id: None,
                    })
                    .await?;
                Ok(())
            }

            GatewayEvent::DeliveryStatusUpdate {
                account_id,
                gateway_message_id,
                status,
                reason,
            } => {
                let Some(message) = self
                    .messages
                    .find_by_gateway_id(account_id, &gateway_message_id)
                    .await?
                else {
                    debug!(%gateway_message_id, "Receipt for unknown message ignored");
                    return Ok(());
                };

                match status {
                    DeliveryState::Delivered => self.apply_delivered(&message).await,
                    DeliveryState::Read => {
                        // A read implies delivery; apply any missed step first
                        self.apply_delivered(&message).await?;
                        self.apply_read(&message).await
                    }
                    DeliveryState::Failed => {
                        let reason =
                            reason.unwrap_or_else(|| "gateway reported failure".to_string());
                        self.messages.mark_failed(message.id, &reason).await?;
                        warn!(message = %message.id, %reason, "Gateway reported delivery failure");
                        Ok(())
                    }
                }
            }

            GatewayEvent::ConnectionStateChanged {
                account_id,
                state,
                reason,
                session_blob,
            } => match state {
                ConnectionState::Connected => {
                    self.connections.mark_connected(account_id, session_blob).await
                }
                ConnectionState::Disconnected => {
                    self.connections
                        .handle_gateway_disconnect(account_id, reason)
                        .await
                }
            },
        }
    }

    async fn apply_delivered(&self, message: &Message) -> Result<()> {
        if !self.messages.try_mark_delivered(message.id).await? {
            return Ok(());
        }

        if let Some(target_id) = message.campaign_target_id {
            // Campaign counters move only when the target row claims the
            // transition, so replays cannot double-count
            if self.targets.try_mark_delivered(target_id).await? {
                if let Some(target) = self.targets.get(target_id).await? {
                    self.campaigns.increment_delivered(target.campaign_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_read(&self, message: &Message) -> Result<()> {
        if !self.messages.try_mark_read(message.id).await? {
            return Ok(());
        }

        if let Some(target_id) = message.campaign_target_id {
            if self.targets.try_mark_read(target_id).await? {
                if let Some(target) = self.targets.get(target_id).await? {
                    self.campaigns.increment_read(target.campaign_id).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::TargetSpec;
    use crate::testutil::{test_harness, wait_until};
    use chatflow_common::types::MessageKind;
    use chatflow_storage::models::{CreateCampaign, CreateFlow, CreateFlowTrigger, TriggerKind};
    use chatflow_storage::repository::{AccountRepository, FlowRepository};
    use pretty_assertions::assert_eq;

    fn processor(harness: &crate::testutil::TestHarness) -> EventProcessor {
        EventProcessor::new(
            harness.conversations.clone(),
            harness.messages.clone(),
            harness.campaigns.clone(),
            harness.targets.clone(),
            harness.connections.clone(),
            harness.engine.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn receipts_advance_campaign_counters_once() {
        let harness = test_harness().await;
        let processor = processor(&harness);

        let campaign = harness
            .dispatcher
            .create_campaign(
                CreateCampaign {
                    account_id: harness.account_id,
                    name: "launch".to_string(),
                    message_template: "hi".to_string(),
                    kind: MessageKind::Text,
                    rate_limit_per_minute: Some(60),
                    typing_simulation: Some(false),
                    scheduled_at: None,
                },
                vec![TargetSpec {
                    address: "t1@c.gw".to_string(),
                    display_name: None,
                    attributes: None,
                }],
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

        let gateway_id = harness.client.last_gateway_message_id().unwrap();

        // Delivered receipt, replayed twice
        for _ in 0..2 {
            processor
                .handle_event(GatewayEvent::DeliveryStatusUpdate {
                    account_id: harness.account_id,
                    gateway_message_id: gateway_id.clone(),
                    status: DeliveryState::Delivered,
                    reason: None,
                })
                .await
                .unwrap();
        }

        let fresh = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.delivered_count, 1);
        assert_eq!(fresh.read_count, 0);

        // Read receipt
        processor
            .handle_event(GatewayEvent::DeliveryStatusUpdate {
                account_id: harness.account_id,
                gateway_message_id: gateway_id,
                status: DeliveryState::Read,
                reason: None,
            })
            .await
            .unwrap();

        let fresh = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.sent_count, 1);
        assert_eq!(fresh.delivered_count, 1);
        assert_eq!(fresh.read_count, 1);
        assert!(fresh.read_count <= fresh.delivered_count);
        assert!(fresh.delivered_count <= fresh.sent_count);
    }

    #[tokio::test(start_paused = true)]
    async fn read_receipt_without_delivered_still_orders_counters() {
        let harness = test_harness().await;
        let processor = processor(&harness);

        let campaign = harness
            .dispatcher
            .create_campaign(
                CreateCampaign {
                    account_id: harness.account_id,
                    name: "launch".to_string(),
                    message_template: "hi".to_string(),
                    kind: MessageKind::Text,
                    rate_limit_per_minute: Some(60),
                    typing_simulation: Some(false),
                    scheduled_at: None,
                },
                vec![TargetSpec {
                    address: "t1@c.gw".to_string(),
                    display_name: None,
                    attributes: None,
                }],
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

        // Gateway skipped the delivered receipt and reported read directly
        let gateway_id = harness.client.last_gateway_message_id().unwrap();
        processor
            .handle_event(GatewayEvent::DeliveryStatusUpdate {
                account_id: harness.account_id,
                gateway_message_id: gateway_id,
                status: DeliveryState::Read,
                reason: None,
            })
            .await
            .unwrap();

        let fresh = harness.campaigns.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.delivered_count, 1);
        assert_eq!(fresh.read_count, 1);
    }

    #[tokio::test]
    async fn inbound_message_bumps_unread_and_fires_keyword_trigger() {
        let harness = test_harness().await;
        let processor = processor(&harness);

        // Flow with a keyword EVENT trigger
        let flow = harness
            .flows
            .create_flow(CreateFlow {
                name: "pricing-autoreply".to_string(),
                description: None,
                is_active: Some(true),
            })
            .await
            .unwrap();
        harness
            .flows
            .add_step(chatflow_storage::models::CreateFlowStep {
                flow_id: flow.id,
                position: 0,
                name: "reply".to_string(),
                kind: chatflow_storage::models::FlowStepKind::SendMessage,
                config: serde_json::json!({"template": "Our pricing is attached"}),
            })
            .await
            .unwrap();
        harness
            .flows
            .add_trigger(CreateFlowTrigger {
                flow_id: flow.id,
                kind: TriggerKind::Event,
                config: serde_json::json!({"event": "message_received", "keyword": "pricing"}),
                is_active: Some(true),
            })
            .await
            .unwrap();

        processor
            .handle_event(GatewayEvent::MessageReceived {
                account_id: harness.account_id,
                remote_address: "newlead@c.gw".to_string(),
                contact_name: Some("New Lead".to_string()),
                content: "Could you share PRICING details?".to_string(),
                kind: MessageKind::Text,
                gateway_message_id: "in-1".to_string(),
            })
            .await
            .unwrap();

        let conversation = harness
            .conversations
            .find_by_remote(harness.account_id, "newlead@c.gw")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.unread_count, 1);

        // The keyword trigger sent the auto-reply
        assert_eq!(
            harness.client.sent_contents(),
            vec!["Our pricing is attached"]
        );
    }

    #[tokio::test]
    async fn gateway_drop_evicts_session() {
        let harness = test_harness().await;
        let processor = processor(&harness);

        assert!(harness.connections.active_session(harness.account_id).await.is_some());

        processor
            .handle_event(GatewayEvent::ConnectionStateChanged {
                account_id: harness.account_id,
                state: ConnectionState::Disconnected,
                reason: Some("phone offline".to_string()),
                session_blob: None,
            })
            .await
            .unwrap();

        assert!(harness.connections.active_session(harness.account_id).await.is_none());
        let account = harness.accounts.get(harness.account_id).await.unwrap().unwrap();
        assert_eq!(account.status, "disconnected");
        assert_eq!(account.status_reason.as_deref(), Some("phone offline"));
    }
}
