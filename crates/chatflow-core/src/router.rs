//! Routes fired scheduler jobs to the components that handle them

use crate::campaign::CampaignDispatcher;
use crate::flow::FlowEngine;
use crate::scheduler::JobHandler;
use async_trait::async_trait;
use chatflow_common::types::{CampaignId, ExecutionId, TriggerId};
use chatflow_common::Result;
use std::sync::Arc;

/// Dispatch target wiring the scheduler to the flow engine and campaign
/// dispatcher
pub struct JobRouter {
    engine: Arc<FlowEngine>,
    campaigns: Arc<CampaignDispatcher>,
}

impl JobRouter {
    /// Create a new job router
    pub fn new(engine: Arc<FlowEngine>, campaigns: Arc<CampaignDispatcher>) -> Self {
        Self { engine, campaigns }
    }
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn fire_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        self.engine.fire_trigger(trigger_id).await
    }

    async fn start_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.campaigns.start_campaign(campaign_id).await
    }

    async fn resume_execution(&self, execution_id: ExecutionId) -> Result<()> {
        self.engine.handle_resume_due(execution_id).await
    }
}
