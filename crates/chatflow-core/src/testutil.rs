//! In-memory fakes for component tests
//!
//! The repository fakes mirror the guarded-transition semantics of the
//! database layer (conditional status moves, monotonic cursors) so the
//! components under test see the same contract in memory as against
//! Postgres.

use crate::campaign::CampaignDispatcher;
use crate::connection::{ConnectOutcome, ConnectionManager, GatewayClient, SendReceipt};
use crate::flow::FlowEngine;
use crate::scheduler::{JobHandler, JobScheduler};
use async_trait::async_trait;
use chatflow_common::config::{CampaignConfig, FlowConfig, GatewayConfig};
use chatflow_common::types::{
    AccountId, CampaignId, ConversationId, ExecutionId, FlowId, MessageId, MessageKind, TargetId,
    TriggerId,
};
use chatflow_common::{Error, Result};
use chatflow_storage::models::*;
use chatflow_storage::repository::{
    AccountRepository, CampaignRepository, ConversationRepository, ExecutionRepository,
    FlowRepository, MessageRepository, TargetRepository,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Poll a condition under (possibly paused) tokio time until it holds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..20_000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within the polling budget");
}

// ============================================================================
// Mock gateway client
// ============================================================================

enum ConnectMode {
    Pairing(String),
    Token(Option<String>),
    Fail(String),
}

/// Scriptable gateway client
pub struct MockGatewayClient {
    connect_mode: Mutex<ConnectMode>,
    connect_delay: Mutex<Duration>,
    connect_calls: AtomicUsize,
    send_calls: AtomicUsize,
    /// Remaining forced failures per recipient address
    fail_sends: Mutex<HashMap<String, usize>>,
    sent: Mutex<Vec<(String, String)>>,
    last_message_id: Mutex<Option<String>>,
    next_id: AtomicUsize,
}

impl MockGatewayClient {
    pub fn new() -> Self {
        Self {
            connect_mode: Mutex::new(ConnectMode::Token(None)),
            connect_delay: Mutex::new(Duration::ZERO),
            connect_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            fail_sends: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            last_message_id: Mutex::new(None),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn set_pairing_code(&self, code: &str) {
        *self.connect_mode.lock().unwrap() = ConnectMode::Pairing(code.to_string());
    }

    pub fn set_token_session(&self, blob: Option<String>) {
        *self.connect_mode.lock().unwrap() = ConnectMode::Token(blob);
    }

    pub fn fail_connect(&self, reason: &str) {
        *self.connect_mode.lock().unwrap() = ConnectMode::Fail(reason.to_string());
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// The next `count` sends to `address` fail
    pub fn fail_sends_to(&self, address: &str, count: usize) {
        self.fail_sends
            .lock()
            .unwrap()
            .insert(address.to_string(), count);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn last_gateway_message_id(&self) -> Option<String> {
        self.last_message_id.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayClient for MockGatewayClient {
    async fn connect(&self, _account: &Account) -> Result<ConnectOutcome> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mode = self.connect_mode.lock().unwrap();
        match &*mode {
            ConnectMode::Pairing(code) => Ok(ConnectOutcome::PairingRequired {
                pairing_code: code.clone(),
            }),
            ConnectMode::Token(blob) => Ok(ConnectOutcome::Connected {
                session_blob: blob.clone(),
            }),
            ConnectMode::Fail(reason) => Err(Error::Connection(reason.clone())),
        }
    }

    async fn send(
        &self,
        _account_id: AccountId,
        to: &str,
        content: &str,
        _kind: MessageKind,
    ) -> Result<SendReceipt> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.fail_sends.lock().unwrap();
            if let Some(remaining) = failures.get_mut(to) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::SendFailure("simulated gateway rejection".to_string()));
                }
            }
        }

        let id = format!("g-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), content.to_string()));
        *self.last_message_id.lock().unwrap() = Some(id.clone());
        Ok(SendReceipt {
            gateway_message_id: id,
        })
    }

    async fn list_chats(&self, _account_id: AccountId) -> Result<Vec<crate::connection::ChatSummary>> {
        Ok(Vec::new())
    }

    async fn profile_picture(
        &self,
        _account_id: AccountId,
        _remote: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn disconnect(&self, _account_id: AccountId) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Repository fakes
// ============================================================================

pub struct MemoryAccountRepository {
    rows: Mutex<HashMap<AccountId, Account>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn create(&self, input: CreateAccount) -> Result<Account> {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            label: input.label,
            auth_mode: input.auth_mode.to_string(),
            auth_token: input.auth_token,
            status: "disconnected".to_string(),
            status_reason: None,
            pairing_code: None,
            session_blob: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().insert(account.id, account.clone());
        Ok(account)
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Account>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.status == status.to_string())
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        reason: Option<String>,
    ) -> Result<()> {
        if let Some(account) = self.rows.lock().unwrap().get_mut(&id) {
            account.status = status.to_string();
            account.status_reason = reason;
            account.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_pairing_code(&self, id: AccountId, code: Option<String>) -> Result<()> {
        if let Some(account) = self.rows.lock().unwrap().get_mut(&id) {
            account.pairing_code = code;
        }
        Ok(())
    }

    async fn set_session_blob(&self, id: AccountId, blob: Option<String>) -> Result<()> {
        if let Some(account) = self.rows.lock().unwrap().get_mut(&id) {
            account.session_blob = blob;
        }
        Ok(())
    }

    async fn clear_transients(&self, id: AccountId) -> Result<()> {
        if let Some(account) = self.rows.lock().unwrap().get_mut(&id) {
            account.pairing_code = None;
            account.session_blob = None;
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, id: AccountId) -> Result<()> {
        if let Some(account) = self.rows.lock().unwrap().get_mut(&id) {
            account.last_heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }
}

pub struct MemoryConversationRepository {
    rows: Mutex<HashMap<ConversationId, Conversation>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn build(input: CreateConversation) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            remote_address: input.remote_address,
            contact_name: input.contact_name,
            unread_count: 0,
            attributes: input.attributes.unwrap_or_else(|| serde_json::json!({})),
            tags: serde_json::json!([]),
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn create(&self, input: CreateConversation) -> Result<Conversation> {
        let conversation = Self::build(input);
        self.rows
            .lock()
            .unwrap()
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_remote(
        &self,
        account_id: AccountId,
        remote_address: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|c| c.account_id == account_id && c.remote_address == remote_address)
            .cloned())
    }

    async fn upsert_remote(&self, input: CreateConversation) -> Result<Conversation> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .values_mut()
            .find(|c| c.account_id == input.account_id && c.remote_address == input.remote_address)
        {
            if existing.contact_name.is_none() {
                existing.contact_name = input.contact_name;
            }
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let conversation = Self::build(input);
        rows.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn increment_unread(&self, id: ConversationId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.unread_count += 1;
            c.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_read(&self, id: ConversationId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.unread_count = 0;
        }
        Ok(())
    }

    async fn set_attribute(
        &self,
        id: ConversationId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            if let Some(map) = c.attributes.as_object_mut() {
                map.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    async fn add_tag(&self, id: ConversationId, tag: &str) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            if let Some(tags) = c.tags.as_array_mut() {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(serde_json::json!(tag));
                }
            }
        }
        Ok(())
    }

    async fn remove_tag(&self, id: ConversationId, tag: &str) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            if let Some(tags) = c.tags.as_array_mut() {
                tags.retain(|t| t != tag);
            }
        }
        Ok(())
    }

    async fn touch_activity(&self, id: ConversationId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.last_activity_at = Utc::now();
        }
        Ok(())
    }
}

pub struct MemoryMessageRepository {
    rows: Mutex<HashMap<MessageId, Message>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            conversation_id: input.conversation_id,
            direction: input.direction.to_string(),
            kind: input.kind.to_string(),
            content: input.content,
            status: input.status.to_string(),
            gateway_message_id: input.gateway_message_id,
            campaign_target_id: input.campaign_target_id,
            error: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_gateway_id(
        &self,
        account_id: AccountId,
        gateway_message_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|m| {
                m.account_id == account_id
                    && m.gateway_message_id.as_deref() == Some(gateway_message_id)
            })
            .cloned())
    }

    async fn mark_sent(&self, id: MessageId, gateway_message_id: &str) -> Result<()> {
        if let Some(m) = self.rows.lock().unwrap().get_mut(&id) {
            m.status = "sent".to_string();
            m.gateway_message_id = Some(gateway_message_id.to_string());
            m.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<()> {
        if let Some(m) = self.rows.lock().unwrap().get_mut(&id) {
            m.status = "failed".to_string();
            m.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn try_mark_delivered(&self, id: MessageId) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(m) if m.status == "sent" => {
                m.status = "delivered".to_string();
                m.delivered_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_mark_read(&self, id: MessageId) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(m) if m.status == "delivered" => {
                m.status = "read".to_string();
                m.read_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct MemoryFlowRepository {
    flows: Mutex<HashMap<FlowId, Flow>>,
    steps: Mutex<Vec<FlowStep>>,
    triggers: Mutex<HashMap<TriggerId, FlowTrigger>>,
}

impl MemoryFlowRepository {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            steps: Mutex::new(Vec::new()),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    fn list_active(&self, kind: TriggerKind) -> Vec<FlowTrigger> {
        let flows = self.flows.lock().unwrap();
        self.triggers
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                t.kind == kind.to_string()
                    && t.is_active
                    && flows.get(&t.flow_id).map(|f| f.is_active).unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn create_flow(&self, input: CreateFlow) -> Result<Flow> {
        let now = Utc::now();
        let flow = Flow {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            is_active: input.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        self.flows.lock().unwrap().insert(flow.id, flow.clone());
        Ok(flow)
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>> {
        Ok(self.flows.lock().unwrap().get(&id).cloned())
    }

    async fn set_flow_active(&self, id: FlowId, active: bool) -> Result<()> {
        if let Some(f) = self.flows.lock().unwrap().get_mut(&id) {
            f.is_active = active;
        }
        Ok(())
    }

    async fn add_step(&self, input: CreateFlowStep) -> Result<FlowStep> {
        let step = FlowStep {
            id: Uuid::new_v4(),
            flow_id: input.flow_id,
            position: input.position,
            name: input.name,
            kind: input.kind.to_string(),
            config: input.config,
            created_at: Utc::now(),
        };
        self.steps.lock().unwrap().push(step.clone());
        Ok(step)
    }

    async fn list_steps(&self, flow_id: FlowId) -> Result<Vec<FlowStep>> {
        let mut steps: Vec<FlowStep> = self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.flow_id == flow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn add_trigger(&self, input: CreateFlowTrigger) -> Result<FlowTrigger> {
        let now = Utc::now();
        let trigger = FlowTrigger {
            id: Uuid::new_v4(),
            flow_id: input.flow_id,
            kind: input.kind.to_string(),
            config: input.config,
            is_active: input.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        self.triggers
            .lock()
            .unwrap()
            .insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<FlowTrigger>> {
        Ok(self.triggers.lock().unwrap().get(&id).cloned())
    }

    async fn set_trigger_active(&self, id: TriggerId, active: bool) -> Result<()> {
        if let Some(t) = self.triggers.lock().unwrap().get_mut(&id) {
            t.is_active = active;
        }
        Ok(())
    }

    async fn list_active_schedule_triggers(&self) -> Result<Vec<FlowTrigger>> {
        Ok(self.list_active(TriggerKind::Schedule))
    }

    async fn list_active_event_triggers(&self) -> Result<Vec<FlowTrigger>> {
        Ok(self.list_active(TriggerKind::Event))
    }
}

pub struct MemoryExecutionRepository {
    rows: Mutex<HashMap<ExecutionId, FlowExecution>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Mutate a stored row directly, for shaping test scenarios
    pub async fn tweak(&self, id: ExecutionId, f: impl FnOnce(&mut FlowExecution)) {
        if let Some(execution) = self.rows.lock().unwrap().get_mut(&id) {
            f(execution);
        }
    }

    fn is_active(status: &str) -> bool {
        matches!(status, "pending" | "running" | "paused")
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create_unique(&self, input: CreateExecution) -> Result<Option<FlowExecution>> {
        let mut rows = self.rows.lock().unwrap();
        let conflict = rows.values().any(|e| {
            e.flow_id == input.flow_id
                && e.conversation_id == input.conversation_id
                && Self::is_active(&e.status)
        });
        if conflict {
            return Ok(None);
        }

        let now = Utc::now();
        let execution = FlowExecution {
            id: Uuid::new_v4(),
            flow_id: input.flow_id,
            account_id: input.account_id,
            conversation_id: input.conversation_id,
            current_step: 0,
            status: "pending".to_string(),
            resume_at: None,
            delay_started_at: None,
            delay_minutes: None,
            last_error: None,
            started_at: now,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(execution.id, execution.clone());
        Ok(Some(execution))
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<FlowExecution>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn find_active(
        &self,
        flow_id: FlowId,
        conversation_id: ConversationId,
    ) -> Result<Option<FlowExecution>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|e| {
                e.flow_id == flow_id
                    && e.conversation_id == conversation_id
                    && Self::is_active(&e.status)
            })
            .cloned())
    }

    async fn try_set_status(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(execution) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if !from.iter().any(|s| s.to_string() == execution.status) {
            return Ok(false);
        }
        execution.status = to.to_string();
        if error.is_some() {
            execution.last_error = error;
        }
        if to.is_terminal() {
            execution.finished_at = Some(Utc::now());
        }
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn advance_step(&self, id: ExecutionId, step: i32) -> Result<()> {
        if let Some(execution) = self.rows.lock().unwrap().get_mut(&id) {
            if execution.current_step <= step {
                execution.current_step = step;
            }
        }
        Ok(())
    }

    async fn set_delay(
        &self,
        id: ExecutionId,
        resume_at: DateTime<Utc>,
        delay_started_at: DateTime<Utc>,
        delay_minutes: i64,
    ) -> Result<()> {
        if let Some(execution) = self.rows.lock().unwrap().get_mut(&id) {
            execution.resume_at = Some(resume_at);
            execution.delay_started_at = Some(delay_started_at);
            execution.delay_minutes = Some(delay_minutes);
        }
        Ok(())
    }

    async fn clear_delay(&self, id: ExecutionId) -> Result<()> {
        if let Some(execution) = self.rows.lock().unwrap().get_mut(&id) {
            execution.resume_at = None;
            execution.delay_started_at = None;
            execution.delay_minutes = None;
        }
        Ok(())
    }

    async fn list_suspended(&self) -> Result<Vec<FlowExecution>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.resume_at.is_some() && matches!(e.status.as_str(), "running" | "paused"))
            .cloned()
            .collect())
    }

    async fn list_orphaned_running(&self) -> Result<Vec<FlowExecution>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == "running" && e.resume_at.is_none())
            .cloned()
            .collect())
    }
}

pub struct MemoryCampaignRepository {
    rows: Mutex<HashMap<CampaignId, Campaign>>,
}

impl MemoryCampaignRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CampaignRepository for MemoryCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            name: input.name,
            message_template: input.message_template,
            kind: input.kind.to_string(),
            rate_limit_per_minute: input.rate_limit_per_minute.unwrap_or(20),
            typing_simulation: input.typing_simulation.unwrap_or(false),
            scheduled_at: input.scheduled_at,
            status: "scheduled".to_string(),
            status_reason: None,
            target_count: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.rows.lock().unwrap().insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.status == status.to_string())
            .cloned()
            .collect())
    }

    async fn try_set_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(campaign) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if !from.iter().any(|s| s.to_string() == campaign.status) {
            return Ok(false);
        }
        campaign.status = to.to_string();
        campaign.status_reason = reason;
        if to == CampaignStatus::Sending && campaign.started_at.is_none() {
            campaign.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            campaign.completed_at = Some(Utc::now());
        }
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_target_count(&self, id: CampaignId, count: i32) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.target_count = count;
        }
        Ok(())
    }

    async fn increment_sent(&self, id: CampaignId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.sent_count += 1;
        }
        Ok(())
    }

    async fn increment_failed(&self, id: CampaignId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.failed_count += 1;
        }
        Ok(())
    }

    async fn increment_delivered(&self, id: CampaignId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.delivered_count += 1;
        }
        Ok(())
    }

    async fn increment_read(&self, id: CampaignId) -> Result<()> {
        if let Some(c) = self.rows.lock().unwrap().get_mut(&id) {
            c.read_count += 1;
        }
        Ok(())
    }
}

pub struct MemoryTargetRepository {
    rows: Mutex<Vec<CampaignTarget>>,
}

impl MemoryTargetRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TargetRepository for MemoryTargetRepository {
    async fn create_batch(&self, targets: Vec<CreateCampaignTarget>) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let count = targets.len() as u64;
        let now = Utc::now();
        for input in targets {
            rows.push(CampaignTarget {
                id: Uuid::new_v4(),
                campaign_id: input.campaign_id,
                address: input.address,
                display_name: input.display_name,
                attributes: input.attributes.unwrap_or_else(|| serde_json::json!({})),
                status: "pending".to_string(),
                message_id: None,
                error: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(count)
    }

    async fn get(&self, id: TargetId) -> Result<Option<CampaignTarget>> {
        Ok(self.rows.lock().unwrap().iter().find(|t| t.id == id).cloned())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignTarget>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn claim_next_pending(&self, campaign_id: CampaignId) -> Result<Option<CampaignTarget>> {
        let mut rows = self.rows.lock().unwrap();
        // Insertion order stands in for created_at ordering
        let target = rows
            .iter_mut()
            .find(|t| t.campaign_id == campaign_id && t.status == "pending");
        match target {
            Some(t) => {
                t.status = "sending".to_string();
                Ok(Some(t.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release_to_pending(&self, id: TargetId) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(t) = rows.iter_mut().find(|t| t.id == id) {
            if t.status == "sending" {
                t.status = "pending".to_string();
            }
        }
        Ok(())
    }

    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut released = 0u64;
        for t in rows
            .iter_mut()
            .filter(|t| t.campaign_id == campaign_id && t.status == "sending")
        {
            t.status = "pending".to_string();
            released += 1;
        }
        Ok(released)
    }

    async fn mark_sent(&self, id: TargetId, message_id: MessageId) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(t) = rows.iter_mut().find(|t| t.id == id) {
            t.status = "sent".to_string();
            t.message_id = Some(message_id);
            t.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: TargetId, error: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(t) = rows.iter_mut().find(|t| t.id == id) {
            t.status = "failed".to_string();
            t.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn try_mark_delivered(&self, id: TargetId) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|t| t.id == id) {
            Some(t) if t.status == "sent" => {
                t.status = "delivered".to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_mark_read(&self, id: TargetId) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|t| t.id == id) {
            Some(t) if t.status == "delivered" => {
                t.status = "read".to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut cancelled = 0u64;
        for t in rows
            .iter_mut()
            .filter(|t| t.campaign_id == campaign_id && t.status == "pending")
        {
            t.status = "cancelled".to_string();
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn count_by_status(&self, campaign_id: CampaignId, status: TargetStatus) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.campaign_id == campaign_id && t.status == status.to_string())
            .count() as i64)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// JobHandler that records firings, optionally failing every dispatch
pub struct RecordingHandler {
    triggers: Mutex<Vec<TriggerId>>,
    fail: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn fired_triggers(&self) -> Vec<TriggerId> {
        self.triggers.lock().unwrap().clone()
    }

    pub async fn wait_for_triggers(&self, count: usize) {
        wait_until(|| async { self.fired_triggers().len() >= count }).await;
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn fire_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        self.triggers.lock().unwrap().push(trigger_id);
        if self.fail {
            return Err(Error::Internal("simulated dispatch failure".to_string()));
        }
        Ok(())
    }

    async fn start_campaign(&self, _campaign_id: CampaignId) -> Result<()> {
        Ok(())
    }

    async fn resume_execution(&self, _execution_id: ExecutionId) -> Result<()> {
        Ok(())
    }
}

/// JobHandler routing straight into a flow engine (no campaigns)
pub struct EngineHandler(pub Arc<FlowEngine>);

#[async_trait]
impl JobHandler for EngineHandler {
    async fn fire_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        self.0.fire_trigger(trigger_id).await
    }

    async fn start_campaign(&self, _campaign_id: CampaignId) -> Result<()> {
        Ok(())
    }

    async fn resume_execution(&self, execution_id: ExecutionId) -> Result<()> {
        self.0.handle_resume_due(execution_id).await
    }
}

// ============================================================================
// Full harness
// ============================================================================

/// All core components wired over in-memory fakes, with one connected
/// token-mode account and one conversation
pub struct TestHarness {
    pub accounts: Arc<MemoryAccountRepository>,
    pub conversations: Arc<MemoryConversationRepository>,
    pub messages: Arc<MemoryMessageRepository>,
    pub flows: Arc<MemoryFlowRepository>,
    pub executions: Arc<MemoryExecutionRepository>,
    pub campaigns: Arc<MemoryCampaignRepository>,
    pub targets: Arc<MemoryTargetRepository>,
    pub client: Arc<MockGatewayClient>,
    pub connections: Arc<ConnectionManager>,
    pub scheduler: Arc<JobScheduler>,
    pub engine: Arc<FlowEngine>,
    pub dispatcher: Arc<CampaignDispatcher>,
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
    pub remote_address: String,
}

pub async fn test_harness() -> TestHarness {
    let accounts = Arc::new(MemoryAccountRepository::new());
    let conversations = Arc::new(MemoryConversationRepository::new());
    let messages = Arc::new(MemoryMessageRepository::new());
    let flows = Arc::new(MemoryFlowRepository::new());
    let executions = Arc::new(MemoryExecutionRepository::new());
    let campaigns = Arc::new(MemoryCampaignRepository::new());
    let targets = Arc::new(MemoryTargetRepository::new());
    let client = Arc::new(MockGatewayClient::new());

    let gateway_config = GatewayConfig {
        send_attempts: 3,
        send_backoff_base_ms: 5,
        send_timeout_secs: 5,
        ..GatewayConfig::default()
    };

    let connections = Arc::new(ConnectionManager::new(
        client.clone(),
        accounts.clone(),
        gateway_config,
    ));
    let scheduler = Arc::new(JobScheduler::new(
        flows.clone(),
        campaigns.clone(),
        executions.clone(),
    ));
    let engine = Arc::new(FlowEngine::new(
        flows.clone(),
        executions.clone(),
        conversations.clone(),
        messages.clone(),
        connections.clone(),
        scheduler.clone(),
        FlowConfig::default(),
    ));
    let dispatcher = Arc::new(CampaignDispatcher::new(
        campaigns.clone(),
        targets.clone(),
        conversations.clone(),
        messages.clone(),
        connections.clone(),
        scheduler.clone(),
        CampaignConfig::default(),
    ));

    let account = accounts
        .create(CreateAccount {
            label: "main".to_string(),
            auth_mode: AuthMode::Token,
            auth_token: Some("token".to_string()),
        })
        .await
        .unwrap();
    connections.connect(account.id).await.unwrap();

    let remote_address = "lead@c.gw".to_string();
    let conversation = conversations
        .create(CreateConversation {
            account_id: account.id,
            remote_address: remote_address.clone(),
            contact_name: Some("Dana".to_string()),
            attributes: None,
        })
        .await
        .unwrap();

    TestHarness {
        accounts,
        conversations,
        messages,
        flows,
        executions,
        campaigns,
        targets,
        client,
        connections,
        scheduler,
        engine,
        dispatcher,
        account_id: account.id,
        conversation_id: conversation.id,
        remote_address,
    }
}
