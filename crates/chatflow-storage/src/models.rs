//! Database models

use chatflow_common::types::{
    AccountId, CampaignId, ConversationId, ExecutionId, FlowId, FlowStepId, MessageId, TargetId,
    TriggerId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Accounts
// ============================================================================

/// Account connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Connecting => write!(f, "connecting"),
            AccountStatus::Connected => write!(f, "connected"),
            AccountStatus::Disconnected => write!(f, "disconnected"),
            AccountStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(AccountStatus::Connecting),
            "connected" => Ok(AccountStatus::Connected),
            "disconnected" => Ok(AccountStatus::Disconnected),
            "error" => Ok(AccountStatus::Error),
            _ => Err(format!("Invalid account status: {}", s)),
        }
    }
}

/// How an account authenticates against the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Interactive pairing: the gateway returns a pairing artifact to scan
    QrPairing,
    /// Token-based: connects immediately with a stored credential
    Token,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::QrPairing => write!(f, "qr_pairing"),
            AuthMode::Token => write!(f, "token"),
        }
    }
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qr_pairing" => Ok(AuthMode::QrPairing),
            "token" => Ok(AuthMode::Token),
            _ => Err(format!("Invalid auth mode: {}", s)),
        }
    }
}

/// Account model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub label: String,
    pub auth_mode: String,
    pub auth_token: Option<String>,
    pub status: String,
    pub status_reason: Option<String>,
    /// Transient pairing artifact, cleared on connect/disconnect
    pub pairing_code: Option<String>,
    /// Opaque session state from the gateway, cleared on disconnect
    pub session_blob: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Get status enum
    pub fn status_enum(&self) -> Option<AccountStatus> {
        self.status.parse().ok()
    }

    /// Get auth mode enum
    pub fn auth_mode_enum(&self) -> Option<AuthMode> {
        self.auth_mode.parse().ok()
    }
}

/// Create account input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub label: String,
    pub auth_mode: AuthMode,
    pub auth_token: Option<String>,
}

// ============================================================================
// Conversations
// ============================================================================

/// Conversation model - one recipient thread scoped to an account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub account_id: AccountId,
    pub remote_address: String,
    pub contact_name: Option<String>,
    pub unread_count: i32,
    /// Contact/lead fields used for templating and conditions
    pub attributes: serde_json::Value,
    pub tags: serde_json::Value,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Get tags as a vector
    pub fn tags_vec(&self) -> Vec<String> {
        serde_json::from_value(self.tags.clone()).unwrap_or_default()
    }
}

/// Create conversation input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversation {
    pub account_id: AccountId,
    pub remote_address: String,
    pub contact_name: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

// ============================================================================
// Messages
// ============================================================================

/// Message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Read => write!(f, "read"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// Message model - a single outbound/inbound unit
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
    pub direction: String,
    pub kind: String,
    pub content: String,
    pub status: String,
    /// Id assigned by the gateway on acknowledgment
    pub gateway_message_id: Option<String>,
    pub campaign_target_id: Option<TargetId>,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Get status enum
    pub fn status_enum(&self) -> Option<MessageStatus> {
        self.status.parse().ok()
    }
}

/// Create message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
    pub direction: chatflow_common::types::Direction,
    pub kind: chatflow_common::types::MessageKind,
    pub content: String,
    pub status: MessageStatus,
    pub gateway_message_id: Option<String>,
    pub campaign_target_id: Option<TargetId>,
}

// ============================================================================
// Flows
// ============================================================================

/// Flow model - a reusable multi-step automation definition
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create flow input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlow {
    pub name: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// Flow step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStepKind {
    SendMessage,
    Delay,
    Condition,
    Action,
}

impl std::fmt::Display for FlowStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStepKind::SendMessage => write!(f, "send_message"),
            FlowStepKind::Delay => write!(f, "delay"),
            FlowStepKind::Condition => write!(f, "condition"),
            FlowStepKind::Action => write!(f, "action"),
        }
    }
}

impl std::str::FromStr for FlowStepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(FlowStepKind::SendMessage),
            "delay" => Ok(FlowStepKind::Delay),
            "condition" => Ok(FlowStepKind::Condition),
            "action" => Ok(FlowStepKind::Action),
            _ => Err(format!("Invalid flow step kind: {}", s)),
        }
    }
}

/// Flow step model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: FlowStepId,
    pub flow_id: FlowId,
    /// Zero-based order within the flow
    pub position: i32,
    pub name: String,
    pub kind: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl FlowStep {
    /// Get kind enum
    pub fn kind_enum(&self) -> Option<FlowStepKind> {
        self.kind.parse().ok()
    }
}

/// Create flow step input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlowStep {
    pub flow_id: FlowId,
    pub position: i32,
    pub name: String,
    pub kind: FlowStepKind,
    pub config: serde_json::Value,
}

/// Flow trigger kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Schedule,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Event => write!(f, "event"),
            TriggerKind::Schedule => write!(f, "schedule"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(TriggerKind::Event),
            "schedule" => Ok(TriggerKind::Schedule),
            _ => Err(format!("Invalid trigger kind: {}", s)),
        }
    }
}

/// Flow trigger model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FlowTrigger {
    pub id: TriggerId,
    pub flow_id: FlowId,
    pub kind: String,
    pub config: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowTrigger {
    /// Get kind enum
    pub fn kind_enum(&self) -> Option<TriggerKind> {
        self.kind.parse().ok()
    }
}

/// Create flow trigger input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlowTrigger {
    pub flow_id: FlowId,
    pub kind: TriggerKind,
    pub config: serde_json::Value,
    pub is_active: Option<bool>,
}

// ============================================================================
// Flow executions
// ============================================================================

/// Flow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl ExecutionStatus {
    /// Terminal states cannot transition further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Stopped | ExecutionStatus::Error
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Stopped => write!(f, "stopped"),
            ExecutionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "stopped" => Ok(ExecutionStatus::Stopped),
            "error" => Ok(ExecutionStatus::Error),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Flow execution model - one running instance of a flow
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
    /// Durable cursor, monotonic except on explicit stop
    pub current_step: i32,
    pub status: String,
    /// When to resume a suspended delay; survives restarts
    pub resume_at: Option<DateTime<Utc>>,
    pub delay_started_at: Option<DateTime<Utc>>,
    pub delay_minutes: Option<i64>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowExecution {
    /// Get status enum
    pub fn status_enum(&self) -> Option<ExecutionStatus> {
        self.status.parse().ok()
    }
}

/// Create flow execution input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecution {
    pub flow_id: FlowId,
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
}

// ============================================================================
// Campaigns
// ============================================================================

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Scheduled,
    Sending,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Terminal states cannot transition further
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Sending => write!(f, "sending"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign model - a bulk-send job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub account_id: AccountId,
    pub name: String,
    pub message_template: String,
    pub kind: String,
    pub rate_limit_per_minute: i32,
    pub typing_simulation: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: String,
    pub status_reason: Option<String>,
    pub target_count: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.target_count == 0 {
            0.0
        } else {
            ((self.sent_count + self.failed_count) as f64 / self.target_count as f64) * 100.0
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub account_id: AccountId,
    pub name: String,
    pub message_template: String,
    pub kind: chatflow_common::types::MessageKind,
    pub rate_limit_per_minute: Option<i32>,
    pub typing_simulation: Option<bool>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Campaign targets
// ============================================================================

/// Campaign target status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetStatus::Pending => write!(f, "pending"),
            TargetStatus::Sending => write!(f, "sending"),
            TargetStatus::Sent => write!(f, "sent"),
            TargetStatus::Delivered => write!(f, "delivered"),
            TargetStatus::Read => write!(f, "read"),
            TargetStatus::Failed => write!(f, "failed"),
            TargetStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetStatus::Pending),
            "sending" => Ok(TargetStatus::Sending),
            "sent" => Ok(TargetStatus::Sent),
            "delivered" => Ok(TargetStatus::Delivered),
            "read" => Ok(TargetStatus::Read),
            "failed" => Ok(TargetStatus::Failed),
            "cancelled" => Ok(TargetStatus::Cancelled),
            _ => Err(format!("Invalid target status: {}", s)),
        }
    }
}

/// Campaign target model - per-recipient delivery state
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignTarget {
    pub id: TargetId,
    pub campaign_id: CampaignId,
    pub address: String,
    pub display_name: Option<String>,
    /// Per-target fields for personalization
    pub attributes: serde_json::Value,
    pub status: String,
    pub message_id: Option<MessageId>,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignTarget {
    /// Get status enum
    pub fn status_enum(&self) -> Option<TargetStatus> {
        self.status.parse().ok()
    }
}

/// Create campaign target input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignTarget {
    pub campaign_id: CampaignId,
    pub address: String,
    pub display_name: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips() {
        assert_eq!(
            "connected".parse::<AccountStatus>().unwrap(),
            AccountStatus::Connected
        );
        assert_eq!(ExecutionStatus::Paused.to_string(), "paused");
        assert_eq!(
            "delivered".parse::<TargetStatus>().unwrap(),
            TargetStatus::Delivered
        );
        assert!("bogus".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn test_execution_terminal() {
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_campaign_progress() {
        let mut campaign = Campaign {
            id: uuid::Uuid::new_v4(),
            account_id: uuid::Uuid::new_v4(),
            name: "launch".to_string(),
            message_template: "hi".to_string(),
            kind: "text".to_string(),
            rate_limit_per_minute: 60,
            typing_simulation: false,
            scheduled_at: None,
            status: "sending".to_string(),
            status_reason: None,
            target_count: 4,
            sent_count: 2,
            delivered_count: 1,
            read_count: 0,
            failed_count: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(campaign.progress_percentage(), 75.0);
        campaign.target_count = 0;
        assert_eq!(campaign.progress_percentage(), 0.0);
    }
}
