//! Repository layer for data access

pub mod accounts;
pub mod campaigns;
pub mod conversations;
pub mod executions;
pub mod flows;
pub mod messages;
pub mod targets;

pub use accounts::{AccountRepository, DbAccountRepository};
pub use campaigns::{CampaignRepository, DbCampaignRepository};
pub use conversations::{ConversationRepository, DbConversationRepository};
pub use executions::{DbExecutionRepository, ExecutionRepository};
pub use flows::{DbFlowRepository, FlowRepository};
pub use messages::{DbMessageRepository, MessageRepository};
pub use targets::{DbTargetRepository, TargetRepository};
