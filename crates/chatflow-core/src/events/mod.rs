//! Inbound event feed - gateway events and their processing

mod processor;
pub mod signature;

pub use processor::EventProcessor;

use chatflow_common::types::{AccountId, MessageKind};
use serde::{Deserialize, Serialize};

/// Delivery state reported by a gateway receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Delivered,
    Read,
    Failed,
}

/// Connection state reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Event delivered by the gateway's inbound feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// An inbound message arrived
    MessageReceived {
        account_id: AccountId,
        remote_address: String,
        contact_name: Option<String>,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        gateway_message_id: String,
    },
    /// Echo of an outbound message (possibly sent from another device)
    MessageSent {
        account_id: AccountId,
        remote_address: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        gateway_message_id: String,
    },
    /// Delivery receipt for an earlier outbound message
    DeliveryStatusUpdate {
        account_id: AccountId,
        gateway_message_id: String,
        status: DeliveryState,
        reason: Option<String>,
    },
    /// The gateway session changed state
    ConnectionStateChanged {
        account_id: AccountId,
        state: ConnectionState,
        reason: Option<String>,
        session_blob: Option<String>,
    },
}
