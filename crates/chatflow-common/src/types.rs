//! Common types for Chatflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for accounts
pub type AccountId = Uuid;

/// Unique identifier for conversations
pub type ConversationId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for flows
pub type FlowId = Uuid;

/// Unique identifier for flow steps
pub type FlowStepId = Uuid;

/// Unique identifier for flow triggers
pub type TriggerId = Uuid;

/// Unique identifier for flow executions
pub type ExecutionId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign targets
pub type TargetId = Uuid;

/// Chat address on the gateway, `user@server` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatAddress {
    pub user: String,
    pub server: String,
}

impl ChatAddress {
    /// Create a new chat address
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// Parse a chat address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for ChatAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl std::str::FromStr for ChatAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid chat address".to_string()))
    }
}

/// Message content kind on the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    Audio,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Image => write!(f, "image"),
            MessageKind::Document => write!(f, "document"),
            MessageKind::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "document" => Ok(MessageKind::Document),
            "audio" => Ok(MessageKind::Audio),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

/// Message direction relative to the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_address_parse() {
        let addr = ChatAddress::parse("15551230001@c.gw").unwrap();
        assert_eq!(addr.user, "15551230001");
        assert_eq!(addr.server, "c.gw");
        assert_eq!(addr.to_string(), "15551230001@c.gw");
    }

    #[test]
    fn test_chat_address_invalid() {
        assert!(ChatAddress::parse("invalid").is_none());
        assert!(ChatAddress::parse("@c.gw").is_none());
        assert!(ChatAddress::parse("15551230001@").is_none());
    }

    #[test]
    fn test_message_kind_roundtrip() {
        assert_eq!(MessageKind::Text.to_string(), "text");
        assert_eq!("image".parse::<MessageKind>().unwrap(), MessageKind::Image);
        assert!("video".parse::<MessageKind>().is_err());
    }
}
