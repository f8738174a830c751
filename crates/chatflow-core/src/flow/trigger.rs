//! Trigger configuration types

use crate::scheduler::Schedule;
use chatflow_common::types::{AccountId, ConversationId};
use chatflow_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Stored config of a SCHEDULE trigger: when to fire and which
/// (account, conversation) the execution binds to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTriggerConfig {
    pub schedule: Schedule,
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
}

impl ScheduleTriggerConfig {
    /// Parse from stored trigger config
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config: ScheduleTriggerConfig = serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("invalid schedule trigger config: {}", e)))?;
        // Surface schedule validation errors at registration, not at fire time
        config.schedule.validate()?;
        Ok(config)
    }
}

/// Feed events an EVENT trigger can react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// An inbound message arrived in a conversation
    MessageReceived,
    /// A conversation was seen for the first time
    ConversationOpened,
}

/// Stored config of an EVENT trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTriggerConfig {
    pub event: TriggerEvent,
    /// Optional keyword the inbound content must contain (case-insensitive)
    pub keyword: Option<String>,
}

impl EventTriggerConfig {
    /// Parse from stored trigger config
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("invalid event trigger config: {}", e)))
    }

    /// Whether this trigger reacts to the given event and content
    pub fn matches(&self, event: TriggerEvent, content: Option<&str>) -> bool {
        if self.event != event {
            return false;
        }
        match &self.keyword {
            None => true,
            Some(keyword) => content
                .map(|c| c.to_lowercase().contains(&keyword.to_lowercase()))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_trigger_keyword_match() {
        let config = EventTriggerConfig {
            event: TriggerEvent::MessageReceived,
            keyword: Some("Pricing".to_string()),
        };

        assert!(config.matches(TriggerEvent::MessageReceived, Some("what's your PRICING?")));
        assert!(!config.matches(TriggerEvent::MessageReceived, Some("hello")));
        assert!(!config.matches(TriggerEvent::MessageReceived, None));
        assert!(!config.matches(TriggerEvent::ConversationOpened, Some("pricing")));
    }

    #[test]
    fn test_event_trigger_without_keyword_matches_all() {
        let config = EventTriggerConfig {
            event: TriggerEvent::ConversationOpened,
            keyword: None,
        };
        assert!(config.matches(TriggerEvent::ConversationOpened, None));
    }

    #[test]
    fn test_schedule_trigger_config_rejects_garbage() {
        assert!(ScheduleTriggerConfig::from_value(&serde_json::json!({"nope": 1})).is_err());

        let ok = ScheduleTriggerConfig::from_value(&serde_json::json!({
            "schedule": {"type": "every", "minutes": 10},
            "account_id": uuid::Uuid::new_v4(),
            "conversation_id": uuid::Uuid::new_v4(),
        }));
        assert!(ok.is_ok());
    }
}
