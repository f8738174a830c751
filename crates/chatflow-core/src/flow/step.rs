//! Step configuration types, deserialized from `flow_steps.config`

use chatflow_common::types::MessageKind;
use chatflow_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Config of a SEND_MESSAGE step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageConfig {
    /// Template with `{{variable}}` placeholders
    pub template: String,
    #[serde(default)]
    pub kind: MessageKind,
}

/// Config of a DELAY step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    pub delay_minutes: i64,
}

/// Comparison operator in a condition clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Contains,
    Exists,
    Gt,
    Lt,
}

/// One clause of a CONDITION step; the first matching clause wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionClause {
    /// Field path: `contact_name`, `remote_address`, `unread_count`,
    /// `tags`, or `attributes.<key>`
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Name of the step to branch to
    pub goto_step: String,
}

/// Config of a CONDITION step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub clauses: Vec<ConditionClause>,
}

/// Config of an ACTION step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    AddTag { tag: String },
    RemoveTag { tag: String },
    SetAttribute { key: String, value: serde_json::Value },
    MarkRead,
}

/// Parse a step config, mapping serde failures to validation errors
pub fn parse_config<T: serde::de::DeserializeOwned>(
    step_name: &str,
    value: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Validation(format!("invalid config for step '{}': {}", step_name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_message_config() {
        let config: SendMessageConfig = parse_config(
            "greet",
            &serde_json::json!({"template": "Hi {{name}}"}),
        )
        .unwrap();
        assert_eq!(config.template, "Hi {{name}}");
        assert_eq!(config.kind, MessageKind::Text);
    }

    #[test]
    fn test_parse_action_config() {
        let config: ActionConfig = parse_config(
            "tag",
            &serde_json::json!({"action": "add_tag", "tag": "lead"}),
        )
        .unwrap();
        assert!(matches!(config, ActionConfig::AddTag { tag } if tag == "lead"));
    }

    #[test]
    fn test_parse_failure_names_the_step() {
        let err = parse_config::<DelayConfig>("wait", &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("wait"));
    }
}
