//! Condition evaluation against conversation state

use super::step::{ConditionClause, ConditionConfig, ConditionOp};
use chatflow_storage::models::Conversation;

/// Evaluate a condition's clauses in order; returns the target step name
/// of the first matching clause, or None when nothing matches
pub fn evaluate<'a>(config: &'a ConditionConfig, conversation: &Conversation) -> Option<&'a str> {
    config
        .clauses
        .iter()
        .find(|clause| clause_matches(clause, conversation))
        .map(|clause| clause.goto_step.as_str())
}

fn clause_matches(clause: &ConditionClause, conversation: &Conversation) -> bool {
    let field = lookup_field(conversation, &clause.field);

    match clause.op {
        ConditionOp::Exists => field.is_some(),
        ConditionOp::Eq => match (&field, &clause.value) {
            (Some(actual), Some(expected)) => values_equal(actual, expected),
            _ => false,
        },
        ConditionOp::Ne => match (&field, &clause.value) {
            (Some(actual), Some(expected)) => !values_equal(actual, expected),
            (None, Some(_)) => true,
            _ => false,
        },
        ConditionOp::Contains => match (&field, &clause.value) {
            (Some(actual), Some(expected)) => contains(actual, expected),
            _ => false,
        },
        ConditionOp::Gt => compare(&field, &clause.value).map(|o| o.is_gt()).unwrap_or(false),
        ConditionOp::Lt => compare(&field, &clause.value).map(|o| o.is_lt()).unwrap_or(false),
    }
}

/// Resolve a field path against the conversation
fn lookup_field(conversation: &Conversation, field: &str) -> Option<serde_json::Value> {
    match field {
        "contact_name" => conversation
            .contact_name
            .clone()
            .map(serde_json::Value::String),
        "remote_address" => Some(serde_json::Value::String(
            conversation.remote_address.clone(),
        )),
        "unread_count" => Some(serde_json::json!(conversation.unread_count)),
        "tags" => Some(conversation.tags.clone()),
        _ => field
            .strip_prefix("attributes.")
            .and_then(|key| conversation.attributes.get(key).cloned()),
    }
}

fn values_equal(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    // String comparison is case-insensitive; everything else is structural
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => actual == expected,
    }
}

fn contains(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match actual {
        serde_json::Value::String(s) => expected
            .as_str()
            .map(|needle| s.to_lowercase().contains(&needle.to_lowercase()))
            .unwrap_or(false),
        serde_json::Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn compare(
    actual: &Option<serde_json::Value>,
    expected: &Option<serde_json::Value>,
) -> Option<std::cmp::Ordering> {
    let a = actual.as_ref()?.as_f64()?;
    let b = expected.as_ref()?.as_f64()?;
    a.partial_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn conversation() -> Conversation {
        Conversation {
            id: uuid::Uuid::new_v4(),
            account_id: uuid::Uuid::new_v4(),
            remote_address: "15551230001@c.gw".to_string(),
            contact_name: Some("Dana".to_string()),
            unread_count: 3,
            attributes: serde_json::json!({"plan": "premium", "score": 42}),
            tags: serde_json::json!(["lead", "warm"]),
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn clause(field: &str, op: ConditionOp, value: Option<serde_json::Value>) -> ConditionClause {
        ConditionClause {
            field: field.to_string(),
            op,
            value,
            goto_step: "target".to_string(),
        }
    }

    #[test]
    fn test_eq_is_case_insensitive_for_strings() {
        let config = ConditionConfig {
            clauses: vec![clause(
                "attributes.plan",
                ConditionOp::Eq,
                Some(serde_json::json!("PREMIUM")),
            )],
        };
        assert_eq!(evaluate(&config, &conversation()), Some("target"));
    }

    #[test]
    fn test_numeric_comparison() {
        let config = ConditionConfig {
            clauses: vec![clause(
                "unread_count",
                ConditionOp::Gt,
                Some(serde_json::json!(2)),
            )],
        };
        assert_eq!(evaluate(&config, &conversation()), Some("target"));

        let config = ConditionConfig {
            clauses: vec![clause(
                "attributes.score",
                ConditionOp::Lt,
                Some(serde_json::json!(42)),
            )],
        };
        assert_eq!(evaluate(&config, &conversation()), None);
    }

    #[test]
    fn test_tags_contains() {
        let config = ConditionConfig {
            clauses: vec![clause(
                "tags",
                ConditionOp::Contains,
                Some(serde_json::json!("warm")),
            )],
        };
        assert_eq!(evaluate(&config, &conversation()), Some("target"));
    }

    #[test]
    fn test_missing_attribute_and_exists() {
        let config = ConditionConfig {
            clauses: vec![clause("attributes.missing", ConditionOp::Exists, None)],
        };
        assert_eq!(evaluate(&config, &conversation()), None);

        let config = ConditionConfig {
            clauses: vec![clause("contact_name", ConditionOp::Exists, None)],
        };
        assert_eq!(evaluate(&config, &conversation()), Some("target"));
    }

    #[test]
    fn test_first_matching_clause_wins() {
        let mut first = clause("contact_name", ConditionOp::Exists, None);
        first.goto_step = "a".to_string();
        let mut second = clause("tags", ConditionOp::Contains, Some(serde_json::json!("warm")));
        second.goto_step = "b".to_string();

        let config = ConditionConfig {
            clauses: vec![first, second],
        };
        assert_eq!(evaluate(&config, &conversation()), Some("a"));
    }
}
