//! Template rendering - personalization of outbound content

use chatflow_storage::models::{CampaignTarget, Conversation};
use regex::Regex;
use serde_json::Value;

/// Renders `{{variable}}` placeholders against contact fields
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new template renderer
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(r"\{\{[^}]+\}\}").expect("static placeholder pattern"),
        }
    }

    /// Render a template with conversation contact data
    pub fn render_for_conversation(&self, template: &str, conversation: &Conversation) -> String {
        self.apply(
            template,
            conversation.contact_name.as_deref(),
            &conversation.remote_address,
            &conversation.attributes,
        )
    }

    /// Render a template with campaign target data
    pub fn render_for_target(&self, template: &str, target: &CampaignTarget) -> String {
        self.apply(
            template,
            target.display_name.as_deref(),
            &target.address,
            &target.attributes,
        )
    }

    fn apply(
        &self,
        template: &str,
        name: Option<&str>,
        address: &str,
        attributes: &Value,
    ) -> String {
        let mut result = template.to_string();

        let name = name.unwrap_or("");
        result = result.replace("{{name}}", name);
        result = result.replace("{{address}}", address);

        // Split name into first/last (simple heuristic)
        let parts: Vec<&str> = name.split_whitespace().collect();
        let first_name = parts.first().copied().unwrap_or("");
        let last_name = if parts.len() > 1 {
            parts[1..].join(" ")
        } else {
            String::new()
        };
        result = result.replace("{{first_name}}", first_name);
        result = result.replace("{{last_name}}", &last_name);

        // Custom attributes
        if let Some(attrs) = attributes.as_object() {
            for (key, value) in attrs {
                let placeholder = format!("{{{{attributes.{}}}}}", key);
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => value.to_string(),
                };
                result = result.replace(&placeholder, &value_str);
            }
        }

        // Clean up any remaining placeholders
        self.placeholder.replace_all(&result, "").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn test_target() -> CampaignTarget {
        CampaignTarget {
            id: uuid::Uuid::new_v4(),
            campaign_id: uuid::Uuid::new_v4(),
            address: "15551230001@c.gw".to_string(),
            display_name: Some("John Doe".to_string()),
            attributes: serde_json::json!({
                "company": "Acme Corp",
                "plan": "premium"
            }),
            status: "pending".to_string(),
            message_id: None,
            error: None,
            sent_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_basic_template() {
        let renderer = TemplateRenderer::new();
        let target = test_target();

        let result = renderer.render_for_target("Hello {{name}}, we have you as {{address}}", &target);
        assert_eq!(result, "Hello John Doe, we have you as 15551230001@c.gw");
    }

    #[test]
    fn test_render_with_attributes() {
        let renderer = TemplateRenderer::new();
        let target = test_target();

        let result = renderer.render_for_target("Welcome {{first_name}} from {{attributes.company}}!", &target);
        assert_eq!(result, "Welcome John from Acme Corp!");
    }

    #[test]
    fn test_render_removes_unused() {
        let renderer = TemplateRenderer::new();
        let target = test_target();

        let result = renderer.render_for_target("Hello {{name}}, {{unknown_var}} test", &target);
        assert_eq!(result, "Hello John Doe,  test");
    }

    #[test]
    fn test_render_without_name() {
        let renderer = TemplateRenderer::new();
        let mut target = test_target();
        target.display_name = None;

        let result = renderer.render_for_target("Hi {{first_name}}{{last_name}}!", &target);
        assert_eq!(result, "Hi !");
    }
}
