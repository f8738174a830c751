//! Configuration for Chatflow

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Gateway client configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Inbound event webhook configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Flow engine configuration
    #[serde(default)]
    pub flow: FlowConfig,

    /// Campaign dispatcher configuration
    #[serde(default)]
    pub campaign: CampaignConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Gateway client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway bridge
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// API key sent with every gateway request
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for a single send attempt in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Send attempts before surfacing a failure
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,

    /// Base delay for send retry backoff in milliseconds
    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_base_ms: u64,

    /// Heartbeat age after which a session counts as stale, in seconds
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            send_timeout_secs: default_send_timeout(),
            send_attempts: default_send_attempts(),
            send_backoff_base_ms: default_send_backoff_ms(),
            heartbeat_stale_secs: default_heartbeat_stale(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_send_timeout() -> u64 {
    15
}

fn default_send_attempts() -> u32 {
    3
}

fn default_send_backoff_ms() -> u64 {
    500
}

fn default_heartbeat_stale() -> u64 {
    120
}

/// Inbound event webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Enable the webhook listener
    #[serde(default = "default_webhook_enabled")]
    pub enabled: bool,

    /// Webhook bind address
    #[serde(default = "default_webhook_bind")]
    pub bind: String,

    /// Shared secret for HMAC signature verification
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: default_webhook_enabled(),
            bind: default_webhook_bind(),
            secret: None,
        }
    }
}

fn default_webhook_enabled() -> bool {
    true
}

fn default_webhook_bind() -> String {
    "0.0.0.0:8085".to_string()
}

/// Flow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Maximum delay a single step may suspend for, in minutes
    #[serde(default = "default_max_delay_minutes")]
    pub max_delay_minutes: i64,

    /// Maximum steps a single execution may run (loop guard)
    #[serde(default = "default_max_steps")]
    pub max_steps_per_execution: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_delay_minutes: default_max_delay_minutes(),
            max_steps_per_execution: default_max_steps(),
        }
    }
}

fn default_max_delay_minutes() -> i64 {
    60 * 24 * 30
}

fn default_max_steps() -> usize {
    200
}

/// Campaign dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Default rate limit when a campaign does not set one
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit_per_minute: u32,

    /// Lower bound of the typing-simulation delay in milliseconds
    #[serde(default = "default_typing_min_ms")]
    pub typing_min_ms: u64,

    /// Upper bound of the typing-simulation delay in milliseconds
    #[serde(default = "default_typing_max_ms")]
    pub typing_max_ms: u64,

    /// Per-character contribution to the typing delay in milliseconds
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            default_rate_limit_per_minute: default_rate_limit(),
            typing_min_ms: default_typing_min_ms(),
            typing_max_ms: default_typing_max_ms(),
            typing_ms_per_char: default_typing_ms_per_char(),
        }
    }
}

fn default_rate_limit() -> u32 {
    20
}

fn default_typing_min_ms() -> u64 {
    800
}

fn default_typing_max_ms() -> u64 {
    5000
}

fn default_typing_ms_per_char() -> u64 {
    40
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/chatflow/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.send_attempts, 3);
        assert_eq!(gateway.send_timeout_secs, 15);

        let campaign = CampaignConfig::default();
        assert!(campaign.typing_min_ms < campaign.typing_max_ms);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "chat.example.com"

[database]
backend = "postgres"
url = "postgres://localhost/chatflow"

[gateway]
base_url = "http://bridge:3001"
send_attempts = 5

[webhook]
bind = "0.0.0.0:9090"
secret = "shh"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.hostname, "chat.example.com");
        assert_eq!(config.gateway.send_attempts, 5);
        assert_eq!(config.webhook.secret.as_deref(), Some("shh"));
        assert_eq!(config.campaign.default_rate_limit_per_minute, 20);
    }
}
