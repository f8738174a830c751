//! Gateway client - the narrow interface to the external chat gateway
//!
//! The gateway's wire protocol is a black box behind an HTTP bridge. The
//! core never infers success without an explicit acknowledgment from it.

use async_trait::async_trait;
use chatflow_common::types::{AccountId, MessageKind};
use chatflow_common::{Error, Result};
use chatflow_storage::models::Account;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a connect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Pairing required: present the artifact to the operator and wait for
    /// the gateway to report the session through the event feed
    PairingRequired { pairing_code: String },
    /// Session established immediately (token-based accounts)
    Connected { session_blob: Option<String> },
}

/// Acknowledgment returned by the gateway for an accepted send
#[derive(Debug, Clone, Deserialize)]
pub struct SendReceipt {
    pub gateway_message_id: String,
}

/// Chat metadata returned by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSummary {
    pub remote_address: String,
    pub contact_name: Option<String>,
    #[serde(default)]
    pub unread: u32,
}

/// Client for the outbound gateway bridge
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Begin a session for the account
    async fn connect(&self, account: &Account) -> Result<ConnectOutcome>;

    /// Send one message through the account's session
    async fn send(
        &self,
        account_id: AccountId,
        to: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendReceipt>;

    /// List chat metadata for the account
    async fn list_chats(&self, account_id: AccountId) -> Result<Vec<ChatSummary>>;

    /// Fetch a profile picture URL for a remote address, if one exists
    async fn profile_picture(&self, account_id: AccountId, remote: &str)
        -> Result<Option<String>>;

    /// Tear down the account's session on the gateway
    async fn disconnect(&self, account_id: AccountId) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
    auth_mode: &'a str,
    auth_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    status: String,
    pairing_code: Option<String>,
    session_blob: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    content: &'a str,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ProfilePictureResponse {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    error: String,
}

/// HTTP implementation of [`GatewayClient`] against the gateway bridge
pub struct HttpGatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGatewayClient {
    /// Create a new client from configuration
    pub fn new(config: &chatflow_common::config::GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    async fn read_error(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<GatewayError>().await {
            Ok(body) => body.error,
            Err(_) => format!("gateway returned {}", status),
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn connect(&self, account: &Account) -> Result<ConnectOutcome> {
        let request = ConnectRequest {
            auth_mode: &account.auth_mode,
            auth_token: account.auth_token.as_deref(),
        };

        let response = self
            .request(reqwest::Method::POST, &format!("/accounts/{}/connect", account.id))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("connect request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(Self::read_error(response).await));
        }

        let body: ConnectResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("invalid connect response: {}", e)))?;

        match body.status.as_str() {
            "pairing" => {
                let pairing_code = body.pairing_code.ok_or_else(|| {
                    Error::Connection("gateway reported pairing without an artifact".to_string())
                })?;
                Ok(ConnectOutcome::PairingRequired { pairing_code })
            }
            "connected" => Ok(ConnectOutcome::Connected {
                session_blob: body.session_blob,
            }),
            other => Err(Error::Connection(format!(
                "unexpected connect status: {}",
                other
            ))),
        }
    }

    async fn send(
        &self,
        account_id: AccountId,
        to: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendReceipt> {
        let request = SendRequest {
            to,
            content,
            kind: kind.to_string(),
        };

        let response = self
            .request(reqwest::Method::POST, &format!("/accounts/{}/send", account_id))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::SendFailure(format!("send request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::SendFailure(Self::read_error(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| Error::SendFailure(format!("invalid send response: {}", e)))
    }

    async fn list_chats(&self, account_id: AccountId) -> Result<Vec<ChatSummary>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/accounts/{}/chats", account_id))
            .send()
            .await
            .map_err(|e| Error::Connection(format!("list chats failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(Self::read_error(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("invalid chats response: {}", e)))
    }

    async fn profile_picture(
        &self,
        account_id: AccountId,
        remote: &str,
    ) -> Result<Option<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/accounts/{}/profile-picture", account_id),
            )
            .query(&[("remote", remote)])
            .send()
            .await
            .map_err(|e| Error::Connection(format!("profile picture failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(Self::read_error(response).await));
        }

        let body: ProfilePictureResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("invalid profile picture response: {}", e)))?;

        Ok(body.url)
    }

    async fn disconnect(&self, account_id: AccountId) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/accounts/{}/disconnect", account_id),
            )
            .send()
            .await
            .map_err(|e| Error::Connection(format!("disconnect request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(Self::read_error(response).await));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_common::config::GatewayConfig;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_account(id: AccountId) -> Account {
        Account {
            id,
            label: "test".to_string(),
            auth_mode: "qr_pairing".to_string(),
            auth_token: None,
            status: "disconnected".to_string(),
            status_reason: None,
            pairing_code: None,
            session_blob: None,
            last_heartbeat_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn client_for(server: &MockServer) -> HttpGatewayClient {
        let config = GatewayConfig {
            base_url: server.uri(),
            ..GatewayConfig::default()
        };
        HttpGatewayClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn connect_returns_pairing_artifact() {
        let server = MockServer::start().await;
        let account = test_account(uuid::Uuid::new_v4());

        Mock::given(method("POST"))
            .and(path(format!("/accounts/{}/connect", account.id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pairing",
                "pairing_code": "2@abc123",
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client.connect(&account).await.unwrap();
        assert_eq!(
            outcome,
            ConnectOutcome::PairingRequired {
                pairing_code: "2@abc123".to_string()
            }
        );
    }

    #[tokio::test]
    async fn send_surfaces_gateway_rejection() {
        let server = MockServer::start().await;
        let account_id = uuid::Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path(format!("/accounts/{}/send", account_id)))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({"error": "unknown recipient"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .send(account_id, "1555@c.gw", "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailure(_)));
        assert!(err.to_string().contains("unknown recipient"));
    }

    #[tokio::test]
    async fn send_returns_receipt() {
        let server = MockServer::start().await;
        let account_id = uuid::Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path(format!("/accounts/{}/send", account_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "gateway_message_id": "g-1",
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let receipt = client
            .send(account_id, "1555@c.gw", "hi", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(receipt.gateway_message_id, "g-1");
    }
}
