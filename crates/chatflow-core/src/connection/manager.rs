//! Connection Manager - exclusive owner of each account's gateway session

use super::client::{ConnectOutcome, GatewayClient, SendReceipt};
use chatflow_common::config::GatewayConfig;
use chatflow_common::types::{AccountId, MessageKind};
use chatflow_common::{Error, Result};
use chatflow_storage::models::AccountStatus;
use chatflow_storage::repository::AccountRepository;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Handle for a live gateway session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub account_id: AccountId,
    pub established_at: DateTime<Utc>,
}

/// Connection Manager
///
/// Holds at most one live session handle per account. The in-memory
/// registry is a cache over `accounts.status` and is rebuilt from it on
/// restart via [`ConnectionManager::recover`].
pub struct ConnectionManager {
    client: Arc<dyn GatewayClient>,
    accounts: Arc<dyn AccountRepository>,
    config: GatewayConfig,
    sessions: RwLock<HashMap<AccountId, SessionHandle>>,
    /// One mutex per account so concurrent connect calls serialize instead
    /// of racing to create duplicate sessions
    connect_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(
        client: Arc<dyn GatewayClient>,
        accounts: Arc<dyn AccountRepository>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            client,
            accounts,
            config,
            sessions: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn connect_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.lock().await;
        locks.entry(account_id).or_default().clone()
    }

    /// Begin a session for the account, or observe the one in flight.
    ///
    /// Concurrent callers for the same account serialize on a per-account
    /// lock; the second caller sees the first attempt's outcome rather than
    /// starting a second session.
    pub async fn connect(&self, account_id: AccountId) -> Result<ConnectOutcome> {
        let lock = self.connect_lock(account_id).await;
        let _guard = lock.lock().await;

        // A session established by a prior (or concurrent) call wins
        if self.sessions.read().await.contains_key(&account_id) {
            debug!(account = %account_id, "Connect requested but session already active");
            let account = self.load_account(account_id).await?;
            return Ok(ConnectOutcome::Connected {
                session_blob: account.session_blob,
            });
        }

        let account = self.load_account(account_id).await?;

        // Pairing already in flight: hand back the same artifact
        if account.status_enum() == Some(AccountStatus::Connecting) {
            if let Some(code) = account.pairing_code.clone() {
                debug!(account = %account_id, "Connect observed in-flight pairing");
                return Ok(ConnectOutcome::PairingRequired { pairing_code: code });
            }
        }

        self.accounts
            .set_status(account_id, AccountStatus::Connecting, None)
            .await?;

        match self.client.connect(&account).await {
            Ok(ConnectOutcome::PairingRequired { pairing_code }) => {
                self.accounts
                    .set_pairing_code(account_id, Some(pairing_code.clone()))
                    .await?;
                info!(account = %account_id, "Pairing started");
                Ok(ConnectOutcome::PairingRequired { pairing_code })
            }
            Ok(ConnectOutcome::Connected { session_blob }) => {
                self.establish(account_id, session_blob.clone()).await?;
                Ok(ConnectOutcome::Connected { session_blob })
            }
            Err(e) => {
                self.accounts
                    .set_status(account_id, AccountStatus::Error, Some(e.to_string()))
                    .await?;
                warn!(account = %account_id, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Record a session as live; called on direct connect and when the
    /// event feed reports a completed pairing
    pub async fn mark_connected(
        &self,
        account_id: AccountId,
        session_blob: Option<String>,
    ) -> Result<()> {
        self.establish(account_id, session_blob).await
    }

    async fn establish(&self, account_id: AccountId, session_blob: Option<String>) -> Result<()> {
        self.accounts.set_pairing_code(account_id, None).await?;
        self.accounts
            .set_session_blob(account_id, session_blob)
            .await?;
        self.accounts
            .set_status(account_id, AccountStatus::Connected, None)
            .await?;
        self.accounts.touch_heartbeat(account_id).await?;

        let handle = SessionHandle {
            account_id,
            established_at: Utc::now(),
        };
        self.sessions.write().await.insert(account_id, handle);

        info!(account = %account_id, "Session established");
        Ok(())
    }

    /// Tear down the account's session. Idempotent: disconnecting an
    /// already-disconnected account succeeds silently.
    pub async fn disconnect(&self, account_id: AccountId) -> Result<()> {
        let lock = self.connect_lock(account_id).await;
        let _guard = lock.lock().await;

        let had_session = self.sessions.write().await.remove(&account_id).is_some();
        if had_session {
            if let Err(e) = self.client.disconnect(account_id).await {
                warn!(account = %account_id, error = %e, "Gateway disconnect failed; tearing down anyway");
            }
        }

        self.accounts.clear_transients(account_id).await?;
        self.accounts
            .set_status(account_id, AccountStatus::Disconnected, None)
            .await?;

        info!(account = %account_id, "Disconnected");
        Ok(())
    }

    /// Evict the session after the gateway reports a mid-session drop.
    /// No auto-reconnect: callers decide whether to retry connect.
    pub async fn handle_gateway_disconnect(
        &self,
        account_id: AccountId,
        reason: Option<String>,
    ) -> Result<()> {
        self.sessions.write().await.remove(&account_id);
        self.accounts.clear_transients(account_id).await?;
        self.accounts
            .set_status(account_id, AccountStatus::Disconnected, reason.clone())
            .await?;

        warn!(account = %account_id, reason = ?reason, "Session dropped by gateway");
        Ok(())
    }

    /// Refresh the heartbeat after confirmed liveness. Staleness detection
    /// lives in an external watchdog, not here.
    pub async fn heartbeat(&self, account_id: AccountId) -> Result<()> {
        if !self.sessions.read().await.contains_key(&account_id) {
            return Err(Error::Connection(format!(
                "no active session for account {}",
                account_id
            )));
        }
        self.accounts.touch_heartbeat(account_id).await
    }

    /// Send through the account's active session with a timeout and a
    /// bounded exponential-backoff retry. Exhausted retries surface a
    /// SendFailure; the message is never silently dropped.
    pub async fn send(
        &self,
        account_id: AccountId,
        to: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendReceipt> {
        if !self.sessions.read().await.contains_key(&account_id) {
            return Err(Error::Connection(format!(
                "no active session for account {}",
                account_id
            )));
        }

        let attempts = self.config.send_attempts.max(1);
        let send_timeout = Duration::from_secs(self.config.send_timeout_secs);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(send_backoff(self.config.send_backoff_base_ms, attempt)).await;
            }

            match timeout(send_timeout, self.client.send(account_id, to, content, kind)).await {
                Ok(Ok(receipt)) => {
                    // A confirmed send is confirmed liveness
                    let _ = self.accounts.touch_heartbeat(account_id).await;
                    return Ok(receipt);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    debug!(
                        account = %account_id,
                        attempt = attempt + 1,
                        error = %last_error,
                        "Send attempt failed"
                    );
                }
                Err(_) => {
                    last_error = format!("send timed out after {}s", send_timeout.as_secs());
                    debug!(account = %account_id, attempt = attempt + 1, "Send attempt timed out");
                }
            }
        }

        Err(Error::SendFailure(format!(
            "send to {} failed after {} attempts: {}",
            to, attempts, last_error
        )))
    }

    /// Get the live session handle, or None. Callers must not assume
    /// automatic reconnection.
    pub async fn active_session(&self, account_id: AccountId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&account_id).cloned()
    }

    /// Accounts with a live session, for the administrative surface
    pub async fn connected_accounts(&self) -> Vec<AccountId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Rebuild the in-memory registry from persisted account status after
    /// a restart
    pub async fn recover(&self) -> Result<usize> {
        let connected = self.accounts.list_by_status(AccountStatus::Connected).await?;
        let mut sessions = self.sessions.write().await;

        for account in &connected {
            sessions.insert(
                account.id,
                SessionHandle {
                    account_id: account.id,
                    established_at: Utc::now(),
                },
            );
        }

        info!(count = connected.len(), "Recovered connection registry");
        Ok(connected.len())
    }

    async fn load_account(&self, account_id: AccountId) -> Result<chatflow_storage::models::Account> {
        self.accounts
            .get(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {}", account_id)))
    }
}

/// Exponential backoff delay before retry `attempt` (1-based between calls)
fn send_backoff(base_ms: u64, attempt: u32) -> Duration {
    // Base doubles per attempt, capped at 30s
    let ms = base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    Duration::from_millis(ms.min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryAccountRepository, MockGatewayClient};
    use chatflow_storage::models::{AuthMode, CreateAccount};
    use pretty_assertions::assert_eq;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            send_attempts: 3,
            send_backoff_base_ms: 10,
            send_timeout_secs: 5,
            ..GatewayConfig::default()
        }
    }

    async fn setup() -> (Arc<ConnectionManager>, Arc<MemoryAccountRepository>, Arc<MockGatewayClient>, AccountId) {
        let accounts = Arc::new(MemoryAccountRepository::new());
        let client = Arc::new(MockGatewayClient::new());
        let manager = Arc::new(ConnectionManager::new(
            client.clone(),
            accounts.clone(),
            test_config(),
        ));
        let account = accounts
            .create(CreateAccount {
                label: "main".to_string(),
                auth_mode: AuthMode::QrPairing,
                auth_token: None,
            })
            .await
            .unwrap();
        (manager, accounts, client, account.id)
    }

    #[test]
    fn test_send_backoff() {
        assert_eq!(send_backoff(500, 1), Duration::from_millis(500));
        assert_eq!(send_backoff(500, 2), Duration::from_millis(1000));
        assert_eq!(send_backoff(500, 3), Duration::from_millis(2000));
        // Capped
        assert_eq!(send_backoff(500, 20), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (manager, _accounts, client, account_id) = setup().await;
        client.set_pairing_code("2@pair-1");
        client.set_connect_delay(Duration::from_millis(50)).await;

        // Two concurrent connect calls for the same account
        let m1 = manager.clone();
        let m2 = manager.clone();
        let (a, b) = tokio::join!(m1.connect(account_id), m2.connect(account_id));

        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one underlying session attempt, both observe its result
        assert_eq!(client.connect_calls(), 1);
        assert_eq!(
            a,
            ConnectOutcome::PairingRequired {
                pairing_code: "2@pair-1".to_string()
            }
        );
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn connect_failure_sets_error_status() {
        let (manager, accounts, client, account_id) = setup().await;
        client.fail_connect("auth rejected");

        let err = manager.connect(account_id).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        let account = accounts.get(account_id).await.unwrap().unwrap();
        assert_eq!(account.status, "error");
        assert!(account.status_reason.unwrap().contains("auth rejected"));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_clears_transients() {
        let (manager, accounts, client, account_id) = setup().await;
        client.set_token_session(Some("blob".to_string()));

        manager.connect(account_id).await.unwrap();
        assert!(manager.active_session(account_id).await.is_some());

        manager.disconnect(account_id).await.unwrap();
        manager.disconnect(account_id).await.unwrap();

        assert!(manager.active_session(account_id).await.is_none());
        let account = accounts.get(account_id).await.unwrap().unwrap();
        assert_eq!(account.status, "disconnected");
        assert_eq!(account.pairing_code, None);
        assert_eq!(account.session_blob, None);
    }

    #[tokio::test]
    async fn send_retries_then_succeeds() {
        let (manager, _accounts, client, account_id) = setup().await;
        client.set_token_session(None);
        manager.connect(account_id).await.unwrap();

        // Two failures, then success - within the 3-attempt budget
        client.fail_sends_to("1555@c.gw", 2);

        let receipt = manager
            .send(account_id, "1555@c.gw", "hello", MessageKind::Text)
            .await
            .unwrap();
        assert!(!receipt.gateway_message_id.is_empty());
        assert_eq!(client.send_calls(), 3);
    }

    #[tokio::test]
    async fn send_exhausts_retries_into_send_failure() {
        let (manager, _accounts, client, account_id) = setup().await;
        client.set_token_session(None);
        manager.connect(account_id).await.unwrap();

        client.fail_sends_to("1555@c.gw", 10);

        let err = manager
            .send(account_id, "1555@c.gw", "hello", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailure(_)));
        assert_eq!(client.send_calls(), 3);
    }

    #[tokio::test]
    async fn send_without_session_is_a_connection_error() {
        let (manager, _accounts, _client, account_id) = setup().await;

        let err = manager
            .send(account_id, "1555@c.gw", "hello", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn recover_rebuilds_registry_from_status() {
        let (manager, accounts, _client, account_id) = setup().await;
        accounts
            .set_status(account_id, AccountStatus::Connected, None)
            .await
            .unwrap();

        assert!(manager.active_session(account_id).await.is_none());
        let recovered = manager.recover().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(manager.active_session(account_id).await.is_some());
    }
}
