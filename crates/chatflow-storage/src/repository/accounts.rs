//! Account repository

use crate::db::DatabasePool;
use crate::models::{Account, AccountStatus, CreateAccount};
use async_trait::async_trait;
use chatflow_common::types::AccountId;
use chatflow_common::{Error, Result};
use uuid::Uuid;

/// Account repository trait
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create(&self, input: CreateAccount) -> Result<Account>;
    async fn get(&self, id: AccountId) -> Result<Option<Account>>;
    async fn list(&self) -> Result<Vec<Account>>;
    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>>;
    async fn set_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        reason: Option<String>,
    ) -> Result<()>;
    async fn set_pairing_code(&self, id: AccountId, code: Option<String>) -> Result<()>;
    async fn set_session_blob(&self, id: AccountId, blob: Option<String>) -> Result<()>;
    /// Clear pairing artifact and session blob together
    async fn clear_transients(&self, id: AccountId) -> Result<()>;
    async fn touch_heartbeat(&self, id: AccountId) -> Result<()>;
}

/// Database account repository
pub struct DbAccountRepository {
    pool: DatabasePool,
}

impl DbAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for DbAccountRepository {
    async fn create(&self, input: CreateAccount) -> Result<Account> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, label, auth_mode, auth_token, status)
            VALUES ($1, $2, $3, $4, 'disconnected')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.label)
        .bind(input.auth_mode.to_string())
        .bind(&input.auth_token)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY created_at ASC")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE status = $1")
            .bind(status.to_string())
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        reason: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = $2, status_reason = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(&reason)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_pairing_code(&self, id: AccountId, code: Option<String>) -> Result<()> {
        sqlx::query("UPDATE accounts SET pairing_code = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&code)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_session_blob(&self, id: AccountId, blob: Option<String>) -> Result<()> {
        sqlx::query("UPDATE accounts SET session_blob = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&blob)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn clear_transients(&self, id: AccountId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET pairing_code = NULL, session_blob = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn touch_heartbeat(&self, id: AccountId) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_heartbeat_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
