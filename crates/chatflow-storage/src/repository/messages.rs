//! Message repository

use crate::db::DatabasePool;
use crate::models::{CreateMessage, Message, MessageStatus};
use async_trait::async_trait;
use chatflow_common::types::{AccountId, MessageId};
use chatflow_common::{Error, Result};
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, input: CreateMessage) -> Result<Message>;
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;
    async fn find_by_gateway_id(
        &self,
        account_id: AccountId,
        gateway_message_id: &str,
    ) -> Result<Option<Message>>;
    async fn mark_sent(&self, id: MessageId, gateway_message_id: &str) -> Result<()>;
    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<()>;
    /// Transition sent -> delivered; false if the message was not in `sent`
    async fn try_mark_delivered(&self, id: MessageId) -> Result<bool>;
    /// Transition delivered -> read; false if the message was not in `delivered`
    async fn try_mark_read(&self, id: MessageId) -> Result<bool>;
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                id, account_id, conversation_id, direction, kind, content,
                status, gateway_message_id, campaign_target_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.account_id)
        .bind(input.conversation_id)
        .bind(input.direction.to_string())
        .bind(input.kind.to_string())
        .bind(&input.content)
        .bind(input.status.to_string())
        .bind(&input.gateway_message_id)
        .bind(input.campaign_target_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_gateway_id(
        &self,
        account_id: AccountId,
        gateway_message_id: &str,
    ) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE account_id = $1 AND gateway_message_id = $2",
        )
        .bind(account_id)
        .bind(gateway_message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_sent(&self, id: MessageId, gateway_message_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, gateway_message_id = $3, sent_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(MessageStatus::Sent.to_string())
        .bind(gateway_message_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET status = $2, error = $3 WHERE id = $1")
            .bind(id)
            .bind(MessageStatus::Failed.to_string())
            .bind(error)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn try_mark_delivered(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'delivered', delivered_at = NOW()
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_mark_read(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'read', read_at = NOW()
            WHERE id = $1 AND status = 'delivered'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
