//! Conversation repository

use crate::db::DatabasePool;
use crate::models::{Conversation, CreateConversation};
use async_trait::async_trait;
use chatflow_common::types::{AccountId, ConversationId};
use chatflow_common::{Error, Result};
use uuid::Uuid;

/// Conversation repository trait
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, input: CreateConversation) -> Result<Conversation>;
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>>;
    async fn find_by_remote(
        &self,
        account_id: AccountId,
        remote_address: &str,
    ) -> Result<Option<Conversation>>;
    /// Create the conversation if it does not exist yet, return it either way
    async fn upsert_remote(&self, input: CreateConversation) -> Result<Conversation>;
    async fn increment_unread(&self, id: ConversationId) -> Result<()>;
    async fn mark_read(&self, id: ConversationId) -> Result<()>;
    async fn set_attribute(
        &self,
        id: ConversationId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;
    async fn add_tag(&self, id: ConversationId, tag: &str) -> Result<()>;
    async fn remove_tag(&self, id: ConversationId, tag: &str) -> Result<()>;
    async fn touch_activity(&self, id: ConversationId) -> Result<()>;
}

/// Database conversation repository
pub struct DbConversationRepository {
    pool: DatabasePool,
}

impl DbConversationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn create(&self, input: CreateConversation) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let attributes = input.attributes.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (id, account_id, remote_address, contact_name, attributes)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.account_id)
        .bind(&input.remote_address)
        .bind(&input.contact_name)
        .bind(&attributes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_remote(
        &self,
        account_id: AccountId,
        remote_address: &str,
    ) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE account_id = $1 AND remote_address = $2",
        )
        .bind(account_id)
        .bind(remote_address)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn upsert_remote(&self, input: CreateConversation) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let attributes = input.attributes.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (id, account_id, remote_address, contact_name, attributes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, remote_address)
            DO UPDATE SET
                contact_name = COALESCE(EXCLUDED.contact_name, conversations.contact_name),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.account_id)
        .bind(&input.remote_address)
        .bind(&input.contact_name)
        .bind(&attributes)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn increment_unread(&self, id: ConversationId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET unread_count = unread_count + 1,
                last_activity_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn mark_read(&self, id: ConversationId) -> Result<()> {
        sqlx::query("UPDATE conversations SET unread_count = 0, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_attribute(
        &self,
        id: ConversationId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET attributes = jsonb_set(attributes, ARRAY[$2], $3, true),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(&value)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn add_tag(&self, id: ConversationId, tag: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET tags = CASE
                    WHEN tags ? $2 THEN tags
                    ELSE tags || to_jsonb($2::text)
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(tag)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn remove_tag(&self, id: ConversationId, tag: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET tags = tags - $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(tag)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn touch_activity(&self, id: ConversationId) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET last_activity_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
