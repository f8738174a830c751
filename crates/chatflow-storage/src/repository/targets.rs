//! Campaign target repository

use crate::db::DatabasePool;
use crate::models::{CampaignTarget, CreateCampaignTarget, TargetStatus};
use async_trait::async_trait;
use chatflow_common::types::{CampaignId, MessageId, TargetId};
use chatflow_common::{Error, Result};
use uuid::Uuid;

/// Campaign target repository trait
#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn create_batch(&self, targets: Vec<CreateCampaignTarget>) -> Result<u64>;
    async fn get(&self, id: TargetId) -> Result<Option<CampaignTarget>>;
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignTarget>>;
    /// Atomically claim the next pending target for dispatch
    async fn claim_next_pending(&self, campaign_id: CampaignId) -> Result<Option<CampaignTarget>>;
    /// Return a claimed target to the pending pool (pause observed mid-claim)
    async fn release_to_pending(&self, id: TargetId) -> Result<()>;
    /// Return every claimed target of a campaign to the pool, for restart
    /// reconciliation after a dispatch loop died mid-claim
    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64>;
    async fn mark_sent(&self, id: TargetId, message_id: MessageId) -> Result<()>;
    async fn mark_failed(&self, id: TargetId, error: &str) -> Result<()>;
    /// Transition sent -> delivered; false if the target was not in `sent`
    async fn try_mark_delivered(&self, id: TargetId) -> Result<bool>;
    /// Transition delivered -> read; false if the target was not in `delivered`
    async fn try_mark_read(&self, id: TargetId) -> Result<bool>;
    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64>;
    async fn count_by_status(&self, campaign_id: CampaignId, status: TargetStatus) -> Result<i64>;
}

/// Database campaign target repository
pub struct DbTargetRepository {
    pool: DatabasePool,
}

impl DbTargetRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetRepository for DbTargetRepository {
    async fn create_batch(&self, targets: Vec<CreateCampaignTarget>) -> Result<u64> {
        let mut count = 0u64;
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for input in targets {
            let id = Uuid::new_v4();
            let attributes = input.attributes.unwrap_or_else(|| serde_json::json!({}));

            let result = sqlx::query(
                r#"
                INSERT INTO campaign_targets (id, campaign_id, address, display_name, attributes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(input.campaign_id)
            .bind(&input.address)
            .bind(&input.display_name)
            .bind(&attributes)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            count += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count)
    }

    async fn get(&self, id: TargetId) -> Result<Option<CampaignTarget>> {
        sqlx::query_as::<_, CampaignTarget>("SELECT * FROM campaign_targets WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignTarget>> {
        sqlx::query_as::<_, CampaignTarget>(
            "SELECT * FROM campaign_targets WHERE campaign_id = $1 ORDER BY created_at ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim_next_pending(&self, campaign_id: CampaignId) -> Result<Option<CampaignTarget>> {
        sqlx::query_as::<_, CampaignTarget>(
            r#"
            UPDATE campaign_targets
            SET status = 'sending', updated_at = NOW()
            WHERE id = (
                SELECT id FROM campaign_targets
                WHERE campaign_id = $1 AND status = 'pending'
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn release_to_pending(&self, id: TargetId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'pending', updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'pending', updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'sending'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn mark_sent(&self, id: TargetId, message_id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'sent', message_id = $2, sent_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn mark_failed(&self, id: TargetId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'failed', error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn try_mark_delivered(&self, id: TargetId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'delivered', updated_at = NOW()
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_mark_read(&self, id: TargetId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'read', updated_at = NOW()
            WHERE id = $1 AND status = 'delivered'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_targets
            SET status = 'cancelled', updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, campaign_id: CampaignId, status: TargetStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM campaign_targets WHERE campaign_id = $1 AND status = $2",
        )
        .bind(campaign_id)
        .bind(status.to_string())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count.0)
    }
}
