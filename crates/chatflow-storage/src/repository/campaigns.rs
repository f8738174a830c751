//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignStatus, CreateCampaign};
use async_trait::async_trait;
use chatflow_common::types::CampaignId;
use chatflow_common::{Error, Result};
use chrono::Utc;
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    /// Guarded status transition; false if the row was not in any `from` state
    async fn try_set_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        reason: Option<String>,
    ) -> Result<bool>;
    async fn set_target_count(&self, id: CampaignId, count: i32) -> Result<()>;
    async fn increment_sent(&self, id: CampaignId) -> Result<()>;
    async fn increment_failed(&self, id: CampaignId) -> Result<()>;
    async fn increment_delivered(&self, id: CampaignId) -> Result<()>;
    async fn increment_read(&self, id: CampaignId) -> Result<()>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn increment_counter(&self, id: CampaignId, column: &str) -> Result<()> {
        // Column names come from the fixed call sites below, never from input
        let sql = format!(
            "UPDATE campaigns SET {} = {} + 1, updated_at = NOW() WHERE id = $1",
            column, column
        );

        sqlx::query(&sql)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, account_id, name, message_template, kind,
                rate_limit_per_minute, typing_simulation, scheduled_at, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'scheduled')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.account_id)
        .bind(&input.name)
        .bind(&input.message_template)
        .bind(input.kind.to_string())
        .bind(input.rate_limit_per_minute.unwrap_or(20))
        .bind(input.typing_simulation.unwrap_or(false))
        .bind(input.scheduled_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn try_set_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();

        let started_at = if to == CampaignStatus::Sending {
            Some(Utc::now())
        } else {
            None
        };
        let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2,
                status_reason = $3,
                started_at = COALESCE(started_at, $4),
                completed_at = COALESCE($5, completed_at),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(&reason)
        .bind(started_at)
        .bind(completed_at)
        .bind(&from)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_target_count(&self, id: CampaignId, count: i32) -> Result<()> {
        sqlx::query("UPDATE campaigns SET target_count = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(count)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn increment_sent(&self, id: CampaignId) -> Result<()> {
        self.increment_counter(id, "sent_count").await
    }

    async fn increment_failed(&self, id: CampaignId) -> Result<()> {
        self.increment_counter(id, "failed_count").await
    }

    async fn increment_delivered(&self, id: CampaignId) -> Result<()> {
        self.increment_counter(id, "delivered_count").await
    }

    async fn increment_read(&self, id: CampaignId) -> Result<()> {
        self.increment_counter(id, "read_count").await
    }
}
