//! Flow execution repository

use crate::db::DatabasePool;
use crate::models::{CreateExecution, ExecutionStatus, FlowExecution};
use async_trait::async_trait;
use chatflow_common::types::{ConversationId, ExecutionId, FlowId};
use chatflow_common::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Flow execution repository trait
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution unless an active one already exists for the
    /// same (flow, conversation); returns None on conflict
    async fn create_unique(&self, input: CreateExecution) -> Result<Option<FlowExecution>>;
    async fn get(&self, id: ExecutionId) -> Result<Option<FlowExecution>>;
    async fn find_active(
        &self,
        flow_id: FlowId,
        conversation_id: ConversationId,
    ) -> Result<Option<FlowExecution>>;
    /// Guarded status transition; false if the row was not in any `from` state
    async fn try_set_status(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool>;
    /// Move the cursor forward; the step pointer never goes backwards
    async fn advance_step(&self, id: ExecutionId, step: i32) -> Result<()>;
    async fn set_delay(
        &self,
        id: ExecutionId,
        resume_at: DateTime<Utc>,
        delay_started_at: DateTime<Utc>,
        delay_minutes: i64,
    ) -> Result<()>;
    async fn clear_delay(&self, id: ExecutionId) -> Result<()>;
    /// Executions suspended in a delay, for restart reconciliation
    async fn list_suspended(&self) -> Result<Vec<FlowExecution>>;
    /// Executions left `running` with no pending resume after a crash
    async fn list_orphaned_running(&self) -> Result<Vec<FlowExecution>>;
}

/// Database flow execution repository
pub struct DbExecutionRepository {
    pool: DatabasePool,
}

impl DbExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for DbExecutionRepository {
    async fn create_unique(&self, input: CreateExecution) -> Result<Option<FlowExecution>> {
        let id = Uuid::new_v4();

        // Guarded insert backed by the partial unique index on active
        // executions; a racing second start loses either the NOT EXISTS
        // check or the unique constraint
        let result = sqlx::query_as::<_, FlowExecution>(
            r#"
            INSERT INTO flow_executions (id, flow_id, account_id, conversation_id, status)
            SELECT $1, $2, $3, $4, 'pending'
            WHERE NOT EXISTS (
                SELECT 1 FROM flow_executions
                WHERE flow_id = $2 AND conversation_id = $4
                  AND status IN ('pending', 'running', 'paused')
            )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.flow_id)
        .bind(input.account_id)
        .bind(input.conversation_id)
        .fetch_optional(self.pool.pool())
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<FlowExecution>> {
        sqlx::query_as::<_, FlowExecution>("SELECT * FROM flow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_active(
        &self,
        flow_id: FlowId,
        conversation_id: ConversationId,
    ) -> Result<Option<FlowExecution>> {
        sqlx::query_as::<_, FlowExecution>(
            r#"
            SELECT * FROM flow_executions
            WHERE flow_id = $1 AND conversation_id = $2
              AND status IN ('pending', 'running', 'paused')
            "#,
        )
        .bind(flow_id)
        .bind(conversation_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn try_set_status(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let finished_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let result = sqlx::query(
            r#"
            UPDATE flow_executions
            SET status = $2,
                last_error = COALESCE($3, last_error),
                finished_at = COALESCE($4, finished_at),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(&error)
        .bind(finished_at)
        .bind(&from)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn advance_step(&self, id: ExecutionId, step: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flow_executions
            SET current_step = $2, updated_at = NOW()
            WHERE id = $1 AND current_step <= $2
            "#,
        )
        .bind(id)
        .bind(step)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_delay(
        &self,
        id: ExecutionId,
        resume_at: DateTime<Utc>,
        delay_started_at: DateTime<Utc>,
        delay_minutes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flow_executions
            SET resume_at = $2, delay_started_at = $3, delay_minutes = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(resume_at)
        .bind(delay_started_at)
        .bind(delay_minutes)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn clear_delay(&self, id: ExecutionId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flow_executions
            SET resume_at = NULL, delay_started_at = NULL, delay_minutes = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_suspended(&self) -> Result<Vec<FlowExecution>> {
        sqlx::query_as::<_, FlowExecution>(
            r#"
            SELECT * FROM flow_executions
            WHERE resume_at IS NOT NULL AND status IN ('running', 'paused')
            ORDER BY resume_at ASC
            "#,
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_orphaned_running(&self) -> Result<Vec<FlowExecution>> {
        sqlx::query_as::<_, FlowExecution>(
            "SELECT * FROM flow_executions WHERE status = 'running' AND resume_at IS NULL",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
