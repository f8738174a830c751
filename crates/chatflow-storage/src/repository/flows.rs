//! Flow repository - flows, steps, and triggers

use crate::db::DatabasePool;
use crate::models::{
    CreateFlow, CreateFlowStep, CreateFlowTrigger, Flow, FlowStep, FlowTrigger, TriggerKind,
};
use async_trait::async_trait;
use chatflow_common::types::{FlowId, TriggerId};
use chatflow_common::{Error, Result};
use uuid::Uuid;

/// Flow repository trait
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn create_flow(&self, input: CreateFlow) -> Result<Flow>;
    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>>;
    async fn set_flow_active(&self, id: FlowId, active: bool) -> Result<()>;
    async fn add_step(&self, input: CreateFlowStep) -> Result<FlowStep>;
    /// Steps ordered by position
    async fn list_steps(&self, flow_id: FlowId) -> Result<Vec<FlowStep>>;
    async fn add_trigger(&self, input: CreateFlowTrigger) -> Result<FlowTrigger>;
    async fn get_trigger(&self, id: TriggerId) -> Result<Option<FlowTrigger>>;
    async fn set_trigger_active(&self, id: TriggerId, active: bool) -> Result<()>;
    /// SCHEDULE triggers whose trigger and flow are both active
    async fn list_active_schedule_triggers(&self) -> Result<Vec<FlowTrigger>>;
    /// EVENT triggers whose trigger and flow are both active
    async fn list_active_event_triggers(&self) -> Result<Vec<FlowTrigger>>;
}

/// Database flow repository
pub struct DbFlowRepository {
    pool: DatabasePool,
}

impl DbFlowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn list_active_by_kind(&self, kind: TriggerKind) -> Result<Vec<FlowTrigger>> {
        sqlx::query_as::<_, FlowTrigger>(
            r#"
            SELECT t.* FROM flow_triggers t
            JOIN flows f ON f.id = t.flow_id
            WHERE t.kind = $1 AND t.is_active AND f.is_active
            ORDER BY t.created_at ASC
            "#,
        )
        .bind(kind.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl FlowRepository for DbFlowRepository {
    async fn create_flow(&self, input: CreateFlow) -> Result<Flow> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, Flow>(
            r#"
            INSERT INTO flows (id, name, description, is_active)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.is_active.unwrap_or(true))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>> {
        sqlx::query_as::<_, Flow>("SELECT * FROM flows WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_flow_active(&self, id: FlowId, active: bool) -> Result<()> {
        sqlx::query("UPDATE flows SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn add_step(&self, input: CreateFlowStep) -> Result<FlowStep> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, FlowStep>(
            r#"
            INSERT INTO flow_steps (id, flow_id, position, name, kind, config)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.flow_id)
        .bind(input.position)
        .bind(&input.name)
        .bind(input.kind.to_string())
        .bind(&input.config)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_steps(&self, flow_id: FlowId) -> Result<Vec<FlowStep>> {
        sqlx::query_as::<_, FlowStep>(
            "SELECT * FROM flow_steps WHERE flow_id = $1 ORDER BY position ASC",
        )
        .bind(flow_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn add_trigger(&self, input: CreateFlowTrigger) -> Result<FlowTrigger> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, FlowTrigger>(
            r#"
            INSERT INTO flow_triggers (id, flow_id, kind, config, is_active)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.flow_id)
        .bind(input.kind.to_string())
        .bind(&input.config)
        .bind(input.is_active.unwrap_or(true))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<FlowTrigger>> {
        sqlx::query_as::<_, FlowTrigger>("SELECT * FROM flow_triggers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_trigger_active(&self, id: TriggerId, active: bool) -> Result<()> {
        sqlx::query("UPDATE flow_triggers SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_active_schedule_triggers(&self) -> Result<Vec<FlowTrigger>> {
        self.list_active_by_kind(TriggerKind::Schedule).await
    }

    async fn list_active_event_triggers(&self) -> Result<Vec<FlowTrigger>> {
        self.list_active_by_kind(TriggerKind::Event).await
    }
}
