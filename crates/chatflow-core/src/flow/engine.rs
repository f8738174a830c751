//! Flow Engine - drives per-conversation automations as resumable state
//! machines
//!
//! An execution's cursor (step index plus optional resume timestamp) is
//! persisted before every suspension, so a restart can pick up exactly
//! where the process died. Pause and stop are observed at suspension
//! boundaries: the step loop rechecks persisted status before every step,
//! never mid-step.

use super::condition;
use super::step::{
    parse_config, ActionConfig, ConditionConfig, DelayConfig, SendMessageConfig,
};
use super::template::TemplateRenderer;
use super::trigger::{EventTriggerConfig, ScheduleTriggerConfig, TriggerEvent};
use crate::connection::ConnectionManager;
use crate::scheduler::JobScheduler;
use chatflow_common::config::FlowConfig;
use chatflow_common::types::{
    AccountId, ConversationId, Direction, ExecutionId, FlowId, TriggerId,
};
use chatflow_common::{Error, Result};
use chatflow_storage::models::{
    Conversation, CreateExecution, CreateMessage, ExecutionStatus, FlowExecution, FlowStep,
    FlowStepKind, MessageStatus, TriggerKind,
};
use chatflow_storage::repository::{
    ConversationRepository, ExecutionRepository, FlowRepository, MessageRepository,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a single step asked the loop to do next
enum StepOutcome {
    /// Move the cursor to the next step
    Advance,
    /// Branch the cursor forward to an absolute position
    Jump(i32),
    /// The execution suspended (delay registered); leave the loop
    Suspended,
    /// Nothing matched; finish the execution gracefully
    Exit,
    /// Unrecoverable step failure
    Failed(String),
}

/// Flow Engine
pub struct FlowEngine {
    flows: Arc<dyn FlowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    connections: Arc<ConnectionManager>,
    scheduler: Arc<JobScheduler>,
    renderer: TemplateRenderer,
    config: FlowConfig,
}

impl FlowEngine {
    /// Create a new flow engine
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        connections: Arc<ConnectionManager>,
        scheduler: Arc<JobScheduler>,
        config: FlowConfig,
    ) -> Self {
        Self {
            flows,
            executions,
            conversations,
            messages,
            connections,
            scheduler,
            renderer: TemplateRenderer::new(),
            config,
        }
    }

    /// Start an execution of an active flow bound to (account,
    /// conversation) and drive it until it suspends or finishes.
    ///
    /// At most one active execution may exist per (flow, conversation);
    /// a second start surfaces a conflict.
    pub async fn start_execution(
        &self,
        flow_id: FlowId,
        conversation_id: ConversationId,
        account_id: AccountId,
    ) -> Result<FlowExecution> {
        let flow = self
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("flow {}", flow_id)))?;
        if !flow.is_active {
            return Err(Error::Validation(format!("flow '{}' is not active", flow.name)));
        }

        self.conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;

        let execution = self
            .executions
            .create_unique(CreateExecution {
                flow_id,
                account_id,
                conversation_id,
            })
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "an active execution of flow {} already exists for conversation {}",
                    flow_id, conversation_id
                ))
            })?;

        info!(
            execution = %execution.id,
            flow = %flow_id,
            conversation = %conversation_id,
            "Flow execution started"
        );

        self.executions
            .try_set_status(
                execution.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                None,
            )
            .await?;

        self.drive(execution.id).await?;

        self.executions
            .get(execution.id)
            .await?
            .ok_or_else(|| Error::Internal("execution vanished while driving".to_string()))
    }

    /// Step loop: executes steps strictly in sequence until the execution
    /// suspends, finishes, or an externally requested pause/stop is
    /// observed at the boundary before the next step
    async fn drive(&self, execution_id: ExecutionId) -> Result<()> {
        let Some(head) = self.executions.get(execution_id).await? else {
            return Ok(());
        };
        let steps = self.flows.list_steps(head.flow_id).await?;
        let mut budget = self.config.max_steps_per_execution;

        loop {
            let Some(execution) = self.executions.get(execution_id).await? else {
                return Ok(());
            };

            match execution.status_enum() {
                Some(ExecutionStatus::Running) => {}
                Some(ExecutionStatus::Paused) => {
                    debug!(execution = %execution_id, "Pause observed at suspension boundary");
                    return Ok(());
                }
                _ => return Ok(()),
            }

            let index = execution.current_step.max(0) as usize;
            if index >= steps.len() {
                self.complete(execution_id).await?;
                return Ok(());
            }

            if budget == 0 {
                self.fail(execution_id, "step budget exceeded; aborting runaway flow")
                    .await?;
                return Ok(());
            }
            budget -= 1;

            let step = &steps[index];
            debug!(
                execution = %execution_id,
                step = %step.name,
                kind = %step.kind,
                "Executing step"
            );

            match self.run_step(&execution, step, &steps).await? {
                StepOutcome::Advance => {
                    self.executions
                        .advance_step(execution_id, index as i32 + 1)
                        .await?;
                }
                StepOutcome::Jump(position) => {
                    self.executions.advance_step(execution_id, position).await?;
                }
                StepOutcome::Suspended => return Ok(()),
                StepOutcome::Exit => {
                    self.complete(execution_id).await?;
                    return Ok(());
                }
                StepOutcome::Failed(reason) => {
                    self.fail(execution_id, &reason).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn run_step(
        &self,
        execution: &FlowExecution,
        step: &FlowStep,
        steps: &[FlowStep],
    ) -> Result<StepOutcome> {
        let Some(kind) = step.kind_enum() else {
            return Ok(StepOutcome::Failed(format!(
                "unknown step kind '{}'",
                step.kind
            )));
        };

        match kind {
            FlowStepKind::SendMessage => self.run_send_step(execution, step).await,
            FlowStepKind::Delay => self.run_delay_step(execution, step).await,
            FlowStepKind::Condition => self.run_condition_step(execution, step, steps).await,
            FlowStepKind::Action => self.run_action_step(execution, step).await,
        }
    }

    async fn run_send_step(
        &self,
        execution: &FlowExecution,
        step: &FlowStep,
    ) -> Result<StepOutcome> {
        let config: SendMessageConfig = match parse_config(&step.name, &step.config) {
            Ok(c) => c,
            Err(e) => return Ok(StepOutcome::Failed(e.to_string())),
        };

        let Some(conversation) = self.conversations.get(execution.conversation_id).await? else {
            return Ok(StepOutcome::Failed("conversation no longer exists".to_string()));
        };

        let content = self
            .renderer
            .render_for_conversation(&config.template, &conversation);

        let message = self
            .messages
            .create(CreateMessage {
                account_id: execution.account_id,
                conversation_id: conversation.id,
                direction: Direction::Outbound,
                kind: config.kind,
                content: content.clone(),
                status: MessageStatus::Pending,
                gateway_message_id: None,
                campaign_target_id: None,
            })
            .await?;

        match self
            .connections
            .send(
                execution.account_id,
                &conversation.remote_address,
                &content,
                config.kind,
            )
            .await
        {
            Ok(receipt) => {
                self.messages
                    .mark_sent(message.id, &receipt.gateway_message_id)
                    .await?;
                self.conversations.touch_activity(conversation.id).await?;
                Ok(StepOutcome::Advance)
            }
            Err(e) => {
                // A SendFailure halts the execution with the failure
                // recorded; it is never silently skipped
                self.messages.mark_failed(message.id, &e.to_string()).await?;
                Ok(StepOutcome::Failed(format!(
                    "send failed at step '{}': {}",
                    step.name, e
                )))
            }
        }
    }

    async fn run_delay_step(
        &self,
        execution: &FlowExecution,
        step: &FlowStep,
    ) -> Result<StepOutcome> {
        let config: DelayConfig = match parse_config(&step.name, &step.config) {
            Ok(c) => c,
            Err(e) => return Ok(StepOutcome::Failed(e.to_string())),
        };

        if config.delay_minutes < 1 || config.delay_minutes > self.config.max_delay_minutes {
            return Ok(StepOutcome::Failed(format!(
                "delay of {} minutes at step '{}' is out of range",
                config.delay_minutes, step.name
            )));
        }

        let now = Utc::now();
        let resume_at = now + Duration::minutes(config.delay_minutes);

        // Persist the resume point first so the suspension survives a
        // restart, then arm the timer
        self.executions
            .set_delay(execution.id, resume_at, now, config.delay_minutes)
            .await?;
        self.scheduler.schedule_resume(execution.id, resume_at).await;

        debug!(
            execution = %execution.id,
            minutes = config.delay_minutes,
            %resume_at,
            "Execution suspended in delay"
        );
        Ok(StepOutcome::Suspended)
    }

    async fn run_condition_step(
        &self,
        execution: &FlowExecution,
        step: &FlowStep,
        steps: &[FlowStep],
    ) -> Result<StepOutcome> {
        let config: ConditionConfig = match parse_config(&step.name, &step.config) {
            Ok(c) => c,
            Err(e) => return Ok(StepOutcome::Failed(e.to_string())),
        };

        let Some(conversation) = self.conversations.get(execution.conversation_id).await? else {
            return Ok(StepOutcome::Failed("conversation no longer exists".to_string()));
        };

        match condition::evaluate(&config, &conversation) {
            None => {
                debug!(execution = %execution.id, step = %step.name, "No condition matched; exiting flow");
                Ok(StepOutcome::Exit)
            }
            Some(target_name) => {
                let Some(position) = steps
                    .iter()
                    .position(|s| s.name == target_name)
                    .map(|p| p as i32)
                else {
                    return Ok(StepOutcome::Failed(format!(
                        "condition at step '{}' targets unknown step '{}'",
                        step.name, target_name
                    )));
                };

                // The cursor only ever moves forward
                if position <= execution.current_step {
                    return Ok(StepOutcome::Failed(format!(
                        "condition at step '{}' would move the cursor backwards to '{}'",
                        step.name, target_name
                    )));
                }

                Ok(StepOutcome::Jump(position))
            }
        }
    }

    async fn run_action_step(
        &self,
        execution: &FlowExecution,
        step: &FlowStep,
    ) -> Result<StepOutcome> {
        let config: ActionConfig = match parse_config(&step.name, &step.config) {
            Ok(c) => c,
            Err(e) => return Ok(StepOutcome::Failed(e.to_string())),
        };

        let conversation_id = execution.conversation_id;
        match config {
            ActionConfig::AddTag { tag } => {
                self.conversations.add_tag(conversation_id, &tag).await?;
            }
            ActionConfig::RemoveTag { tag } => {
                self.conversations.remove_tag(conversation_id, &tag).await?;
            }
            ActionConfig::SetAttribute { key, value } => {
                self.conversations
                    .set_attribute(conversation_id, &key, value)
                    .await?;
            }
            ActionConfig::MarkRead => {
                self.conversations.mark_read(conversation_id).await?;
            }
        }

        Ok(StepOutcome::Advance)
    }

    /// Timer-driven continuation of a suspended delay. Ignores executions
    /// that were paused or stopped while the timer was armed.
    pub async fn handle_resume_due(&self, execution_id: ExecutionId) -> Result<()> {
        let Some(execution) = self.executions.get(execution_id).await? else {
            return Ok(());
        };

        if execution.status_enum() != Some(ExecutionStatus::Running)
            || execution.resume_at.is_none()
        {
            debug!(execution = %execution_id, "Resume fired but execution is no longer suspended");
            return Ok(());
        }

        self.executions.clear_delay(execution_id).await?;
        self.executions
            .advance_step(execution_id, execution.current_step + 1)
            .await?;
        self.drive(execution_id).await
    }

    /// Request a pause. Honored at the next suspension boundary, so an
    /// execution never stops mid-step.
    pub async fn pause_execution(&self, execution_id: ExecutionId) -> Result<()> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;

        let paused = self
            .executions
            .try_set_status(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Paused,
                None,
            )
            .await?;
        if !paused {
            return Err(Error::Conflict("execution cannot be paused".to_string()));
        }

        // An armed delay timer must not fire into a paused execution
        self.scheduler.cancel_resume(execution_id).await;
        info!(execution = %execution_id, "Execution paused");
        Ok(())
    }

    /// Resume a paused execution. Mid-delay, the remaining wait is
    /// `max(0, original - elapsed)`; a fully elapsed delay advances
    /// immediately.
    pub async fn resume_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;

        let resumed = self
            .executions
            .try_set_status(
                execution_id,
                &[ExecutionStatus::Paused],
                ExecutionStatus::Running,
                None,
            )
            .await?;
        if !resumed {
            return Err(Error::Conflict("execution is not paused".to_string()));
        }

        info!(execution = %execution_id, "Execution resumed");

        match (execution.delay_started_at, execution.delay_minutes) {
            (Some(started_at), Some(minutes)) => {
                let remaining = remaining_delay(minutes, started_at, Utc::now());
                if remaining.is_zero() {
                    self.executions.clear_delay(execution_id).await?;
                    self.executions
                        .advance_step(execution_id, execution.current_step + 1)
                        .await?;
                    self.drive(execution_id).await
                } else {
                    let resume_at = Utc::now() + remaining;
                    self.executions
                        .set_delay(execution_id, resume_at, started_at, minutes)
                        .await?;
                    self.scheduler.schedule_resume(execution_id, resume_at).await;
                    debug!(
                        execution = %execution_id,
                        remaining_secs = remaining.num_seconds(),
                        "Resumed mid-delay"
                    );
                    Ok(())
                }
            }
            _ => self.drive(execution_id).await,
        }
    }

    /// Stop an execution. Immediate and terminal: all remaining steps are
    /// skipped and the stop cannot be reversed.
    pub async fn stop_execution(&self, execution_id: ExecutionId) -> Result<()> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;

        let stopped = self
            .executions
            .try_set_status(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Paused,
                ],
                ExecutionStatus::Stopped,
                None,
            )
            .await?;
        if !stopped {
            return Err(Error::Conflict("execution already finished".to_string()));
        }

        self.scheduler.cancel_resume(execution_id).await;
        info!(execution = %execution_id, "Execution stopped");
        Ok(())
    }

    /// Fire a SCHEDULE trigger: start the flow against the configured
    /// (account, conversation). A concurrency conflict is not an error -
    /// the prior execution is still running and the trigger waits for its
    /// next firing.
    pub async fn fire_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        let Some(trigger) = self.flows.get_trigger(trigger_id).await? else {
            return Err(Error::NotFound(format!("trigger {}", trigger_id)));
        };
        if !trigger.is_active {
            debug!(trigger = %trigger_id, "Trigger fired but is no longer active");
            return Ok(());
        }
        if trigger.kind_enum() != Some(TriggerKind::Schedule) {
            return Err(Error::Validation(
                "only schedule triggers fire from the scheduler".to_string(),
            ));
        }

        let config = ScheduleTriggerConfig::from_value(&trigger.config)?;
        match self
            .start_execution(trigger.flow_id, config.conversation_id, config.account_id)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(reason)) => {
                debug!(trigger = %trigger_id, %reason, "Trigger skipped: execution already active");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Start executions for every active EVENT trigger matching the event
    pub async fn activate_event_triggers(
        &self,
        conversation: &Conversation,
        event: TriggerEvent,
        content: Option<&str>,
    ) -> Result<usize> {
        let triggers = self.flows.list_active_event_triggers().await?;
        let mut started = 0usize;

        for trigger in triggers {
            let config = match EventTriggerConfig::from_value(&trigger.config) {
                Ok(c) => c,
                Err(e) => {
                    warn!(trigger = %trigger.id, error = %e, "Skipping event trigger with invalid config");
                    continue;
                }
            };
            if !config.matches(event, content) {
                continue;
            }

            match self
                .start_execution(trigger.flow_id, conversation.id, conversation.account_id)
                .await
            {
                Ok(_) => started += 1,
                Err(Error::Conflict(_)) => {
                    debug!(trigger = %trigger.id, conversation = %conversation.id, "Event trigger skipped: execution already active");
                }
                Err(e) => {
                    warn!(trigger = %trigger.id, error = %e, "Event trigger failed to start flow");
                }
            }
        }

        Ok(started)
    }

    /// Restart reconciliation: delay suspensions are re-armed by the
    /// scheduler from persisted rows; executions that died mid-step are
    /// failed for operator attention rather than blindly re-run.
    pub async fn recover(&self) -> Result<usize> {
        let orphaned = self.executions.list_orphaned_running().await?;
        let mut failed = 0usize;

        for execution in orphaned {
            warn!(execution = %execution.id, "Execution was interrupted mid-step; marking as errored");
            if self
                .executions
                .try_set_status(
                    execution.id,
                    &[ExecutionStatus::Running],
                    ExecutionStatus::Error,
                    Some("interrupted by restart before reaching a suspension point".to_string()),
                )
                .await?
            {
                failed += 1;
            }
        }

        Ok(failed)
    }

    async fn complete(&self, execution_id: ExecutionId) -> Result<()> {
        let completed = self
            .executions
            .try_set_status(
                execution_id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Completed,
                None,
            )
            .await?;
        if completed {
            self.executions.clear_delay(execution_id).await?;
            info!(execution = %execution_id, "Execution completed");
        }
        Ok(())
    }

    async fn fail(&self, execution_id: ExecutionId, reason: &str) -> Result<()> {
        let failed = self
            .executions
            .try_set_status(
                execution_id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Error,
                Some(reason.to_string()),
            )
            .await?;
        if failed {
            self.scheduler.cancel_resume(execution_id).await;
            warn!(execution = %execution_id, %reason, "Execution failed");
        }
        Ok(())
    }
}

/// Remaining wait after a pause: `max(0, original - elapsed)`
fn remaining_delay(
    delay_minutes: i64,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Duration {
    let original = Duration::minutes(delay_minutes);
    let elapsed = now - started_at;
    std::cmp::max(Duration::zero(), original - elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_harness, wait_until, EngineHandler, TestHarness};
    use chatflow_storage::models::{CreateFlow, CreateFlowStep};
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;

    fn remaining(minutes: i64, elapsed_secs: i64) -> Duration {
        let now = Utc::now();
        remaining_delay(minutes, now - Duration::seconds(elapsed_secs), now)
    }

    #[test]
    fn test_remaining_delay() {
        assert_eq!(remaining(1, 0), Duration::seconds(60));
        assert_eq!(remaining(1, 25), Duration::seconds(35));
        assert_eq!(remaining(1, 60), Duration::zero());
        assert_eq!(remaining(1, 300), Duration::zero());
    }

    async fn flow_with_steps(
        harness: &TestHarness,
        steps: Vec<(&str, FlowStepKind, serde_json::Value)>,
    ) -> FlowId {
        let flow = harness
            .flows
            .create_flow(CreateFlow {
                name: "flow".to_string(),
                description: None,
                is_active: Some(true),
            })
            .await
            .unwrap();

        for (position, (name, kind, config)) in steps.into_iter().enumerate() {
            harness
                .flows
                .add_step(CreateFlowStep {
                    flow_id: flow.id,
                    position: position as i32,
                    name: name.to_string(),
                    kind,
                    config,
                })
                .await
                .unwrap();
        }

        flow.id
    }

    fn send(template: &str) -> serde_json::Value {
        serde_json::json!({"template": template})
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_two_sends_around_a_delay() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("greet", FlowStepKind::SendMessage, send("Hi")),
                ("wait", FlowStepKind::Delay, serde_json::json!({"delay_minutes": 1})),
                ("follow-up", FlowStepKind::SendMessage, send("Follow up")),
            ],
        )
        .await;

        let handler = Arc::new(EngineHandler(harness.engine.clone()));
        let loop_handle = tokio::spawn(harness.scheduler.clone().run(handler));

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        // First send happens immediately, then the execution suspends
        assert_eq!(harness.client.sent_contents(), vec!["Hi"]);
        assert_eq!(execution.status, "running");
        assert!(execution.resume_at.is_some());

        // Nothing further before the delay elapses
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(harness.client.send_calls(), 1);

        // After >= 1 simulated minute the follow-up goes out
        tokio::time::sleep(StdDuration::from_secs(31)).await;
        wait_until(|| async { harness.client.send_calls() == 2 }).await;

        let execution = harness.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, "completed");
        assert_eq!(harness.client.sent_contents(), vec!["Hi", "Follow up"]);

        loop_handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_stop_during_delay_skips_remaining_sends() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("greet", FlowStepKind::SendMessage, send("Hi")),
                ("wait", FlowStepKind::Delay, serde_json::json!({"delay_minutes": 1})),
                ("never", FlowStepKind::SendMessage, send("You should not see this")),
            ],
        )
        .await;

        let handler = Arc::new(EngineHandler(harness.engine.clone()));
        let loop_handle = tokio::spawn(harness.scheduler.clone().run(handler));

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();
        assert_eq!(execution.status, "running");

        harness.engine.stop_execution(execution.id).await.unwrap();

        // Ride well past the delay: the stopped execution must not send
        tokio::time::sleep(StdDuration::from_secs(180)).await;
        tokio::task::yield_now().await;

        let execution = harness.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, "stopped");
        assert_eq!(harness.client.send_calls(), 1);

        loop_handle.abort();
    }

    #[tokio::test]
    async fn pause_mid_delay_then_resume_reschedules_remaining() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("wait", FlowStepKind::Delay, serde_json::json!({"delay_minutes": 10})),
                ("after", FlowStepKind::SendMessage, send("later")),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        harness.engine.pause_execution(execution.id).await.unwrap();
        // Pausing disarms the pending resume timer
        assert!(harness.scheduler.status().await.is_empty());

        // Pretend 4 of the 10 minutes had elapsed before the pause
        harness
            .executions
            .tweak(execution.id, |e| {
                e.delay_started_at = Some(Utc::now() - Duration::minutes(4));
            })
            .await;

        harness.engine.resume_execution(execution.id).await.unwrap();

        let jobs = harness.scheduler.status().await;
        assert_eq!(jobs.len(), 1);
        let wait = jobs[0].fire_at - Utc::now();
        assert!(
            wait > Duration::minutes(5) && wait <= Duration::minutes(6),
            "expected ~6 minutes of remaining delay, got {}s",
            wait.num_seconds()
        );
    }

    #[tokio::test]
    async fn resume_after_delay_fully_elapsed_advances_immediately() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("wait", FlowStepKind::Delay, serde_json::json!({"delay_minutes": 1})),
                ("after", FlowStepKind::SendMessage, send("later")),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();
        harness.engine.pause_execution(execution.id).await.unwrap();

        harness
            .executions
            .tweak(execution.id, |e| {
                e.delay_started_at = Some(Utc::now() - Duration::minutes(5));
            })
            .await;

        harness.engine.resume_execution(execution.id).await.unwrap();

        let execution = harness.executions.get(execution.id).await.unwrap().unwrap();
        assert_eq!(execution.status, "completed");
        assert_eq!(harness.client.sent_contents(), vec!["later"]);
    }

    #[tokio::test]
    async fn send_failure_halts_execution_with_error() {
        let harness = test_harness().await;
        harness.client.fail_sends_to(&harness.remote_address, 100);
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("greet", FlowStepKind::SendMessage, send("Hi")),
                ("after", FlowStepKind::SendMessage, send("never")),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        assert_eq!(execution.status, "error");
        assert!(execution.last_error.unwrap().contains("greet"));
    }

    #[tokio::test]
    async fn condition_branches_forward_or_exits() {
        let harness = test_harness().await;
        harness
            .conversations
            .set_attribute(harness.conversation_id, "plan", serde_json::json!("premium"))
            .await
            .unwrap();

        let flow_id = flow_with_steps(
            &harness,
            vec![
                (
                    "route",
                    FlowStepKind::Condition,
                    serde_json::json!({"clauses": [
                        {"field": "attributes.plan", "op": "eq", "value": "premium", "goto_step": "vip"},
                    ]}),
                ),
                ("generic", FlowStepKind::SendMessage, send("hello")),
                ("vip", FlowStepKind::SendMessage, send("hello vip")),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        assert_eq!(execution.status, "completed");
        // Jumped over "generic" straight to "vip"
        assert_eq!(harness.client.sent_contents(), vec!["hello vip"]);
    }

    #[tokio::test]
    async fn condition_cannot_move_the_cursor_backwards() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                ("greet", FlowStepKind::SendMessage, send("hello")),
                (
                    "loop-back",
                    FlowStepKind::Condition,
                    serde_json::json!({"clauses": [
                        {"field": "contact_name", "op": "exists", "goto_step": "greet"},
                    ]}),
                ),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        assert_eq!(execution.status, "error");
        assert!(execution.last_error.unwrap().contains("backwards"));
        // The cursor never moved back below the condition step
        assert_eq!(execution.current_step, 1);
        assert_eq!(harness.client.send_calls(), 1);
    }

    #[tokio::test]
    async fn condition_without_match_exits_gracefully() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![
                (
                    "route",
                    FlowStepKind::Condition,
                    serde_json::json!({"clauses": [
                        {"field": "attributes.plan", "op": "eq", "value": "premium", "goto_step": "vip"},
                    ]}),
                ),
                ("vip", FlowStepKind::SendMessage, send("hello vip")),
            ],
        )
        .await;

        let execution = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        assert_eq!(execution.status, "completed");
        assert_eq!(harness.client.send_calls(), 0);
    }

    #[tokio::test]
    async fn action_step_mutates_conversation() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![(
                "tag",
                FlowStepKind::Action,
                serde_json::json!({"action": "add_tag", "tag": "welcomed"}),
            )],
        )
        .await;

        harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        let conversation = harness
            .conversations
            .get(harness.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.tags_vec().contains(&"welcomed".to_string()));
    }

    #[tokio::test]
    async fn second_start_for_same_pair_conflicts() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(
            &harness,
            vec![("wait", FlowStepKind::Delay, serde_json::json!({"delay_minutes": 5}))],
        )
        .await;

        harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap();

        let err = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn inactive_flow_refuses_to_start() {
        let harness = test_harness().await;
        let flow_id = flow_with_steps(&harness, vec![]).await;
        harness.flows.set_flow_active(flow_id, false).await.unwrap();

        let err = harness
            .engine
            .start_execution(flow_id, harness.conversation_id, harness.account_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
