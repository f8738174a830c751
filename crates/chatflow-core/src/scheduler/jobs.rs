//! Job Scheduler - fires time-based work without drift or duplication
//!
//! Jobs live in a priority queue keyed by next-fire time. Registration is
//! idempotent per job key: re-registering replaces the prior timer via a
//! generation counter, and stale heap entries are skipped on pop. All
//! scheduler state is derivable from persisted rows alone - `initialize`
//! rebuilds it after a restart.

use super::schedule::Schedule;
use crate::flow::trigger::ScheduleTriggerConfig;
use async_trait::async_trait;
use chatflow_common::types::{CampaignId, ExecutionId, TriggerId};
use chatflow_common::{Error, Result};
use chatflow_storage::models::{CampaignStatus, ExecutionStatus, FlowTrigger};
use chatflow_storage::repository::{CampaignRepository, ExecutionRepository, FlowRepository};
use chrono::{DateTime, Utc};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// What a registered timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKey {
    /// A SCHEDULE trigger of a flow
    Trigger(TriggerId),
    /// Deferred start of a campaign
    Campaign(CampaignId),
    /// Resume of a flow execution suspended in a delay
    Execution(ExecutionId),
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKey::Trigger(id) => write!(f, "trigger:{}", id),
            JobKey::Campaign(id) => write!(f, "campaign:{}", id),
            JobKey::Execution(id) => write!(f, "execution:{}", id),
        }
    }
}

/// Downstream dispatch target for fired jobs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn fire_trigger(&self, trigger_id: TriggerId) -> Result<()>;
    async fn start_campaign(&self, campaign_id: CampaignId) -> Result<()>;
    async fn resume_execution(&self, execution_id: ExecutionId) -> Result<()>;
}

#[derive(Debug)]
struct HeapEntry {
    fire_at: DateTime<Utc>,
    seq: u64,
    generation: u64,
    key: JobKey,
}

// Min-heap ordering on (fire_at, seq)
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

#[derive(Default)]
struct State {
    heap: BinaryHeap<HeapEntry>,
    /// Current generation per key; heap entries with an older generation
    /// are cancelled or replaced and get skipped on pop
    generations: HashMap<JobKey, u64>,
    next_generation: u64,
    next_seq: u64,
}

impl State {
    fn register(&mut self, key: JobKey, fire_at: DateTime<Utc>) {
        self.next_generation += 1;
        self.next_seq += 1;
        self.generations.insert(key, self.next_generation);
        self.heap.push(HeapEntry {
            fire_at,
            seq: self.next_seq,
            generation: self.next_generation,
            key,
        });
    }

    fn cancel(&mut self, key: &JobKey) -> bool {
        self.generations.remove(key).is_some()
    }

    /// Drop stale entries off the top and return the next live fire time
    fn peek_next(&mut self) -> Option<DateTime<Utc>> {
        while let Some(top) = self.heap.peek() {
            if self.generations.get(&top.key) == Some(&top.generation) {
                return Some(top.fire_at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every live entry due at or before `threshold`, consuming its
    /// registration
    fn take_due(&mut self, threshold: DateTime<Utc>) -> Vec<HeapEntry> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.fire_at > threshold {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            if self.generations.get(&entry.key) == Some(&entry.generation) {
                self.generations.remove(&entry.key);
                due.push(entry);
            }
        }
        due
    }
}

/// Status snapshot of a registered job
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: String,
    pub fire_at: DateTime<Utc>,
}

/// Job Scheduler
pub struct JobScheduler {
    flows: Arc<dyn FlowRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    executions: Arc<dyn ExecutionRepository>,
    state: Mutex<State>,
    notify: Notify,
}

impl JobScheduler {
    /// Create a new scheduler
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        executions: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            flows,
            campaigns,
            executions,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Register a timer for a job key, replacing any prior registration
    pub async fn register_at(&self, key: JobKey, fire_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.register(key, fire_at);
        drop(state);
        debug!(job = %key, %fire_at, "Job registered");
        self.notify.notify_one();
    }

    /// Cancel a registered timer; a no-op if none exists
    pub async fn cancel(&self, key: JobKey) {
        let removed = self.state.lock().await.cancel(&key);
        if removed {
            debug!(job = %key, "Job cancelled");
        }
        self.notify.notify_one();
    }

    /// Register exactly one timer for the trigger from its stored config.
    /// Calling again for the same trigger replaces the prior timer.
    pub async fn schedule_trigger(&self, trigger: &FlowTrigger) -> Result<()> {
        let config = ScheduleTriggerConfig::from_value(&trigger.config)?;
        let fire_at = config
            .schedule
            .next_fire(Utc::now())
            .ok_or_else(|| Error::Validation("schedule never fires".to_string()))?;
        self.register_at(JobKey::Trigger(trigger.id), fire_at).await;
        Ok(())
    }

    /// Reload the trigger's persisted config and re-register. Deschedules
    /// the trigger when it (or its flow) is gone or inactive, or when a
    /// one-shot schedule is exhausted.
    pub async fn reschedule_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        let trigger = match self.flows.get_trigger(trigger_id).await? {
            Some(t) if t.is_active => t,
            _ => {
                self.cancel(JobKey::Trigger(trigger_id)).await;
                return Ok(());
            }
        };

        let flow_active = self
            .flows
            .get_flow(trigger.flow_id)
            .await?
            .map(|f| f.is_active)
            .unwrap_or(false);
        if !flow_active {
            self.cancel(JobKey::Trigger(trigger_id)).await;
            return Ok(());
        }

        self.schedule_trigger(&trigger).await
    }

    /// Register a one-shot start for a deferred campaign
    pub async fn schedule_campaign(&self, campaign_id: CampaignId, fire_at: DateTime<Utc>) {
        self.register_at(JobKey::Campaign(campaign_id), fire_at).await;
    }

    /// Register a one-shot resume for a suspended execution
    pub async fn schedule_resume(&self, execution_id: ExecutionId, fire_at: DateTime<Utc>) {
        self.register_at(JobKey::Execution(execution_id), fire_at).await;
    }

    /// Cancel a pending resume for an execution
    pub async fn cancel_resume(&self, execution_id: ExecutionId) {
        self.cancel(JobKey::Execution(execution_id)).await;
    }

    /// Cancel a pending deferred start for a campaign
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) {
        self.cancel(JobKey::Campaign(campaign_id)).await;
    }

    /// Rebuild all timers from persisted rows. Safe to call repeatedly:
    /// re-registration replaces rather than duplicates.
    pub async fn initialize(&self) -> Result<()> {
        let triggers = self.flows.list_active_schedule_triggers().await?;
        let mut scheduled = 0usize;
        for trigger in &triggers {
            match self.schedule_trigger(trigger).await {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(trigger = %trigger.id, error = %e, "Skipping trigger with invalid schedule"),
            }
        }

        let deferred = self.campaigns.list_by_status(CampaignStatus::Scheduled).await?;
        for campaign in &deferred {
            let fire_at = campaign.scheduled_at.unwrap_or_else(Utc::now);
            self.schedule_campaign(campaign.id, fire_at).await;
        }

        let suspended = self.executions.list_suspended().await?;
        let mut resumes = 0usize;
        for execution in &suspended {
            // Paused executions wait for an explicit resume
            if execution.status_enum() != Some(ExecutionStatus::Running) {
                continue;
            }
            if let Some(resume_at) = execution.resume_at {
                self.schedule_resume(execution.id, resume_at).await;
                resumes += 1;
            }
        }

        info!(
            triggers = scheduled,
            campaigns = deferred.len(),
            resumes,
            "Scheduler initialized from persisted state"
        );
        Ok(())
    }

    /// Cancel every registered timer
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        let count = state.generations.len();
        *state = State::default();
        drop(state);
        self.notify.notify_one();
        info!(cancelled = count, "All scheduled jobs stopped");
    }

    /// Snapshot of registered jobs for the administrative surface
    pub async fn status(&self) -> Vec<JobStatus> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobStatus> = state
            .heap
            .iter()
            .filter(|e| state.generations.get(&e.key) == Some(&e.generation))
            .map(|e| JobStatus {
                job: e.key.to_string(),
                fire_at: e.fire_at,
            })
            .collect();
        jobs.sort_by_key(|j| j.fire_at);
        jobs
    }

    /// Run the scheduler loop, dispatching due jobs into the handler.
    ///
    /// A firing never blocks the clock: dispatch runs on its own task. For
    /// recurring triggers the next occurrence is computed only once the
    /// dispatch call returns, so firings of one trigger never overlap, and
    /// a failed dispatch simply waits for its next natural firing.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn JobHandler>) {
        info!("Job scheduler started");

        loop {
            let next = self.state.lock().await.peek_next();

            let Some(fire_at) = next else {
                self.notify.notified().await;
                continue;
            };

            let now = Utc::now();
            if fire_at > now {
                let wait = (fire_at - now).to_std().unwrap_or(StdDuration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.notify.notified() => continue,
                }
            }

            let threshold = fire_at.max(Utc::now());
            let due = self.state.lock().await.take_due(threshold);

            for entry in due {
                self.clone().dispatch(entry.key, handler.clone());
            }
        }
    }

    fn dispatch(self: Arc<Self>, key: JobKey, handler: Arc<dyn JobHandler>) {
        tokio::spawn(async move {
            debug!(job = %key, "Dispatching job");
            match key {
                JobKey::Trigger(trigger_id) => {
                    if let Err(e) = handler.fire_trigger(trigger_id).await {
                        warn!(trigger = %trigger_id, error = %e, "Trigger dispatch failed; awaiting next firing");
                    }
                    // Serialized per trigger: only re-register once the
                    // dispatch above has returned
                    if let Err(e) = self.finish_trigger_firing(trigger_id).await {
                        warn!(trigger = %trigger_id, error = %e, "Trigger rescheduling failed");
                    }
                }
                JobKey::Campaign(campaign_id) => {
                    if let Err(e) = handler.start_campaign(campaign_id).await {
                        warn!(campaign = %campaign_id, error = %e, "Deferred campaign start failed");
                    }
                }
                JobKey::Execution(execution_id) => {
                    if let Err(e) = handler.resume_execution(execution_id).await {
                        warn!(execution = %execution_id, error = %e, "Execution resume failed");
                    }
                }
            }
        });
    }

    /// After a firing: deactivate exhausted one-shots, re-register the rest
    async fn finish_trigger_firing(&self, trigger_id: TriggerId) -> Result<()> {
        let trigger = match self.flows.get_trigger(trigger_id).await? {
            Some(t) if t.is_active => t,
            _ => return Ok(()),
        };

        let config = ScheduleTriggerConfig::from_value(&trigger.config)?;
        if config.schedule.is_one_shot() {
            // A fired one-shot must not re-fire after the next restart
            self.flows.set_trigger_active(trigger_id, false).await?;
            return Ok(());
        }

        self.reschedule_trigger(trigger_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        MemoryCampaignRepository, MemoryExecutionRepository, MemoryFlowRepository,
        RecordingHandler,
    };
    use chatflow_storage::models::{CreateFlow, CreateFlowTrigger, TriggerKind};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn scheduler_with_trigger(
        schedule: serde_json::Value,
    ) -> (Arc<JobScheduler>, Arc<MemoryFlowRepository>, FlowTrigger) {
        let flows = Arc::new(MemoryFlowRepository::new());
        let campaigns = Arc::new(MemoryCampaignRepository::new());
        let executions = Arc::new(MemoryExecutionRepository::new());

        let flow = flows
            .create_flow(CreateFlow {
                name: "welcome".to_string(),
                description: None,
                is_active: Some(true),
            })
            .await
            .unwrap();

        let trigger = flows
            .add_trigger(CreateFlowTrigger {
                flow_id: flow.id,
                kind: TriggerKind::Schedule,
                config: serde_json::json!({
                    "schedule": schedule,
                    "account_id": uuid::Uuid::new_v4(),
                    "conversation_id": uuid::Uuid::new_v4(),
                }),
                is_active: Some(true),
            })
            .await
            .unwrap();

        let scheduler = Arc::new(JobScheduler::new(flows.clone(), campaigns, executions));
        (scheduler, flows, trigger)
    }

    #[tokio::test]
    async fn initialize_twice_registers_one_timer_per_trigger() {
        let (scheduler, _flows, trigger) =
            scheduler_with_trigger(serde_json::json!({"type": "every", "minutes": 5})).await;

        scheduler.initialize().await.unwrap();
        scheduler.initialize().await.unwrap();

        let jobs = scheduler.status().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job, format!("trigger:{}", trigger.id));
    }

    #[tokio::test]
    async fn reregistration_replaces_prior_timer() {
        let (scheduler, _flows, trigger) =
            scheduler_with_trigger(serde_json::json!({"type": "every", "minutes": 5})).await;

        let key = JobKey::Trigger(trigger.id);
        scheduler.register_at(key, Utc::now() + Duration::minutes(10)).await;
        scheduler.register_at(key, Utc::now() + Duration::minutes(1)).await;

        let jobs = scheduler.status().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].fire_at <= Utc::now() + Duration::minutes(2));
    }

    #[tokio::test]
    async fn stop_all_cancels_everything() {
        let (scheduler, _flows, _trigger) =
            scheduler_with_trigger(serde_json::json!({"type": "every", "minutes": 5})).await;

        scheduler.initialize().await.unwrap();
        scheduler
            .schedule_campaign(uuid::Uuid::new_v4(), Utc::now() + Duration::minutes(1))
            .await;
        assert_eq!(scheduler.status().await.len(), 2);

        scheduler.stop_all().await;
        assert!(scheduler.status().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn once_trigger_fires_once_and_deactivates() {
        let (scheduler, flows, trigger) = scheduler_with_trigger(serde_json::json!({
            "type": "once",
            "fire_at": Utc::now() + Duration::seconds(2),
        }))
        .await;

        scheduler.initialize().await.unwrap();

        let handler = Arc::new(RecordingHandler::new());
        let loop_handle = tokio::spawn(scheduler.clone().run(handler.clone()));

        handler.wait_for_triggers(1).await;
        // Give the post-dispatch bookkeeping a moment to settle
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(handler.fired_triggers(), vec![trigger.id]);
        let stored = flows.get_trigger(trigger.id).await.unwrap().unwrap();
        assert!(!stored.is_active, "fired one-shot must deactivate");
        assert!(scheduler.status().await.is_empty());

        loop_handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dispatch_keeps_recurring_trigger_scheduled() {
        let (scheduler, _flows, trigger) =
            scheduler_with_trigger(serde_json::json!({"type": "every", "minutes": 1})).await;

        scheduler.initialize().await.unwrap();

        let handler = Arc::new(RecordingHandler::failing());
        let loop_handle = tokio::spawn(scheduler.clone().run(handler.clone()));

        handler.wait_for_triggers(1).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        // Still registered for its next natural firing
        let jobs = scheduler.status().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job, format!("trigger:{}", trigger.id));

        loop_handle.abort();
    }
}
