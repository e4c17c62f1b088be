use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    model::{ExecutionStatus, StepExecution, Workflow, WorkflowExecution, WorkflowSchedule},
    store::{
        claim_lease, ExecutionFilter, ExecutionRepository, ScheduleRepository, Store, WorkflowRepository,
    },
    Error, Result,
};

struct ExecutionRecord {
    execution: WorkflowExecution,
    step_ids: Vec<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Step progress counts as execution progress for the stale-execution sweep.
    fn touch(&mut self, at: DateTime<Utc>) {
        if self.execution.updated_at < at {
            self.execution.updated_at = at;
        }
        self.claimed_at = None;
    }
}

struct StepRecord {
    step: StepExecution,
    claimed_at: Option<DateTime<Utc>>,
}

struct ScheduleRecord {
    schedule: WorkflowSchedule,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, Workflow>,
    executions: HashMap<Uuid, ExecutionRecord>,
    steps: HashMap<Uuid, StepRecord>,
    schedules: HashMap<Uuid, ScheduleRecord>,
}

impl State {
    fn assemble(&self, record: &ExecutionRecord) -> WorkflowExecution {
        let mut execution = record.execution.clone();
        execution.steps = record
            .step_ids
            .iter()
            .filter_map(|id| self.steps.get(id))
            .map(|r| r.step.clone())
            .collect();
        execution
    }

    fn has_parked_step(&self, record: &ExecutionRecord) -> bool {
        record
            .step_ids
            .iter()
            .filter_map(|id| self.steps.get(id))
            .any(|r| r.step.is_parked())
    }
}

/// Process-local store. Holds everything behind one lock; suited to tests
/// and single-node experiments.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut state = self.state.write().await;
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, tenant_id: &str, id: Uuid) -> Result<Option<Workflow>> {
        let state = self.state.read().await;
        Ok(state
            .workflows
            .get(&id)
            .filter(|w| w.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_workflow_by_trigger(&self, tenant_id: &str, identifier: &str) -> Result<Option<Workflow>> {
        let state = self.state.read().await;
        Ok(state
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.trigger.identifier == identifier && w.is_active())
            .max_by_key(|w| w.updated_at)
            .cloned())
    }

    async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<Workflow>> {
        let state = self.state.read().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn delete_workflow(&self, tenant_id: &str, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.workflows.get(&id).map_or(false, |w| w.tenant_id == tenant_id) {
            return Ok(false);
        }
        state.workflows.remove(&id);
        state.schedules.retain(|_, r| r.schedule.workflow_id != id);
        Ok(true)
    }
}

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let mut stored = execution.clone();
        stored.steps.clear();
        state.executions.insert(
            execution.id,
            ExecutionRecord {
                execution: stored,
                step_ids: Vec::new(),
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn get_execution(&self, tenant_id: &str, id: Uuid) -> Result<Option<WorkflowExecution>> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .get(&id)
            .filter(|r| r.execution.tenant_id == tenant_id)
            .map(|r| state.assemble(r)))
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| Error::ExecutionNotFound(execution.id.to_string()))?;
        let mut stored = execution.clone();
        stored.steps.clear();
        record.execution = stored;
        record.claimed_at = None;
        Ok(())
    }

    async fn list_executions(&self, tenant_id: &str, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let state = self.state.read().await;
        let mut executions: Vec<WorkflowExecution> = state
            .executions
            .values()
            .filter(|r| r.execution.tenant_id == tenant_id)
            .filter(|r| filter.status.map_or(true, |s| r.execution.status == s))
            .filter(|r| filter.workflow_id.map_or(true, |w| r.execution.workflow_id == w))
            .map(|r| state.assemble(r))
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(filter.limit_or_default().max(0) as usize);
        Ok(executions)
    }

    async fn get_failed_executions(&self, tenant_id: &str, limit: i64) -> Result<Vec<WorkflowExecution>> {
        let filter = ExecutionFilter {
            limit: Some(limit),
            ..ExecutionFilter::with_status(ExecutionStatus::Failed)
        };
        self.list_executions(tenant_id, &filter).await
    }

    async fn get_pending_executions(&self, stale_before: DateTime<Utc>, limit: i64) -> Result<Vec<WorkflowExecution>> {
        let mut state = self.state.write().await;
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
            .executions
            .values()
            .filter(|r| matches!(r.execution.status, ExecutionStatus::Pending | ExecutionStatus::Running))
            .filter(|r| r.execution.updated_at <= stale_before)
            .filter(|r| r.claimed_at.map_or(true, |c| c <= stale_before))
            .filter(|r| !state.has_parked_step(r))
            .map(|r| (r.execution.updated_at, r.execution.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit.max(0) as usize);

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = state.executions.get_mut(&id) {
                record.claimed_at = Some(now);
            }
            if let Some(record) = state.executions.get(&id) {
                claimed.push(state.assemble(record));
            }
        }
        Ok(claimed)
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .get_mut(&step.execution_id)
            .ok_or_else(|| Error::ExecutionNotFound(step.execution_id.to_string()))?;
        record.step_ids.push(step.id);
        record.touch(step.updated_at);
        state.steps.insert(
            step.id,
            StepRecord {
                step: step.clone(),
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| Error::Persistence(format!("step execution not found: {}", step.id)))?;
        record.step = step.clone();
        record.claimed_at = None;
        if let Some(execution) = state.executions.get_mut(&step.execution_id) {
            execution.touch(step.updated_at);
        }
        Ok(())
    }

    async fn get_delayed_step_executions(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<StepExecution>> {
        let lease_expired_before = now - claim_lease();
        let mut state = self.state.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .steps
            .values()
            .filter(|r| r.step.is_parked())
            .filter(|r| r.step.delay_until.map_or(false, |d| d <= now))
            .filter(|r| r.claimed_at.map_or(true, |c| c <= lease_expired_before))
            .filter_map(|r| r.step.delay_until.map(|d| (d, r.step.id)))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = state.steps.get_mut(&id) {
                record.claimed_at = Some(now);
                claimed.push(record.step.clone());
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl ScheduleRepository for MemoryStore {
    async fn create_schedule(&self, schedule: &WorkflowSchedule) -> Result<()> {
        let mut state = self.state.write().await;
        state.schedules.insert(
            schedule.id,
            ScheduleRecord {
                schedule: schedule.clone(),
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn get_schedule(&self, tenant_id: &str, id: Uuid) -> Result<Option<WorkflowSchedule>> {
        let state = self.state.read().await;
        Ok(state
            .schedules
            .get(&id)
            .map(|r| &r.schedule)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_schedules(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Vec<WorkflowSchedule>> {
        let state = self.state.read().await;
        let mut schedules: Vec<WorkflowSchedule> = state
            .schedules
            .values()
            .map(|r| &r.schedule)
            .filter(|s| s.tenant_id == tenant_id && s.workflow_id == workflow_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn delete_schedule(&self, tenant_id: &str, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.schedules.get(&id).map_or(false, |r| r.schedule.tenant_id == tenant_id) {
            return Ok(false);
        }
        state.schedules.remove(&id);
        Ok(true)
    }

    async fn update_schedule(&self, schedule: &WorkflowSchedule) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| Error::ScheduleNotFound(schedule.id.to_string()))?;
        record.schedule = schedule.clone();
        record.claimed_at = None;
        Ok(())
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WorkflowSchedule>> {
        let lease_expired_before = now - claim_lease();
        let mut state = self.state.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .schedules
            .values()
            .filter(|r| r.schedule.is_active && r.schedule.next_execution_at <= now)
            .filter(|r| r.claimed_at.map_or(true, |c| c <= lease_expired_before))
            .map(|r| (r.schedule.next_execution_at, r.schedule.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = state.schedules.get_mut(&id) {
                record.claimed_at = Some(now);
                claimed.push(record.schedule.clone());
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
