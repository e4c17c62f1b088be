use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{StepType, Workflow, WorkflowStep};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "paused" => Ok(ExecutionStatus::Paused),
            _ => Err(Error::Persistence(format!("Invalid execution status: {}", s))),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
            ExecutionStatus::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Retrying,
}

impl std::str::FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "paused" => Ok(StepStatus::Paused),
            "retrying" => Ok(StepStatus::Retrying),
            _ => Err(Error::Persistence(format!("Invalid step status: {}", s))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Paused => write!(f, "paused"),
            StepStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// Data a trigger carries about who the execution is for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub subscriber: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Non-empty string value of a subscriber attribute.
    pub fn subscriber_field(&self, key: &str) -> Option<&str> {
        self.subscriber
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub trigger_id: String,
    pub status: ExecutionStatus,
    pub payload: Value,
    pub context: ExecutionContext,
    pub steps: Vec<StepExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failed_step_id: Option<String>,
}

impl WorkflowExecution {
    pub fn new(
        workflow: &Workflow,
        trigger_id: impl Into<String>,
        payload: Value,
        context: ExecutionContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id.clone(),
            trigger_id: trigger_id.into(),
            status: ExecutionStatus::Pending,
            payload,
            context,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            failed_step_id: None,
        }
    }

    /// Moves to running. Calling it on a running execution is a no-op so a
    /// resumed pass can call it unconditionally.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ExecutionStatus::Running => Ok(()),
            ExecutionStatus::Pending | ExecutionStatus::Paused => {
                self.status = ExecutionStatus::Running;
                self.started_at.get_or_insert(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.transition_error(ExecutionStatus::Running)),
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ExecutionStatus::Running {
            return Err(self.transition_error(ExecutionStatus::Completed));
        }
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(
        &mut self,
        error: impl Into<String>,
        failed_step_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(ExecutionStatus::Failed));
        }
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.into());
        self.failed_step_id = failed_step_id;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(ExecutionStatus::Cancelled));
        }
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Sends a failed execution back to pending. Step rows are reset by the
    /// caller through [`StepExecution::reset_for_retry`].
    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ExecutionStatus::Failed {
            return Err(self.transition_error(ExecutionStatus::Pending));
        }
        self.status = ExecutionStatus::Pending;
        self.error_message = None;
        self.failed_step_id = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Latest row recorded for a workflow step.
    pub fn step_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().rev().find(|s| s.step_id == step_id)
    }

    pub fn duration_ms(&self) -> i64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }

    fn transition_error(&self, to: ExecutionStatus) -> Error {
        Error::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub delay_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn new(execution: &WorkflowExecution, step: &WorkflowStep, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            tenant_id: execution.tenant_id.clone(),
            step_id: step.id.clone(),
            step_type: step.step_type(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            retry_count: 0,
            delay_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.updated_at = now;
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error_message = None;
        self.delay_until = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(error.into());
        self.delay_until = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Parks a step until the scheduler picks it up again. The step stays
    /// pending while it waits.
    pub fn park(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = StepStatus::Pending;
        self.delay_until = Some(until);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, error: impl Into<String>, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = StepStatus::Retrying;
        self.error_message = Some(error.into());
        self.delay_until = Some(until);
        self.updated_at = now;
    }

    /// Clears a delay so the next walk dispatches the step again.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Pending;
        self.delay_until = None;
        self.updated_at = now;
    }

    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Pending;
        self.error_message = None;
        self.completed_at = None;
        self.delay_until = None;
        self.retry_count += 1;
        self.updated_at = now;
    }

    pub fn is_parked(&self) -> bool {
        self.delay_until.is_some() && matches!(self.status, StepStatus::Pending | StepStatus::Retrying)
    }

    pub fn duration_ms(&self) -> i64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }
}
