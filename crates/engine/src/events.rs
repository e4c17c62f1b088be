//! Lifecycle events for executions and steps.
//!
//! The engine publishes a record of every terminal step or execution
//! transition. A publisher that fails is logged by the engine and never fails
//! the step that produced the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{ExecutionStatus, StepExecution, StepStatus, StepType, WorkflowExecution};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepEvent {
    pub fn from_step(execution: &WorkflowExecution, step: &StepExecution) -> Self {
        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            tenant_id: execution.tenant_id.clone(),
            step_id: step.step_id.clone(),
            step_type: step.step_type.clone(),
            status: step.status,
            duration_ms: step.duration_ms(),
            result: step.result.clone(),
            error: step.error_message.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub steps_executed: usize,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn from_execution(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            tenant_id: execution.tenant_id.clone(),
            status: execution.status,
            steps_executed: execution
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            duration_ms: execution.duration_ms(),
            error_message: execution.error_message.clone(),
            failed_step_id: execution.failed_step_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    #[serde(rename = "workflow.execution.started")]
    ExecutionStarted(ExecutionEvent),
    #[serde(rename = "workflow.execution.completed")]
    ExecutionCompleted(ExecutionEvent),
    #[serde(rename = "workflow.execution.failed")]
    ExecutionFailed(ExecutionEvent),
    #[serde(rename = "workflow.execution.cancelled")]
    ExecutionCancelled(ExecutionEvent),
    #[serde(rename = "workflow.step.executed")]
    StepExecuted(StepEvent),
    #[serde(rename = "workflow.step.failed")]
    StepFailed(StepEvent),
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::ExecutionStarted(_) => "workflow.execution.started",
            WorkflowEvent::ExecutionCompleted(_) => "workflow.execution.completed",
            WorkflowEvent::ExecutionFailed(_) => "workflow.execution.failed",
            WorkflowEvent::ExecutionCancelled(_) => "workflow.execution.cancelled",
            WorkflowEvent::StepExecuted(_) => "workflow.step.executed",
            WorkflowEvent::StepFailed(_) => "workflow.step.failed",
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted(e)
            | WorkflowEvent::ExecutionCompleted(e)
            | WorkflowEvent::ExecutionFailed(e)
            | WorkflowEvent::ExecutionCancelled(e) => e.execution_id,
            WorkflowEvent::StepExecuted(e) | WorkflowEvent::StepFailed(e) => e.execution_id,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: WorkflowEvent) -> Result<()>;
}

/// Fans events out to in-process subscribers.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: WorkflowEvent) -> Result<()> {
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            debug!("Dropped workflow event: no subscribers");
        }
        Ok(())
    }
}

/// Writes each event to the log.
#[derive(Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: WorkflowEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        info!(
            event_type = event.event_type(),
            execution_id = %event.execution_id(),
            "{}",
            payload
        );
        Ok(())
    }
}
