use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::WorkflowEngine;
use crate::model::StepExecution;
use crate::pool::Job;
use crate::Result;

/// Runs one processing pass over an execution.
pub struct ExecutionJob {
    engine: Arc<WorkflowEngine>,
    tenant_id: String,
    execution_id: Uuid,
}

impl ExecutionJob {
    pub fn new(engine: Arc<WorkflowEngine>, tenant_id: impl Into<String>, execution_id: Uuid) -> Self {
        Self {
            engine,
            tenant_id: tenant_id.into(),
            execution_id,
        }
    }
}

#[async_trait]
impl Job for ExecutionJob {
    fn describe(&self) -> String {
        format!("execution {}/{}", self.tenant_id, self.execution_id)
    }

    async fn process(&self) -> Result<()> {
        self.engine.process_execution(&self.tenant_id, self.execution_id).await
    }
}

/// Resumes a step whose delay or retry backoff has elapsed as of `due_at`.
pub struct StepJob {
    engine: Arc<WorkflowEngine>,
    step: StepExecution,
    due_at: DateTime<Utc>,
}

impl StepJob {
    pub fn new(engine: Arc<WorkflowEngine>, step: StepExecution, due_at: DateTime<Utc>) -> Self {
        Self { engine, step, due_at }
    }
}

#[async_trait]
impl Job for StepJob {
    fn describe(&self) -> String {
        format!("step {} of execution {}", self.step.step_id, self.step.execution_id)
    }

    async fn process(&self) -> Result<()> {
        self.engine.resume_step(&self.step, self.due_at).await
    }
}
