//! Execution coordinator.
//!
//! The engine never holds execution state between steps. Every pass loads the
//! execution from its tenant store, asks [`walk::next_action`] what to do,
//! performs exactly that one action, persists it, and hands the next pass to
//! the worker pool as a fresh [`ExecutionJob`].

pub mod context;
mod jobs;
mod retry;
mod walk;

pub use jobs::{ExecutionJob, StepJob};
pub use retry::RetryPolicy;
pub use walk::{next_action, NextAction};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatcher::{StepDispatcher, StepOutcome};
use crate::events::{EventPublisher, ExecutionEvent, StepEvent, WorkflowEvent};
use crate::metrics;
use crate::model::{
    ExecutionContext, ExecutionStatus, ScheduleDefinition, StepExecution, StepStatus, StepType, Workflow,
    WorkflowDefinition, WorkflowExecution, WorkflowSchedule, WorkflowStep,
};
use crate::pool::JobSubmitter;
use crate::store::{ExecutionFilter, Store, TenantStores};
use crate::{Error, Result};

pub struct WorkflowEngine {
    stores: TenantStores,
    dispatcher: StepDispatcher,
    events: Arc<dyn EventPublisher>,
    submitter: Arc<dyn JobSubmitter>,
    retry: RetryPolicy,
    step_timeout: Duration,
    /// Executions with a pass running in this process, flagged when another
    /// pass was requested meanwhile.
    in_flight: Mutex<HashMap<Uuid, bool>>,
}

/// Marks an execution as having a pass in flight until released or dropped.
struct PassGuard<'a> {
    in_flight: &'a Mutex<HashMap<Uuid, bool>>,
    execution_id: Uuid,
    released: bool,
}

impl PassGuard<'_> {
    /// Consumes a pending rerun request, or releases the execution when there
    /// is none. Both happen under one lock so no request is lost.
    fn rerun_requested(&mut self) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.get_mut(&self.execution_id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                in_flight.remove(&self.execution_id);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.execution_id);
        }
    }
}

/// Replaces the snapshot of `row` held on the execution, or appends it.
fn record_step(execution: &mut WorkflowExecution, row: &StepExecution) {
    match execution.steps.iter_mut().find(|s| s.id == row.id) {
        Some(existing) => *existing = row.clone(),
        None => execution.steps.push(row.clone()),
    }
}

impl WorkflowEngine {
    pub fn new(
        stores: TenantStores,
        dispatcher: StepDispatcher,
        events: Arc<dyn EventPublisher>,
        submitter: Arc<dyn JobSubmitter>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            dispatcher,
            events,
            submitter,
            retry: RetryPolicy::from_config(config),
            step_timeout: config.step_timeout,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn stores(&self) -> &TenantStores {
        &self.stores
    }

    /// True while a processing pass or step resume for the execution is
    /// running in this process.
    pub fn is_in_flight(&self, execution_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&execution_id)
    }

    /// Claims the execution for this pass. When a pass is already in flight
    /// the request is recorded on it instead and `None` is returned.
    fn begin_pass(&self, execution_id: Uuid) -> Option<PassGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rerun) = in_flight.get_mut(&execution_id) {
            *rerun = true;
            return None;
        }
        in_flight.insert(execution_id, false);
        Some(PassGuard {
            in_flight: &self.in_flight,
            execution_id,
            released: false,
        })
    }

    /// Runs passes until no further pass was requested while they ran.
    async fn run_passes(
        self: &Arc<Self>,
        guard: &mut PassGuard<'_>,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<()> {
        loop {
            self.run_pass(tenant_id, execution_id).await?;
            if !guard.rerun_requested() {
                return Ok(());
            }
        }
    }

    /// Validates and stores a definition as a draft workflow.
    pub async fn save_workflow(&self, tenant_id: &str, definition: WorkflowDefinition) -> Result<Workflow> {
        check_tenant(&definition, tenant_id)?;

        let workflow = definition.into_workflow(tenant_id);
        workflow.validate()?;
        self.stores.for_tenant(tenant_id).save_workflow(&workflow).await?;

        info!(
            tenant_id = %tenant_id,
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "Saved workflow"
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Workflow> {
        self.stores
            .for_tenant(tenant_id)
            .get_workflow(tenant_id, workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<Workflow>> {
        self.stores.for_tenant(tenant_id).list_workflows(tenant_id).await
    }

    pub async fn activate_workflow(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Workflow> {
        let mut workflow = self.get_workflow(tenant_id, workflow_id).await?;
        workflow.activate()?;
        self.stores.for_tenant(tenant_id).save_workflow(&workflow).await?;
        info!(tenant_id = %tenant_id, workflow_id = %workflow_id, "Activated workflow");
        Ok(workflow)
    }

    pub async fn pause_workflow(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Workflow> {
        let mut workflow = self.get_workflow(tenant_id, workflow_id).await?;
        workflow.pause()?;
        self.stores.for_tenant(tenant_id).save_workflow(&workflow).await?;
        info!(tenant_id = %tenant_id, workflow_id = %workflow_id, "Paused workflow");
        Ok(workflow)
    }

    pub async fn archive_workflow(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Workflow> {
        let mut workflow = self.get_workflow(tenant_id, workflow_id).await?;
        workflow.archive()?;
        self.stores.for_tenant(tenant_id).save_workflow(&workflow).await?;
        info!(tenant_id = %tenant_id, workflow_id = %workflow_id, "Archived workflow");
        Ok(workflow)
    }

    /// Replaces a workflow's name, description, trigger and steps. Running
    /// executions walk the new steps from their next pass on.
    pub async fn update_workflow(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<Workflow> {
        check_tenant(&definition, tenant_id)?;
        let mut workflow = self.get_workflow(tenant_id, workflow_id).await?;
        workflow.redefine(definition)?;
        self.stores.for_tenant(tenant_id).save_workflow(&workflow).await?;

        info!(
            tenant_id = %tenant_id,
            workflow_id = %workflow_id,
            steps = workflow.steps.len(),
            "Updated workflow"
        );
        Ok(workflow)
    }

    /// Deletes a workflow and its schedules. Its executions stay readable.
    pub async fn delete_workflow(&self, tenant_id: &str, workflow_id: Uuid) -> Result<()> {
        if !self
            .stores
            .for_tenant(tenant_id)
            .delete_workflow(tenant_id, workflow_id)
            .await?
        {
            return Err(Error::WorkflowNotFound(workflow_id.to_string()));
        }
        info!(tenant_id = %tenant_id, workflow_id = %workflow_id, "Deleted workflow");
        Ok(())
    }

    /// Attaches a cron schedule that re-triggers the workflow.
    pub async fn create_schedule(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
        definition: ScheduleDefinition,
    ) -> Result<WorkflowSchedule> {
        let workflow = self.get_workflow(tenant_id, workflow_id).await?;
        let schedule = WorkflowSchedule::new(&workflow, definition, Utc::now())?;
        self.stores.for_tenant(tenant_id).create_schedule(&schedule).await?;

        info!(
            tenant_id = %tenant_id,
            workflow_id = %workflow_id,
            schedule_id = %schedule.id,
            cron = %schedule.cron_expression,
            next_execution_at = %schedule.next_execution_at,
            "Created schedule"
        );
        Ok(schedule)
    }

    pub async fn list_schedules(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Vec<WorkflowSchedule>> {
        self.get_workflow(tenant_id, workflow_id).await?;
        self.stores
            .for_tenant(tenant_id)
            .list_schedules(tenant_id, workflow_id)
            .await
    }

    pub async fn delete_schedule(&self, tenant_id: &str, schedule_id: Uuid) -> Result<()> {
        if !self
            .stores
            .for_tenant(tenant_id)
            .delete_schedule(tenant_id, schedule_id)
            .await?
        {
            return Err(Error::ScheduleNotFound(schedule_id.to_string()));
        }
        info!(tenant_id = %tenant_id, schedule_id = %schedule_id, "Deleted schedule");
        Ok(())
    }

    /// Creates a pending execution of an active workflow and queues its first
    /// processing pass. Returns as soon as the job is queued.
    pub async fn trigger_workflow(
        self: &Arc<Self>,
        tenant_id: &str,
        workflow_id: Uuid,
        trigger_id: &str,
        payload: Value,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution> {
        let store = self.stores.for_tenant(tenant_id);
        let workflow = store
            .get_workflow(tenant_id, workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        self.start_execution(store.as_ref(), &workflow, trigger_id, payload, context)
            .await
    }

    /// Resolves the active workflow bound to `identifier` and triggers it.
    pub async fn trigger_by_identifier(
        self: &Arc<Self>,
        tenant_id: &str,
        identifier: &str,
        payload: Value,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution> {
        let store = self.stores.for_tenant(tenant_id);
        let workflow = store
            .get_workflow_by_trigger(tenant_id, identifier)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(format!("no active workflow for trigger '{}'", identifier)))?;
        self.start_execution(store.as_ref(), &workflow, identifier, payload, context)
            .await
    }

    async fn start_execution(
        self: &Arc<Self>,
        store: &dyn Store,
        workflow: &Workflow,
        trigger_id: &str,
        payload: Value,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution> {
        if !workflow.is_active() {
            return Err(Error::WorkflowInactive(workflow.id.to_string()));
        }
        if workflow.steps.is_empty() {
            return Err(Error::WorkflowNoSteps);
        }

        let mut execution = WorkflowExecution::new(workflow, trigger_id, payload, context);
        store.create_execution(&execution).await?;
        metrics::EXECUTIONS_TOTAL.with_label_values(&["created"]).inc();

        if let Err(e) = self.submit_execution(&execution.tenant_id, execution.id) {
            error!(
                execution_id = %execution.id,
                tenant_id = %execution.tenant_id,
                error = %e,
                "Failed to queue new execution"
            );
            execution.fail(format!("Failed to submit execution job: {}", e), None, Utc::now())?;
            if let Err(update_err) = store.update_execution(&execution).await {
                error!(execution_id = %execution.id, error = %update_err, "Failed to record submit failure");
            }
            metrics::EXECUTIONS_TOTAL.with_label_values(&["failed"]).inc();
            return Err(e);
        }

        info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            tenant_id = %execution.tenant_id,
            trigger_id = %trigger_id,
            "Workflow triggered"
        );
        Ok(execution)
    }

    pub fn submit_execution(self: &Arc<Self>, tenant_id: &str, execution_id: Uuid) -> Result<()> {
        self.submitter
            .submit(Box::new(ExecutionJob::new(self.clone(), tenant_id, execution_id)))
    }

    pub fn submit_step(self: &Arc<Self>, step: StepExecution, due_at: DateTime<Utc>) -> Result<()> {
        self.submitter
            .submit(Box::new(StepJob::new(self.clone(), step, due_at)))
    }

    /// One processing pass: performs the next action of the walk. A pass
    /// requested while another pass of the same execution is in flight is
    /// run by that pass once it finishes.
    pub async fn process_execution(self: &Arc<Self>, tenant_id: &str, execution_id: Uuid) -> Result<()> {
        let Some(mut guard) = self.begin_pass(execution_id) else {
            debug!(execution_id = %execution_id, "Execution already has a pass in flight, deferring to it");
            return Ok(());
        };
        self.run_passes(&mut guard, tenant_id, execution_id).await
    }

    async fn run_pass(self: &Arc<Self>, tenant_id: &str, execution_id: Uuid) -> Result<()> {
        let store = self.stores.for_tenant(tenant_id);
        let mut execution = store
            .get_execution(tenant_id, execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;

        if execution.is_terminal() || execution.status == ExecutionStatus::Paused {
            debug!(
                execution_id = %execution_id,
                status = %execution.status,
                "Execution is not runnable, skipping pass"
            );
            return Ok(());
        }

        let workflow = match store.get_workflow(tenant_id, execution.workflow_id).await? {
            Some(workflow) => workflow,
            None => {
                let message = Error::WorkflowNotFound(execution.workflow_id.to_string()).to_string();
                return self.fail_execution(store.as_ref(), execution, message, None).await;
            }
        };

        if execution.status == ExecutionStatus::Pending {
            execution.start(Utc::now())?;
            store.update_execution(&execution).await?;
            metrics::EXECUTIONS_TOTAL.with_label_values(&["started"]).inc();
            info!(execution_id = %execution.id, workflow_id = %workflow.id, "Execution started");
            self.publish(WorkflowEvent::ExecutionStarted(ExecutionEvent::from_execution(&execution)))
                .await;
        }

        match next_action(&workflow, &execution) {
            NextAction::Dispatch { step, existing } => {
                self.run_step(store.as_ref(), &workflow, execution, step, existing)
                    .await
            }
            NextAction::Wait => {
                debug!(execution_id = %execution.id, "Execution is waiting on a parked step");
                Ok(())
            }
            NextAction::Complete => self.complete_execution(store.as_ref(), execution).await,
            NextAction::Fail { step_id, error } => {
                self.fail_execution(store.as_ref(), execution, error, Some(step_id))
                    .await
            }
        }
    }

    async fn run_step(
        self: &Arc<Self>,
        store: &dyn Store,
        workflow: &Workflow,
        mut execution: WorkflowExecution,
        step: WorkflowStep,
        existing: Option<StepExecution>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut row = match existing {
            Some(row) => row,
            None => {
                let row = StepExecution::new(&execution, &step, now);
                store.create_step_execution(&row).await?;
                row
            }
        };
        row.start(now);
        store.update_step_execution(&row).await?;
        record_step(&mut execution, &row);

        let outcome = match tokio::time::timeout(
            self.step_timeout,
            self.dispatcher.execute(workflow, &step, &execution, now),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(format!(
                "step '{}' did not finish within {}s",
                step.id,
                self.step_timeout.as_secs()
            ))),
        };

        if !self.still_active(store, &execution).await? {
            return Ok(());
        }

        let now = Utc::now();
        match outcome {
            Ok(StepOutcome::Completed(result)) => {
                row.complete(result, now);
                store.update_step_execution(&row).await?;
                record_step(&mut execution, &row);
                metrics::STEPS_TOTAL
                    .with_label_values(&[row.step_type.to_string().as_str(), "completed"])
                    .inc();
                info!(
                    execution_id = %execution.id,
                    step_id = %row.step_id,
                    duration_ms = row.duration_ms(),
                    "Step completed"
                );
                self.publish(WorkflowEvent::StepExecuted(StepEvent::from_step(&execution, &row)))
                    .await;
                self.continue_execution(&execution);
                Ok(())
            }
            Ok(StepOutcome::Delayed { until }) => {
                row.park(until, now);
                store.update_step_execution(&row).await?;
                info!(
                    execution_id = %execution.id,
                    step_id = %row.step_id,
                    delay_until = %until,
                    "Step parked until its delay elapses"
                );
                Ok(())
            }
            Err(e) => self.handle_step_error(store, execution, row, e).await,
        }
    }

    async fn handle_step_error(
        &self,
        store: &dyn Store,
        mut execution: WorkflowExecution,
        mut row: StepExecution,
        err: Error,
    ) -> Result<()> {
        let now = Utc::now();

        if err.is_transient() {
            row.retry_count += 1;
            if self.retry.should_retry(row.retry_count) {
                let until = now + self.retry.backoff_chrono(row.retry_count);
                row.schedule_retry(err.to_string(), until, now);
                store.update_step_execution(&row).await?;
                metrics::STEP_RETRIES_TOTAL
                    .with_label_values(&[row.step_type.to_string().as_str()])
                    .inc();
                warn!(
                    execution_id = %execution.id,
                    step_id = %row.step_id,
                    retry_count = row.retry_count,
                    retry_at = %until,
                    error = %err,
                    "Step failed, retry scheduled"
                );
                return Ok(());
            }
        }

        row.fail(err.to_string(), now);
        store.update_step_execution(&row).await?;
        record_step(&mut execution, &row);
        metrics::STEPS_TOTAL
            .with_label_values(&[row.step_type.to_string().as_str(), "failed"])
            .inc();
        error!(
            execution_id = %execution.id,
            step_id = %row.step_id,
            retry_count = row.retry_count,
            error = %err,
            "Step failed"
        );
        self.publish(WorkflowEvent::StepFailed(StepEvent::from_step(&execution, &row)))
            .await;

        let step_id = row.step_id.clone();
        self.fail_execution(store, execution, err.to_string(), Some(step_id))
            .await
    }

    /// Resumes a parked step once `due_at` has reached its `delay_until`.
    /// A delay step completes; a step waiting out a retry backoff is released
    /// for another attempt. The walk then continues in the same pass.
    pub async fn resume_step(self: &Arc<Self>, parked: &StepExecution, due_at: DateTime<Utc>) -> Result<()> {
        let Some(mut guard) = self.begin_pass(parked.execution_id) else {
            // The row stays claimed; the delayed sweep hands it out again
            // once the lease runs out.
            debug!(execution_id = %parked.execution_id, step_id = %parked.step_id, "Execution busy, deferring resume");
            return Ok(());
        };

        let resumed = self.resume_parked_row(parked, due_at).await?;
        if resumed || guard.rerun_requested() {
            self.run_passes(&mut guard, &parked.tenant_id, parked.execution_id)
                .await?;
        }
        Ok(())
    }

    /// Completes or releases the parked row. Returns whether the walk should
    /// continue.
    async fn resume_parked_row(&self, parked: &StepExecution, due_at: DateTime<Utc>) -> Result<bool> {
        let tenant_id = parked.tenant_id.as_str();
        let store = self.stores.for_tenant(tenant_id);

        let Some(mut execution) = store.get_execution(tenant_id, parked.execution_id).await? else {
            warn!(execution_id = %parked.execution_id, step_id = %parked.step_id, "Parked step has no execution");
            return Ok(false);
        };
        let Some(mut row) = execution.steps.iter().find(|s| s.id == parked.id).cloned() else {
            warn!(execution_id = %execution.id, step_id = %parked.step_id, "Parked step row is gone");
            return Ok(false);
        };

        let until = match row.delay_until {
            Some(until) if row.is_parked() => until,
            _ => {
                debug!(execution_id = %execution.id, step_id = %row.step_id, "Step already resumed");
                return Ok(false);
            }
        };
        if until > due_at {
            debug!(
                execution_id = %execution.id,
                step_id = %row.step_id,
                delay_until = %until,
                "Step is not due yet"
            );
            return Ok(false);
        }

        let now = Utc::now();
        if execution.is_terminal() {
            // Clear the delay so the sweep stops handing this row out.
            row.release(now);
            store.update_step_execution(&row).await?;
            debug!(
                execution_id = %execution.id,
                step_id = %row.step_id,
                status = %execution.status,
                "Dropped parked step of finished execution"
            );
            return Ok(false);
        }

        if row.status == StepStatus::Pending && row.step_type == StepType::Delay {
            row.complete(json!({ "type": "delay", "delayed_until": until }), now);
            store.update_step_execution(&row).await?;
            record_step(&mut execution, &row);
            metrics::STEPS_TOTAL
                .with_label_values(&[row.step_type.to_string().as_str(), "completed"])
                .inc();
            info!(execution_id = %execution.id, step_id = %row.step_id, "Delay elapsed");
            self.publish(WorkflowEvent::StepExecuted(StepEvent::from_step(&execution, &row)))
                .await;
        } else {
            row.release(now);
            store.update_step_execution(&row).await?;
            info!(
                execution_id = %execution.id,
                step_id = %row.step_id,
                retry_count = row.retry_count,
                "Retrying step"
            );
        }

        Ok(true)
    }

    fn continue_execution(self: &Arc<Self>, execution: &WorkflowExecution) {
        if let Err(e) = self.submit_execution(&execution.tenant_id, execution.id) {
            // The execution stays running; the pending sweep picks it up.
            warn!(
                execution_id = %execution.id,
                error = %e,
                "Could not queue continuation"
            );
        }
    }

    async fn complete_execution(&self, store: &dyn Store, mut execution: WorkflowExecution) -> Result<()> {
        if !self.still_active(store, &execution).await? {
            return Ok(());
        }
        execution.complete(Utc::now())?;
        store.update_execution(&execution).await?;
        metrics::EXECUTIONS_TOTAL.with_label_values(&["completed"]).inc();
        info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            duration_ms = execution.duration_ms(),
            "Execution completed"
        );
        self.publish(WorkflowEvent::ExecutionCompleted(ExecutionEvent::from_execution(&execution)))
            .await;
        Ok(())
    }

    async fn fail_execution(
        &self,
        store: &dyn Store,
        mut execution: WorkflowExecution,
        message: String,
        failed_step_id: Option<String>,
    ) -> Result<()> {
        if !self.still_active(store, &execution).await? {
            return Ok(());
        }
        execution.fail(message, failed_step_id, Utc::now())?;
        store.update_execution(&execution).await?;
        metrics::EXECUTIONS_TOTAL.with_label_values(&["failed"]).inc();
        error!(
            execution_id = %execution.id,
            failed_step_id = ?execution.failed_step_id,
            error = ?execution.error_message,
            "Execution failed"
        );
        self.publish(WorkflowEvent::ExecutionFailed(ExecutionEvent::from_execution(&execution)))
            .await;
        Ok(())
    }

    /// Re-reads the execution before a write. Returns false when it was
    /// cancelled or otherwise finished while this pass was running.
    async fn still_active(&self, store: &dyn Store, execution: &WorkflowExecution) -> Result<bool> {
        match store.get_execution(&execution.tenant_id, execution.id).await? {
            Some(current) if !current.is_terminal() => Ok(true),
            Some(current) => {
                info!(
                    execution_id = %execution.id,
                    status = %current.status,
                    "Execution finished during this pass, abandoning write"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn publish(&self, event: WorkflowEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.events.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish workflow event");
        }
    }

    pub async fn get_execution(&self, tenant_id: &str, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.stores
            .for_tenant(tenant_id)
            .get_execution(tenant_id, execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn list_executions(&self, tenant_id: &str, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        self.stores
            .for_tenant(tenant_id)
            .list_executions(tenant_id, filter)
            .await
    }

    pub async fn failed_executions(&self, tenant_id: &str, limit: i64) -> Result<Vec<WorkflowExecution>> {
        self.stores
            .for_tenant(tenant_id)
            .get_failed_executions(tenant_id, limit)
            .await
    }

    /// Marks the execution cancelled. A step already in flight finishes, but
    /// its result is not written.
    pub async fn cancel_execution(&self, tenant_id: &str, execution_id: Uuid) -> Result<WorkflowExecution> {
        let store = self.stores.for_tenant(tenant_id);
        let mut execution = self.get_execution(tenant_id, execution_id).await?;
        execution.cancel(Utc::now())?;
        store.update_execution(&execution).await?;

        metrics::EXECUTIONS_TOTAL.with_label_values(&["cancelled"]).inc();
        info!(execution_id = %execution_id, tenant_id = %tenant_id, "Execution cancelled");
        self.publish(WorkflowEvent::ExecutionCancelled(ExecutionEvent::from_execution(&execution)))
            .await;
        Ok(execution)
    }

    /// Sends a failed execution back to pending, resets its failed steps and
    /// queues a new pass.
    pub async fn retry_execution(self: &Arc<Self>, tenant_id: &str, execution_id: Uuid) -> Result<WorkflowExecution> {
        let store = self.stores.for_tenant(tenant_id);
        let mut execution = self.get_execution(tenant_id, execution_id).await?;
        let now = Utc::now();
        execution.retry(now)?;

        for row in execution.steps.iter_mut().filter(|s| s.status == StepStatus::Failed) {
            row.reset_for_retry(now);
            store.update_step_execution(row).await?;
        }
        store.update_execution(&execution).await?;
        metrics::EXECUTIONS_TOTAL.with_label_values(&["retried"]).inc();
        info!(execution_id = %execution_id, tenant_id = %tenant_id, "Execution retry requested");

        if let Err(e) = self.submit_execution(tenant_id, execution_id) {
            warn!(
                execution_id = %execution_id,
                error = %e,
                "Could not queue retried execution, the pending sweep will pick it up"
            );
        }
        Ok(execution)
    }
}

fn check_tenant(definition: &WorkflowDefinition, tenant_id: &str) -> Result<()> {
    match &definition.tenant_id {
        Some(declared) if declared != tenant_id => Err(Error::WorkflowValidation(format!(
            "definition belongs to tenant '{}', not '{}'",
            declared, tenant_id
        ))),
        _ => Ok(()),
    }
}
