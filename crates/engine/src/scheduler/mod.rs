//! Background sweeps that keep executions moving.
//!
//! The pending sweep recovers executions whose processing pass was lost (a
//! crash, a full queue). The delayed sweep resumes steps whose delay or retry
//! backoff has elapsed. Both only submit jobs; the engine does the work.
//!
//! The schedule sweep triggers workflows whose cron schedule is due.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::WorkflowEngine;
use crate::metrics;
use crate::Result;

pub struct Scheduler {
    engine: Arc<WorkflowEngine>,
    poll_interval: Duration,
    schedule_interval: Duration,
    stale_after: chrono::Duration,
    batch_size: i64,
}

impl Scheduler {
    pub fn new(engine: Arc<WorkflowEngine>, config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            poll_interval: config.poll_interval,
            schedule_interval: config.schedule_interval,
            stale_after: chrono::Duration::from_std(config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            batch_size: config.sweep_batch_size,
        })
    }

    /// Starts the sweep loops. They stop when `shutdown` flips to true.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "Starting scheduler"
        );

        let pending = {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.poll_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.sweep_pending_executions_at(Utc::now()).await {
                                error!(error = %e, "Pending execution sweep failed");
                            }
                        }
                    }
                }
                debug!("Pending execution sweep stopped");
            })
        };

        let delayed = {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.poll_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.sweep_delayed_steps_at(Utc::now()).await {
                                error!(error = %e, "Delayed step sweep failed");
                            }
                        }
                    }
                }
                debug!("Delayed step sweep stopped");
            })
        };

        let schedules = {
            let scheduler = self.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.schedule_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.sweep_schedules_at(Utc::now()).await {
                                error!(error = %e, "Schedule sweep failed");
                            }
                        }
                    }
                }
                debug!("Schedule sweep stopped");
            })
        };

        vec![pending, delayed, schedules]
    }

    /// Resubmits pending or running executions nobody has touched since
    /// `now - stale_after`. Returns how many were resubmitted.
    pub async fn sweep_pending_executions_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_before = now - self.stale_after;
        let mut submitted = 0;

        for store in self.engine.stores().all() {
            let executions = store.get_pending_executions(stale_before, self.batch_size).await?;
            for execution in executions {
                if self.engine.is_in_flight(execution.id) {
                    debug!(execution_id = %execution.id, "Stale execution has a pass in flight, not resubmitting");
                    continue;
                }
                match self.engine.submit_execution(&execution.tenant_id, execution.id) {
                    Ok(()) => {
                        submitted += 1;
                        metrics::SWEEP_RESUBMISSIONS_TOTAL.with_label_values(&["pending"]).inc();
                        debug!(
                            execution_id = %execution.id,
                            tenant_id = %execution.tenant_id,
                            status = %execution.status,
                            "Resubmitted stale execution"
                        );
                    }
                    Err(e) => {
                        // Left claimed; eligible again once the claim goes stale.
                        warn!(execution_id = %execution.id, error = %e, "Could not resubmit stale execution");
                    }
                }
            }
        }

        if submitted > 0 {
            info!(count = submitted, "Pending execution sweep resubmitted executions");
        }
        Ok(submitted)
    }

    /// Submits a resume job for every parked step due at `now`.
    pub async fn sweep_delayed_steps_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut submitted = 0;

        for store in self.engine.stores().all() {
            let steps = store.get_delayed_step_executions(now, self.batch_size).await?;
            for step in steps {
                let step_id = step.step_id.clone();
                let execution_id = step.execution_id;
                match self.engine.submit_step(step, now) {
                    Ok(()) => {
                        submitted += 1;
                        metrics::SWEEP_RESUBMISSIONS_TOTAL.with_label_values(&["delayed"]).inc();
                        debug!(execution_id = %execution_id, step_id = %step_id, "Resubmitted delayed step");
                    }
                    Err(e) => {
                        warn!(
                            execution_id = %execution_id,
                            step_id = %step_id,
                            error = %e,
                            "Could not resubmit delayed step"
                        );
                    }
                }
            }
        }

        if submitted > 0 {
            info!(count = submitted, "Delayed step sweep resubmitted steps");
        }
        Ok(submitted)
    }

    /// Triggers the workflow of every schedule due at `now` and moves each
    /// schedule to its next firing. A failed trigger is logged and the
    /// schedule still advances. Returns how many executions were started.
    pub async fn sweep_schedules_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut triggered = 0;

        for store in self.engine.stores().all() {
            let schedules = store.get_due_schedules(now, self.batch_size).await?;
            for mut schedule in schedules {
                match self
                    .engine
                    .trigger_workflow(
                        &schedule.tenant_id,
                        schedule.workflow_id,
                        &schedule.trigger_id(),
                        schedule.payload.clone(),
                        schedule.context.clone(),
                    )
                    .await
                {
                    Ok(execution) => {
                        triggered += 1;
                        metrics::SWEEP_RESUBMISSIONS_TOTAL.with_label_values(&["schedule"]).inc();
                        debug!(
                            schedule_id = %schedule.id,
                            execution_id = %execution.id,
                            "Triggered scheduled workflow"
                        );
                    }
                    Err(e) => {
                        error!(
                            schedule_id = %schedule.id,
                            workflow_id = %schedule.workflow_id,
                            tenant_id = %schedule.tenant_id,
                            error = %e,
                            "Failed to trigger scheduled workflow"
                        );
                    }
                }

                if let Err(e) = schedule.advance(now) {
                    warn!(schedule_id = %schedule.id, error = %e, "Deactivating schedule with unusable cron expression");
                    schedule.is_active = false;
                    schedule.updated_at = now;
                }
                store.update_schedule(&schedule).await?;
            }
        }

        if triggered > 0 {
            info!(count = triggered, "Schedule sweep triggered workflows");
        }
        Ok(triggered)
    }
}
