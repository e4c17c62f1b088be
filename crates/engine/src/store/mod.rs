mod config;
mod factory;
mod memory;
mod postgres;
mod router;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::{create_store, create_store_for_url};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use router::TenantStores;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ExecutionStatus, StepExecution, Workflow, WorkflowExecution, WorkflowSchedule};

/// How long a delayed step or schedule handed out by a sweep stays claimed.
pub const CLAIM_LEASE_SECS: i64 = 300;

pub fn claim_lease() -> Duration {
    Duration::seconds(CLAIM_LEASE_SECS)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl ExecutionFilter {
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn limit_or_default(&self) -> i64 {
        self.limit.unwrap_or(100)
    }
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Inserts or replaces a workflow definition.
    async fn save_workflow(&self, workflow: &Workflow) -> crate::Result<()>;
    async fn get_workflow(&self, tenant_id: &str, id: Uuid) -> crate::Result<Option<Workflow>>;
    /// Active workflow bound to a tenant-scoped trigger identifier.
    async fn get_workflow_by_trigger(
        &self,
        tenant_id: &str,
        identifier: &str,
    ) -> crate::Result<Option<Workflow>>;
    async fn list_workflows(&self, tenant_id: &str) -> crate::Result<Vec<Workflow>>;
    /// Deletes a workflow together with its schedules. Executions are kept.
    /// Returns false when the tenant has no such workflow.
    async fn delete_workflow(&self, tenant_id: &str, id: Uuid) -> crate::Result<bool>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create_execution(&self, execution: &WorkflowExecution) -> crate::Result<()>;
    /// Loads an execution together with its step rows.
    async fn get_execution(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> crate::Result<Option<WorkflowExecution>>;
    /// Writes execution columns. Step rows are written separately.
    async fn update_execution(&self, execution: &WorkflowExecution) -> crate::Result<()>;
    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: &ExecutionFilter,
    ) -> crate::Result<Vec<WorkflowExecution>>;
    async fn get_failed_executions(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> crate::Result<Vec<WorkflowExecution>>;

    /// Claims pending or running executions untouched since `stale_before`.
    /// Executions parked on a delayed step are left to the delayed-step sweep.
    async fn get_pending_executions(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> crate::Result<Vec<WorkflowExecution>>;

    async fn create_step_execution(&self, step: &StepExecution) -> crate::Result<()>;
    /// Writes a step row and releases any sweep claim on it.
    async fn update_step_execution(&self, step: &StepExecution) -> crate::Result<()>;
    /// Claims parked steps whose `delay_until` has passed. A claimed row is
    /// not returned again until [`CLAIM_LEASE_SECS`] have elapsed.
    async fn get_delayed_step_executions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> crate::Result<Vec<StepExecution>>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create_schedule(&self, schedule: &WorkflowSchedule) -> crate::Result<()>;
    async fn get_schedule(&self, tenant_id: &str, id: Uuid) -> crate::Result<Option<WorkflowSchedule>>;
    async fn list_schedules(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
    ) -> crate::Result<Vec<WorkflowSchedule>>;
    async fn delete_schedule(&self, tenant_id: &str, id: Uuid) -> crate::Result<bool>;
    /// Writes a schedule back and releases any sweep claim on it.
    async fn update_schedule(&self, schedule: &WorkflowSchedule) -> crate::Result<()>;
    /// Claims active schedules whose next firing is at or before `now`, with
    /// the same lease as delayed steps.
    async fn get_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> crate::Result<Vec<WorkflowSchedule>>;
}

#[async_trait]
pub trait Store: WorkflowRepository + ExecutionRepository + ScheduleRepository {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;
    async fn close(&self);
}
