use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Pool, Postgres, Row, Transaction,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    model::{ExecutionStatus, StepExecution, Workflow, WorkflowExecution, WorkflowSchedule, WorkflowTrigger},
    store::{
        claim_lease, ExecutionFilter, ExecutionRepository, ScheduleRepository, Store, WorkflowRepository,
    },
    Error, Result,
};

const EXECUTION_COLUMNS: &str = r#"
    id, workflow_id, tenant_id, trigger_id, status, payload, context,
    started_at, completed_at, error_message, failed_step_id, created_at, updated_at
"#;

const STEP_COLUMNS: &str = r#"
    id, execution_id, tenant_id, step_id, step_type, status, started_at, completed_at,
    result, error_message, retry_count, delay_until, created_at, updated_at
"#;

const SCHEDULE_COLUMNS: &str = r#"
    id, workflow_id, tenant_id, cron_expression, payload, context, is_active,
    last_execution_at, next_execution_at, created_at, updated_at
"#;

pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }

    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_executions WHERE id = $1",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let mut execution = execution_from_row(&r)?;
                execution.steps = self.load_steps(id).await?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    async fn load_steps(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE execution_id = $1 ORDER BY created_at, id",
            STEP_COLUMNS
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

fn workflow_from_row(r: &PgRow) -> Result<Workflow> {
    Ok(Workflow {
        id: r.get::<String, _>("id").parse()?,
        tenant_id: r.get("tenant_id"),
        name: r.get("name"),
        description: r.get("description"),
        status: r.get::<String, _>("status").parse()?,
        trigger: WorkflowTrigger {
            trigger_type: r.get("trigger_type"),
            identifier: r.get("trigger_identifier"),
            config: serde_json::from_str(r.get("trigger_config"))?,
        },
        steps: serde_json::from_str(r.get("steps"))?,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn execution_from_row(r: &PgRow) -> Result<WorkflowExecution> {
    Ok(WorkflowExecution {
        id: r.get::<String, _>("id").parse()?,
        workflow_id: r.get::<String, _>("workflow_id").parse()?,
        tenant_id: r.get("tenant_id"),
        trigger_id: r.get("trigger_id"),
        status: r.get::<String, _>("status").parse()?,
        payload: serde_json::from_str(r.get("payload"))?,
        context: serde_json::from_str(r.get("context"))?,
        steps: Vec::new(),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        error_message: r.get("error_message"),
        failed_step_id: r.get("failed_step_id"),
    })
}

fn step_from_row(r: &PgRow) -> Result<StepExecution> {
    Ok(StepExecution {
        id: r.get::<String, _>("id").parse()?,
        execution_id: r.get::<String, _>("execution_id").parse()?,
        tenant_id: r.get("tenant_id"),
        step_id: r.get("step_id"),
        step_type: r.get::<String, _>("step_type").parse()?,
        status: r.get::<String, _>("status").parse()?,
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
        result: r
            .get::<Option<String>, _>("result")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        error_message: r.get("error_message"),
        retry_count: r.get("retry_count"),
        delay_until: r.get("delay_until"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn schedule_from_row(r: &PgRow) -> Result<WorkflowSchedule> {
    Ok(WorkflowSchedule {
        id: r.get::<String, _>("id").parse()?,
        workflow_id: r.get::<String, _>("workflow_id").parse()?,
        tenant_id: r.get("tenant_id"),
        cron_expression: r.get("cron_expression"),
        payload: serde_json::from_str(r.get("payload"))?,
        context: serde_json::from_str(r.get("context"))?,
        is_active: r.get("is_active"),
        last_execution_at: r.get("last_execution_at"),
        next_execution_at: r.get("next_execution_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

/// Step progress counts as execution progress for the stale-execution sweep.
async fn touch_execution(tx: &mut Transaction<'_, Postgres>, step: &StepExecution) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE workflow_executions SET updated_at = $1, claimed_at = NULL
        WHERE id = $2 AND updated_at < $1
        "#,
    )
    .bind(step.updated_at)
    .bind(step.execution_id.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl WorkflowRepository for PostgresStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        debug!("Saving workflow: {}", workflow.id);

        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, tenant_id, name, description, status, trigger_type,
                trigger_identifier, trigger_config, steps, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                trigger_type = EXCLUDED.trigger_type,
                trigger_identifier = EXCLUDED.trigger_identifier,
                trigger_config = EXCLUDED.trigger_config,
                steps = EXCLUDED.steps,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.tenant_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.to_string())
        .bind(&workflow.trigger.trigger_type)
        .bind(&workflow.trigger.identifier)
        .bind(serde_json::to_string(&workflow.trigger.config)?)
        .bind(serde_json::to_string(&workflow.steps)?)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, tenant_id: &str, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn get_workflow_by_trigger(&self, tenant_id: &str, identifier: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflows
            WHERE tenant_id = $1 AND trigger_identifier = $2 AND status = 'active'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<Workflow>> {
        let rows = sqlx::query("SELECT * FROM workflows WHERE tenant_id = $1 ORDER BY created_at")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn delete_workflow(&self, tenant_id: &str, id: Uuid) -> Result<bool> {
        debug!("Deleting workflow: {}", id);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM workflows WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM workflow_schedules WHERE workflow_id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }
}

#[async_trait]
impl ExecutionRepository for PostgresStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        debug!("Creating execution: {}", execution.id);

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_id, tenant_id, trigger_id, status, payload, context,
                started_at, completed_at, error_message, failed_step_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.tenant_id)
        .bind(&execution.trigger_id)
        .bind(execution.status.to_string())
        .bind(serde_json::to_string(&execution.payload)?)
        .bind(serde_json::to_string(&execution.context)?)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.error_message)
        .bind(&execution.failed_step_id)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, tenant_id: &str, id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self
            .load_execution(&id.to_string())
            .await?
            .filter(|e| e.tenant_id == tenant_id))
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        debug!("Updating execution {} -> {}", execution.id, execution.status);

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET
                status = $1, payload = $2, context = $3, started_at = $4, completed_at = $5,
                error_message = $6, failed_step_id = $7, updated_at = $8, claimed_at = NULL
            WHERE id = $9
            "#,
        )
        .bind(execution.status.to_string())
        .bind(serde_json::to_string(&execution.payload)?)
        .bind(serde_json::to_string(&execution.context)?)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.error_message)
        .bind(&execution.failed_step_id)
        .bind(execution.updated_at)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ExecutionNotFound(execution.id.to_string()));
        }
        Ok(())
    }

    async fn list_executions(&self, tenant_id: &str, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM workflow_executions
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR workflow_id = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.workflow_id.map(|id| id.to_string()))
        .bind(filter.limit_or_default())
        .fetch_all(&self.pool)
        .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for r in &rows {
            let mut execution = execution_from_row(r)?;
            execution.steps = self.load_steps(&execution.id.to_string()).await?;
            executions.push(execution);
        }
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
        let rows = sqlx::query(
            r#"
            UPDATE workflow_executions SET claimed_at = $3
            WHERE id IN (
                SELECT e.id FROM workflow_executions e
                WHERE e.status IN ('pending', 'running')
                  AND e.updated_at <= $1
                  AND (e.claimed_at IS NULL OR e.claimed_at <= $1)
                  AND NOT EXISTS (
                      SELECT 1 FROM step_executions s
                      WHERE s.execution_id = e.id
                        AND s.delay_until IS NOT NULL
                        AND s.status IN ('pending', 'retrying')
                  )
                ORDER BY e.updated_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(stale_before)
        .bind(limit)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: String = r.get("id");
            if let Some(execution) = self.load_execution(&id).await? {
                executions.push(execution);
            }
        }
        Ok(executions)
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<()> {
        debug!("Creating step execution {} for step {}", step.id, step.step_id);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO step_executions (
                id, execution_id, tenant_id, step_id, step_type, status, started_at, completed_at,
                result, error_message, retry_count, delay_until, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.execution_id.to_string())
        .bind(&step.tenant_id)
        .bind(&step.step_id)
        .bind(step.step_type.to_string())
        .bind(step.status.to_string())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&step.error_message)
        .bind(step.retry_count)
        .bind(step.delay_until)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&mut *tx)
        .await?;
        touch_execution(&mut tx, step).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<()> {
        debug!("Updating step execution {} -> {}", step.id, step.status);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE step_executions SET
                status = $1, started_at = $2, completed_at = $3, result = $4, error_message = $5,
                retry_count = $6, delay_until = $7, updated_at = $8, claimed_at = NULL
            WHERE id = $9
            "#,
        )
        .bind(step.status.to_string())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&step.error_message)
        .bind(step.retry_count)
        .bind(step.delay_until)
        .bind(step.updated_at)
        .bind(step.id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Persistence(format!("step execution not found: {}", step.id)));
        }
        touch_execution(&mut tx, step).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_delayed_step_executions(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE step_executions SET claimed_at = $1
            WHERE id IN (
                SELECT id FROM step_executions
                WHERE status IN ('pending', 'retrying')
                  AND delay_until IS NOT NULL
                  AND delay_until <= $1
                  AND (claimed_at IS NULL OR claimed_at <= $2)
                ORDER BY delay_until
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            STEP_COLUMNS
        ))
        .bind(now)
        .bind(now - claim_lease())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

#[async_trait]
impl ScheduleRepository for PostgresStore {
    async fn create_schedule(&self, schedule: &WorkflowSchedule) -> Result<()> {
        debug!("Creating schedule {} for workflow {}", schedule.id, schedule.workflow_id);

        sqlx::query(
            r#"
            INSERT INTO workflow_schedules (
                id, workflow_id, tenant_id, cron_expression, payload, context, is_active,
                last_execution_at, next_execution_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.workflow_id.to_string())
        .bind(&schedule.tenant_id)
        .bind(&schedule.cron_expression)
        .bind(serde_json::to_string(&schedule.payload)?)
        .bind(serde_json::to_string(&schedule.context)?)
        .bind(schedule.is_active)
        .bind(schedule.last_execution_at)
        .bind(schedule.next_execution_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, tenant_id: &str, id: Uuid) -> Result<Option<WorkflowSchedule>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_schedules WHERE id = $1 AND tenant_id = $2",
            SCHEDULE_COLUMNS
        ))
        .bind(id.to_string())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Vec<WorkflowSchedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_schedules WHERE tenant_id = $1 AND workflow_id = $2 ORDER BY created_at",
            SCHEDULE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn delete_schedule(&self, tenant_id: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_schedules WHERE id = $1 AND tenant_id = $2")
            .bind(id.to_string())
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_schedule(&self, schedule: &WorkflowSchedule) -> Result<()> {
        debug!("Updating schedule {} -> next {}", schedule.id, schedule.next_execution_at);

        let result = sqlx::query(
            r#"
            UPDATE workflow_schedules SET
                cron_expression = $1, payload = $2, context = $3, is_active = $4,
                last_execution_at = $5, next_execution_at = $6, updated_at = $7, claimed_at = NULL
            WHERE id = $8
            "#,
        )
        .bind(&schedule.cron_expression)
        .bind(serde_json::to_string(&schedule.payload)?)
        .bind(serde_json::to_string(&schedule.context)?)
        .bind(schedule.is_active)
        .bind(schedule.last_execution_at)
        .bind(schedule.next_execution_at)
        .bind(schedule.updated_at)
        .bind(schedule.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ScheduleNotFound(schedule.id.to_string()));
        }
        Ok(())
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WorkflowSchedule>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE workflow_schedules SET claimed_at = $1
            WHERE id IN (
                SELECT id FROM workflow_schedules
                WHERE is_active
                  AND next_execution_at <= $1
                  AND (claimed_at IS NULL OR claimed_at <= $2)
                ORDER BY next_execution_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(now)
        .bind(now - claim_lease())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(schedule_from_row).collect()
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
