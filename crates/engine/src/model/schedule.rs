use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::model::{ExecutionContext, Workflow};
use crate::{Error, Result};

/// Standard five-field cron expression: minute, hour, day of month, month,
/// day of week. Day-of-week numbers run 0-6 from Sunday, with 7 also meaning
/// Sunday. `@hourly`, `@daily` and the other descriptors are accepted too.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let normalized = if expression.starts_with('@') {
            expression.to_string()
        } else {
            let fields: Vec<&str> = expression.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(invalid(
                    expression,
                    format!(
                        "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                        fields.len()
                    ),
                ));
            }
            // The parser wants a leading seconds field and counts weekdays
            // from 1, so numeric weekdays are spelled out.
            format!(
                "0 {} {} {} {} {}",
                fields[0],
                fields[1],
                fields[2],
                fields[3],
                weekday_field(fields[4])
            )
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(expression, e.to_string()))?;
        Ok(Self { schedule })
    }

    /// First firing strictly after `after`, or `None` if the expression never
    /// fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

fn invalid(expression: &str, reason: impl std::fmt::Display) -> Error {
    Error::WorkflowValidation(format!("invalid cron expression '{}': {}", expression, reason))
}

fn weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range.split('-').map(weekday_name).collect::<Vec<_>>().join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_name(token: &str) -> &str {
    match token {
        "0" | "7" => "SUN",
        "1" => "MON",
        "2" => "TUE",
        "3" => "WED",
        "4" => "THU",
        "5" => "FRI",
        "6" => "SAT",
        other => other,
    }
}

/// Client-supplied schedule for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub cron_expression: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: ExecutionContext,
}

/// Re-triggers a workflow whenever its cron expression fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub cron_expression: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: ExecutionContext,
    pub is_active: bool,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub next_execution_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSchedule {
    pub fn new(workflow: &Workflow, definition: ScheduleDefinition, now: DateTime<Utc>) -> Result<Self> {
        let cron = CronSchedule::parse(&definition.cron_expression)?;
        let next = cron
            .next_after(now)
            .ok_or_else(|| invalid(&definition.cron_expression, "never fires"))?;

        Ok(Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id.clone(),
            cron_expression: definition.cron_expression.trim().to_string(),
            payload: definition.payload,
            context: definition.context,
            is_active: true,
            last_execution_at: None,
            next_execution_at: next,
            created_at: now,
            updated_at: now,
        })
    }

    /// Trigger id recorded on the executions this schedule starts.
    pub fn trigger_id(&self) -> String {
        format!("schedule:{}", self.id)
    }

    /// Records a firing at `now` and moves to the next cron time after it.
    /// Firings missed while nothing swept are not replayed. A schedule that
    /// never fires again is deactivated.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<()> {
        let cron = CronSchedule::parse(&self.cron_expression)?;
        self.last_execution_at = Some(now);
        match cron.next_after(now) {
            Some(next) => self.next_execution_at = next,
            None => self.is_active = false,
        }
        self.updated_at = now;
        Ok(())
    }
}
