//! Domain types for workflows and their executions. No I/O happens here.

mod condition;
mod execution;
mod schedule;
mod workflow;

pub use condition::{evaluate_all, resolve_path, Condition, ConditionOperator};
pub use execution::{ExecutionContext, ExecutionStatus, StepExecution, StepStatus, WorkflowExecution};
pub use schedule::{CronSchedule, ScheduleDefinition, WorkflowSchedule};
pub use workflow::{
    ConditionConfig, DelayConfig, NotificationConfig, StepConfig, StepDefinition, StepType,
    WebhookConfig, Workflow, WorkflowBuilder, WorkflowDefinition, WorkflowStatus, WorkflowStep,
    WorkflowTrigger, DEFAULT_DELAY_MINUTES, MAX_DELAY_MINUTES,
};
