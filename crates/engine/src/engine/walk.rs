//! Decides what an execution should do next from persisted state alone.
//!
//! A processing pass re-reads the execution and its step rows and asks
//! [`next_action`] for the single next move. Because the decision depends
//! only on stored rows, a pass that crashed halfway is recovered by walking
//! again.
//!
//! A step without a row has its conditions evaluated against the results of
//! the steps the walk passed before reaching it, never against results of
//! steps that come after it. A step skipped once therefore stays skipped on
//! every later pass.

use serde_json::Value;
use std::collections::HashSet;

use crate::engine::context::trigger_view;
use crate::model::{evaluate_all, StepExecution, StepStatus, Workflow, WorkflowExecution, WorkflowStep};

#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Run `step`. `existing` is the row to reuse when the step was already
    /// started or released from a delay.
    Dispatch {
        step: WorkflowStep,
        existing: Option<StepExecution>,
    },
    /// A step is parked on a delay or a retry backoff.
    Wait,
    Complete,
    Fail { step_id: String, error: String },
}

enum Visit {
    /// Step is done; move on to its successors.
    Continue,
    /// Step does not run; its successors are pruned in graph mode.
    Skip,
    Stop(NextAction),
}

fn visit(step: &WorkflowStep, execution: &WorkflowExecution, view: &Value) -> Visit {
    if !step.enabled {
        return Visit::Skip;
    }

    if let Some(row) = execution.step_execution(&step.id) {
        return match row.status {
            StepStatus::Completed => Visit::Continue,
            StepStatus::Failed => Visit::Stop(NextAction::Fail {
                step_id: step.id.clone(),
                error: row
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("step '{}' failed", step.id)),
            }),
            StepStatus::Paused => Visit::Stop(NextAction::Wait),
            _ if row.delay_until.is_some() => Visit::Stop(NextAction::Wait),
            _ => Visit::Stop(NextAction::Dispatch {
                step: step.clone(),
                existing: Some(row.clone()),
            }),
        };
    }

    match evaluate_all(&step.conditions, view) {
        Ok(true) => Visit::Stop(NextAction::Dispatch {
            step: step.clone(),
            existing: None,
        }),
        Ok(false) => Visit::Skip,
        Err(e) => Visit::Stop(NextAction::Fail {
            step_id: step.id.clone(),
            error: e.to_string(),
        }),
    }
}

pub fn next_action(workflow: &Workflow, execution: &WorkflowExecution) -> NextAction {
    let mut view = trigger_view(execution);
    if workflow.is_graph() {
        walk_graph(workflow, execution, &mut view)
    } else {
        walk_sequential(workflow, execution, &mut view)
    }
}

/// Exposes a passed step's result to the steps after it.
fn pass(view: &mut Value, execution: &WorkflowExecution, step: &WorkflowStep) {
    let result = execution
        .step_execution(&step.id)
        .and_then(|row| row.result.clone())
        .unwrap_or(Value::Null);
    if let Some(steps) = view.get_mut("steps").and_then(Value::as_object_mut) {
        steps.insert(step.id.clone(), result);
    }
}

fn walk_sequential(workflow: &Workflow, execution: &WorkflowExecution, view: &mut Value) -> NextAction {
    for step in workflow.ordered_steps() {
        match visit(step, execution, view) {
            Visit::Continue => pass(view, execution, step),
            Visit::Skip => continue,
            Visit::Stop(action) => return action,
        }
    }
    NextAction::Complete
}

// Depth-first preorder from the entry step. Successors are visited in the
// order they are listed.
fn walk_graph(workflow: &Workflow, execution: &WorkflowExecution, view: &mut Value) -> NextAction {
    let Some(entry) = workflow.entry_step() else {
        return NextAction::Complete;
    };

    let mut visited = HashSet::new();
    let mut stack = vec![entry];
    while let Some(step) = stack.pop() {
        if !visited.insert(step.id.as_str()) {
            continue;
        }
        match visit(step, execution, view) {
            Visit::Skip => {}
            Visit::Continue => {
                pass(view, execution, step);
                for next in step.next_steps.iter().rev() {
                    if let Some(successor) = workflow.step(next) {
                        stack.push(successor);
                    }
                }
            }
            Visit::Stop(action) => return action,
        }
    }
    NextAction::Complete
}
