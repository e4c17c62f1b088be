use serde_json::{json, Map, Value};

use crate::model::{StepStatus, Workflow, WorkflowExecution, WorkflowStep};

/// The data conditions are evaluated against:
/// `{user_id, subscriber, variables, metadata, payload, steps}` where `steps`
/// maps each completed step id to its result.
pub fn evaluation_view(execution: &WorkflowExecution) -> Value {
    let mut steps = Map::new();
    for step in execution.steps.iter().filter(|s| s.status == StepStatus::Completed) {
        steps.insert(step.step_id.clone(), step.result.clone().unwrap_or(Value::Null));
    }
    view_with_steps(execution, steps)
}

/// The evaluation view with an empty `steps` map, for callers that add
/// results themselves in a particular order.
pub fn trigger_view(execution: &WorkflowExecution) -> Value {
    view_with_steps(execution, Map::new())
}

fn view_with_steps(execution: &WorkflowExecution, steps: Map<String, Value>) -> Value {
    json!({
        "user_id": execution.context.user_id,
        "subscriber": execution.context.subscriber,
        "variables": execution.context.variables,
        "metadata": execution.context.metadata,
        "payload": execution.payload,
        "steps": steps,
    })
}

/// Evaluation view plus identifiers of the workflow, execution and step, and
/// the step's `custom_data`. Used for rendering notification templates.
pub fn template_view(
    workflow: &Workflow,
    step: &WorkflowStep,
    execution: &WorkflowExecution,
    custom_data: &Map<String, Value>,
) -> Value {
    let mut view = evaluation_view(execution);
    if let Value::Object(map) = &mut view {
        map.insert(
            "workflow".into(),
            json!({ "id": workflow.id, "name": workflow.name }),
        );
        map.insert(
            "execution".into(),
            json!({ "id": execution.id, "trigger_id": execution.trigger_id }),
        );
        map.insert(
            "step".into(),
            json!({ "id": step.id, "name": step.name, "type": step.step_type().to_string() }),
        );
        map.insert("custom_data".into(), Value::Object(custom_data.clone()));
    }
    view
}
