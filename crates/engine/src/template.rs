//! Template rendering utilities using Tera
//!
//! Notification subjects and bodies are Tera templates rendered against the
//! evaluation view of an execution.

use serde_json::Value;
use tera::{Context, Tera};

use crate::{Error, Result};

/// Render a template string with the given context
pub fn render_template(template: &str, context: &Value) -> Result<String> {
    // Plain strings skip the parser entirely
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let mut tera = Tera::default();
    tera.add_raw_template("template", template)
        .map_err(|e| Error::Template(format!("Failed to parse template: {}", e)))?;

    tera.render("template", &build_context(context))
        .map_err(|e| Error::Template(format!("Failed to render template: {}", e)))
}

/// Renders every string inside a JSON value, leaving other values as-is.
pub fn render_value(value: &Value, context: &Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(render_template(s, context)?)),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn build_context(context: &Value) -> Context {
    let mut tera_context = Context::new();

    // Add all fields from the JSON value to the context
    match context {
        Value::Object(map) => {
            for (key, value) in map {
                tera_context.insert(key, value);
            }
        }
        _ => {
            // If not an object, make it available as "data"
            tera_context.insert("data", context);
        }
    }
    tera_context
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template() {
        let context = json!({
            "workflow": { "name": "Welcome" },
            "subscriber": { "first_name": "Ada" }
        });

        let result = render_template("Hi {{ subscriber.first_name }} from {{ workflow.name }}", &context).unwrap();
        assert_eq!(result, "Hi Ada from Welcome");

        let with_default = render_template("{{ subscriber.last_name | default(value=\"friend\") }}", &context).unwrap();
        assert_eq!(with_default, "friend");
    }

    #[test]
    fn test_render_value_walks_nested_json() {
        let context = json!({ "user_id": "u-42" });
        let body = json!({ "user": "{{ user_id }}", "count": 3, "tags": ["{{ user_id }}-tag"] });

        let rendered = render_value(&body, &context).unwrap();
        assert_eq!(rendered, json!({ "user": "u-42", "count": 3, "tags": ["u-42-tag"] }));
    }

    #[test]
    fn test_broken_template_is_reported() {
        let err = render_template("{{ unclosed", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }
}
