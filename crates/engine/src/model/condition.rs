//! Step gating conditions.
//!
//! A condition compares the value found at a dotted `field` path inside the
//! evaluation view against a literal `value`. A list of conditions is AND-ed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    In,
    NotIn,
    Matches,
    Exists,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionOperator::Eq => "eq",
            ConditionOperator::Ne => "ne",
            ConditionOperator::Gt => "gt",
            ConditionOperator::Lt => "lt",
            ConditionOperator::Gte => "gte",
            ConditionOperator::Lte => "lte",
            ConditionOperator::Contains => "contains",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::Matches => "matches",
            ConditionOperator::Exists => "exists",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Checks the parts of a condition that can be known without data:
    /// regex syntax and list operands.
    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(Error::Condition("condition field must not be empty".into()));
        }
        match self.operator {
            ConditionOperator::Matches => {
                compile_pattern(&self.value)?;
            }
            ConditionOperator::In | ConditionOperator::NotIn => {
                if !self.value.is_array() {
                    return Err(Error::Condition(format!(
                        "operator {} on '{}' requires a list value",
                        self.operator, self.field
                    )));
                }
            }
            ConditionOperator::Exists => {
                if !(self.value.is_null() || self.value.is_boolean()) {
                    return Err(Error::Condition(format!(
                        "operator exists on '{}' takes a boolean value",
                        self.field
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn evaluate(&self, view: &Value) -> Result<bool> {
        let actual = resolve_path(view, &self.field);

        match self.operator {
            ConditionOperator::Exists => {
                let present = !matches!(actual, None | Some(Value::Null));
                let wanted = self.value.as_bool().unwrap_or(true);
                Ok(present == wanted)
            }
            ConditionOperator::Eq => Ok(values_equal(actual.unwrap_or(&Value::Null), &self.value)),
            ConditionOperator::Ne => Ok(!values_equal(actual.unwrap_or(&Value::Null), &self.value)),
            ConditionOperator::Gt => Ok(compare(actual, &self.value) == Some(Ordering::Greater)),
            ConditionOperator::Lt => Ok(compare(actual, &self.value) == Some(Ordering::Less)),
            ConditionOperator::Gte => Ok(matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            ConditionOperator::Lte => Ok(matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            )),
            ConditionOperator::Contains => Ok(match actual {
                Some(Value::String(s)) => self.value.as_str().map_or(false, |needle| s.contains(needle)),
                Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, &self.value)),
                Some(Value::Object(map)) => self.value.as_str().map_or(false, |key| map.contains_key(key)),
                _ => false,
            }),
            ConditionOperator::In | ConditionOperator::NotIn => {
                let items = self.value.as_array().ok_or_else(|| {
                    Error::Condition(format!(
                        "operator {} on '{}' requires a list value",
                        self.operator, self.field
                    ))
                })?;
                let actual = actual.unwrap_or(&Value::Null);
                let found = items.iter().any(|item| values_equal(actual, item));
                Ok(if self.operator == ConditionOperator::In { found } else { !found })
            }
            ConditionOperator::Matches => {
                let re = compile_pattern(&self.value)?;
                Ok(match actual {
                    Some(Value::String(s)) => re.is_match(s),
                    Some(Value::Number(n)) => re.is_match(&n.to_string()),
                    Some(Value::Bool(b)) => re.is_match(&b.to_string()),
                    _ => false,
                })
            }
        }
    }
}

/// AND over all conditions. An empty list always passes.
pub fn evaluate_all(conditions: &[Condition], view: &Value) -> Result<bool> {
    for condition in conditions {
        if !condition.evaluate(view)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Looks up a dotted path such as `subscriber.email` or `steps.check.result`.
/// Numeric segments index into arrays.
pub fn resolve_path<'a>(view: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = view;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn compile_pattern(value: &Value) -> Result<Regex> {
    let pattern = value
        .as_str()
        .ok_or_else(|| Error::Condition("matches requires a string pattern".into()))?;
    Regex::new(pattern).map_err(|e| Error::Condition(format!("invalid pattern '{}': {}", pattern, e)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
