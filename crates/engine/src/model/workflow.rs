use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::model::Condition;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl std::str::FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(WorkflowStatus::Draft),
            "active" => Ok(WorkflowStatus::Active),
            "paused" => Ok(WorkflowStatus::Paused),
            "archived" => Ok(WorkflowStatus::Archived),
            _ => Err(Error::Persistence(format!("Invalid workflow status: {}", s))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "draft"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Step kind as stored on rows. Unknown kinds survive a round trip as `Other`
/// so that legacy definitions can still be loaded and reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Email,
    Sms,
    Push,
    Webhook,
    Delay,
    Digest,
    Condition,
    Other(String),
}

impl From<String> for StepType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "email" => StepType::Email,
            "sms" => StepType::Sms,
            "push" => StepType::Push,
            "webhook" => StepType::Webhook,
            "delay" => StepType::Delay,
            "digest" => StepType::Digest,
            "condition" => StepType::Condition,
            _ => StepType::Other(s),
        }
    }
}

impl From<StepType> for String {
    fn from(t: StepType) -> Self {
        t.to_string()
    }
}

impl std::str::FromStr for StepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(StepType::from(s.to_string()))
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::Email => write!(f, "email"),
            StepType::Sms => write!(f, "sms"),
            StepType::Push => write!(f, "push"),
            StepType::Webhook => write!(f, "webhook"),
            StepType::Delay => write!(f, "delay"),
            StepType::Digest => write!(f, "digest"),
            StepType::Condition => write!(f, "condition"),
            StepType::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

pub const DEFAULT_DELAY_MINUTES: i64 = 5;
/// One year.
pub const MAX_DELAY_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(rename = "delayMinutes", alias = "delay_minutes", default = "default_delay_minutes")]
    pub delay_minutes: i64,
}

fn default_delay_minutes() -> i64 {
    DEFAULT_DELAY_MINUTES
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            delay_minutes: DEFAULT_DELAY_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Typed step configuration, decoded once from the `{type, config}` pair of a
/// definition.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Email(NotificationConfig),
    Sms(NotificationConfig),
    Push(NotificationConfig),
    Webhook(WebhookConfig),
    Delay(DelayConfig),
    Digest(Map<String, Value>),
    Condition(ConditionConfig),
    Unsupported { step_type: String, config: Value },
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Email(_) => StepType::Email,
            StepConfig::Sms(_) => StepType::Sms,
            StepConfig::Push(_) => StepType::Push,
            StepConfig::Webhook(_) => StepType::Webhook,
            StepConfig::Delay(_) => StepType::Delay,
            StepConfig::Digest(_) => StepType::Digest,
            StepConfig::Condition(_) => StepType::Condition,
            StepConfig::Unsupported { step_type, .. } => StepType::Other(step_type.clone()),
        }
    }

    fn decode(step_type: &str, config: Value) -> std::result::Result<Self, String> {
        // A missing config block decodes as an empty object.
        let config = if config.is_null() { Value::Object(Map::new()) } else { config };
        let typed = match StepType::from(step_type.to_string()) {
            StepType::Email => StepConfig::Email(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Sms => StepConfig::Sms(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Push => StepConfig::Push(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Webhook => StepConfig::Webhook(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Delay => StepConfig::Delay(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Digest => StepConfig::Digest(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Condition => StepConfig::Condition(serde_json::from_value(config).map_err(|e| e.to_string())?),
            StepType::Other(other) => StepConfig::Unsupported { step_type: other, config },
        };
        Ok(typed)
    }

    fn encode(&self) -> Value {
        let encoded = match self {
            StepConfig::Email(c) | StepConfig::Sms(c) | StepConfig::Push(c) => serde_json::to_value(c),
            StepConfig::Webhook(c) => serde_json::to_value(c),
            StepConfig::Delay(c) => serde_json::to_value(c),
            StepConfig::Digest(c) => serde_json::to_value(c),
            StepConfig::Condition(c) => serde_json::to_value(c),
            StepConfig::Unsupported { config, .. } => Ok(config.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// Wire shape of a step in definitions and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    next_steps: Vec<String>,
    #[serde(default)]
    position: i32,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepDefinition", into = "StepDefinition")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub config: StepConfig,
    pub conditions: Vec<Condition>,
    pub next_steps: Vec<String>,
    pub position: i32,
    pub enabled: bool,
}

impl TryFrom<StepDefinition> for WorkflowStep {
    type Error = String;

    fn try_from(def: StepDefinition) -> std::result::Result<Self, Self::Error> {
        let config = StepConfig::decode(&def.step_type, def.config)
            .map_err(|e| format!("invalid config for {} step '{}': {}", def.step_type, def.id, e))?;
        Ok(Self {
            id: def.id,
            name: def.name,
            config,
            conditions: def.conditions,
            next_steps: def.next_steps,
            position: def.position,
            enabled: def.enabled,
        })
    }
}

impl From<WorkflowStep> for StepDefinition {
    fn from(step: WorkflowStep) -> Self {
        Self {
            step_type: step.config.step_type().to_string(),
            config: step.config.encode(),
            id: step.id,
            name: step.name,
            conditions: step.conditions,
            next_steps: step.next_steps,
            position: step.position,
            enabled: step.enabled,
        }
    }
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            config,
            conditions: Vec::new(),
            next_steps: Vec::new(),
            position: 0,
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_steps.push(next.into());
        self
    }

    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Error::WorkflowValidation(format!("step '{}': {}", self.id, msg));

        if let StepConfig::Unsupported { step_type, .. } = &self.config {
            return Err(invalid(format!("unsupported step type: {}", step_type)));
        }
        for condition in &self.conditions {
            condition.validate().map_err(|e| invalid(e.to_string()))?;
        }
        match &self.config {
            StepConfig::Webhook(webhook) => {
                let parsed = url::Url::parse(&webhook.url)
                    .map_err(|e| invalid(format!("invalid webhook url '{}': {}", webhook.url, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid(format!("webhook url must be http(s): {}", webhook.url)));
                }
                reqwest::Method::from_bytes(webhook.method.to_uppercase().as_bytes())
                    .map_err(|_| invalid(format!("invalid webhook method '{}'", webhook.method)))?;
            }
            StepConfig::Delay(delay) if delay.delay_minutes < 0 => {
                return Err(invalid("delayMinutes must not be negative".into()));
            }
            StepConfig::Delay(delay) if delay.delay_minutes > MAX_DELAY_MINUTES => {
                return Err(invalid(format!(
                    "delayMinutes must not exceed {} ({} given)",
                    MAX_DELAY_MINUTES, delay.delay_minutes
                )));
            }
            StepConfig::Condition(cfg) => {
                for condition in &cfg.conditions {
                    condition.validate().map_err(|e| invalid(e.to_string()))?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub identifier: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl WorkflowTrigger {
    pub fn event(identifier: impl Into<String>) -> Self {
        Self {
            trigger_type: "event".to_string(),
            identifier: identifier.into(),
            config: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    pub trigger: WorkflowTrigger,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-supplied workflow definition, as accepted by the HTTP surface and
/// the `validate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Builds a draft workflow. Steps without an explicit position keep their
    /// listed order.
    pub fn into_workflow(self, tenant_id: &str) -> Workflow {
        let mut builder = Workflow::builder(tenant_id, self.name)
            .description(self.description)
            .trigger(self.trigger);
        for step in self.steps {
            builder = builder.step(step);
        }
        builder.build()
    }
}

pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = description.into();
        self
    }

    pub fn trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.workflow.trigger = trigger;
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.workflow.add_step(step);
        self
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}

impl Workflow {
    pub fn builder(tenant_id: impl Into<String>, name: impl Into<String>) -> WorkflowBuilder {
        let now = Utc::now();
        let name = name.into();
        WorkflowBuilder {
            workflow: Workflow {
                id: Uuid::new_v4(),
                tenant_id: tenant_id.into(),
                trigger: WorkflowTrigger::event(name.to_lowercase().replace(' ', "-")),
                name,
                description: String::new(),
                status: WorkflowStatus::Draft,
                steps: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Appends a step. An empty id is replaced with a fresh one; a zero
    /// position is replaced with the next ordinal.
    pub fn add_step(&mut self, mut step: WorkflowStep) {
        if step.id.is_empty() {
            step.id = Uuid::new_v4().to_string();
        }
        if step.position == 0 {
            step.position = self.steps.len() as i32 + 1;
        }
        self.steps.push(step);
        self.updated_at = Utc::now();
    }

    pub fn activate(&mut self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::WorkflowNoSteps);
        }
        if self.status == WorkflowStatus::Archived {
            return Err(self.transition_error(WorkflowStatus::Active));
        }
        self.validate()?;
        self.status = WorkflowStatus::Active;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Active {
            return Err(self.transition_error(WorkflowStatus::Paused));
        }
        self.status = WorkflowStatus::Paused;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Archived workflows answer no triggers and cannot be reactivated.
    pub fn archive(&mut self) -> Result<()> {
        if self.status == WorkflowStatus::Archived {
            return Err(self.transition_error(WorkflowStatus::Archived));
        }
        self.status = WorkflowStatus::Archived;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replaces name, description, trigger and steps with those of
    /// `definition`. Identity and status are kept, and the steps are re-added
    /// the way a new workflow's are.
    pub fn redefine(&mut self, definition: WorkflowDefinition) -> Result<()> {
        if self.status == WorkflowStatus::Archived {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: "redefined".to_string(),
            });
        }
        if self.is_active() && definition.steps.is_empty() {
            return Err(Error::WorkflowNoSteps);
        }

        self.name = definition.name;
        self.description = definition.description;
        self.trigger = definition.trigger;
        self.steps.clear();
        for step in definition.steps {
            self.add_step(step);
        }
        self.updated_at = Utc::now();
        self.validate()
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Graph mode applies when any step declares explicit successors.
    pub fn is_graph(&self) -> bool {
        self.steps.iter().any(|s| !s.next_steps.is_empty())
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps in ascending position; ties keep declaration order.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<(usize, &WorkflowStep)> = self.steps.iter().enumerate().collect();
        steps.sort_by_key(|(idx, s)| (s.position, *idx));
        steps.into_iter().map(|(_, s)| s).collect()
    }

    /// Entry point of the step graph: the lowest-position step.
    pub fn entry_step(&self) -> Option<&WorkflowStep> {
        self.ordered_steps().into_iter().next()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::WorkflowValidation("tenant_id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::WorkflowValidation("name is required".into()));
        }
        if self.trigger.identifier.trim().is_empty() {
            return Err(Error::WorkflowValidation("trigger identifier is required".into()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(Error::WorkflowValidation("step id is required".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(Error::WorkflowValidation(format!("duplicate step id '{}'", step.id)));
            }
            step.validate()?;
        }

        for step in &self.steps {
            for next in &step.next_steps {
                if !ids.contains(next.as_str()) {
                    return Err(Error::WorkflowValidation(format!(
                        "step '{}' references unknown next step '{}'",
                        step.id, next
                    )));
                }
            }
        }

        if self.is_graph() {
            self.validate_graph()?;
        }
        Ok(())
    }

    fn validate_graph(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            workflow: &'a Workflow,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(Error::WorkflowValidation(format!(
                        "cycle detected at step '{}'",
                        id
                    )))
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(step) = workflow.step(id) {
                for next in &step.next_steps {
                    visit(workflow, next, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for step in &self.steps {
            visit(self, &step.id, &mut marks)?;
        }

        let entry = match self.entry_step() {
            Some(step) => step,
            None => return Ok(()),
        };
        let mut reachable = HashSet::new();
        let mut stack = vec![entry.id.as_str()];
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                if let Some(step) = self.step(id) {
                    stack.extend(step.next_steps.iter().map(String::as_str));
                }
            }
        }
        if let Some(orphan) = self.steps.iter().find(|s| !reachable.contains(s.id.as_str())) {
            return Err(Error::WorkflowValidation(format!(
                "step '{}' is unreachable from entry step '{}'; graph workflows must link every step through next_steps",
                orphan.id, entry.id
            )));
        }
        Ok(())
    }

    fn transition_error(&self, to: WorkflowStatus) -> Error {
        Error::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}
