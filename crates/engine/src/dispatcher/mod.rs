//! Executes one step of one execution.
//!
//! The dispatcher performs a single unit of work and reports the outcome. It
//! never writes engine state; the coordinator decides what the outcome means.

mod senders;

pub use senders::{HttpNotificationSender, HttpWebhookSender, LogNotificationSender, IDEMPOTENCY_HEADER};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::engine::context::{evaluation_view, template_view};
use crate::model::{
    evaluate_all, NotificationConfig, StepConfig, StepType, WebhookConfig, Workflow,
    WorkflowExecution, WorkflowStep,
};
use crate::template::{render_template, render_value};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub tenant_id: String,
    pub channel: StepType,
    pub recipient: String,
    pub template_id: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub variables: Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub notification_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub idempotency_key: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, request: NotificationRequest) -> Result<NotificationReceipt>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Returns the response status code of a successful delivery.
    async fn deliver(&self, request: WebhookRequest) -> Result<u16>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    /// The step waits until `until`; the scheduler resumes it.
    Delayed { until: DateTime<Utc> },
}

/// Stable key for one step of one execution, sent with every delivery so
/// receivers can drop duplicates.
pub fn idempotency_key(execution_id: Uuid, step_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(execution_id.as_bytes());
    hasher.update(b":");
    hasher.update(step_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct StepDispatcher {
    notifications: Arc<dyn NotificationSender>,
    webhooks: Arc<dyn WebhookSender>,
}

impl StepDispatcher {
    pub fn new(notifications: Arc<dyn NotificationSender>, webhooks: Arc<dyn WebhookSender>) -> Self {
        Self {
            notifications,
            webhooks,
        }
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        info!(
            execution_id = %execution.id,
            step_id = %step.id,
            step_type = %step.step_type(),
            "Executing step"
        );

        match &step.config {
            StepConfig::Email(config) => {
                self.send_notification(workflow, step, execution, config, "email", "email").await
            }
            StepConfig::Sms(config) => {
                self.send_notification(workflow, step, execution, config, "phone", "phone").await
            }
            StepConfig::Push(config) => {
                self.send_notification(workflow, step, execution, config, "device_id", "device_id").await
            }
            StepConfig::Webhook(config) => self.deliver_webhook(workflow, step, execution, config).await,
            StepConfig::Delay(config) => Duration::try_minutes(config.delay_minutes)
                .and_then(|delay| now.checked_add_signed(delay))
                .map(|until| StepOutcome::Delayed { until })
                .ok_or_else(|| {
                    Error::WorkflowValidation(format!(
                        "step '{}' delay of {} minutes is out of range",
                        step.id, config.delay_minutes
                    ))
                }),
            StepConfig::Digest(_) => Ok(StepOutcome::Completed(json!({
                "type": "digest",
                "scheduled": true,
            }))),
            StepConfig::Condition(config) => {
                let result = evaluate_all(&config.conditions, &evaluation_view(execution))?;
                Ok(StepOutcome::Completed(json!({
                    "type": "condition",
                    "result": result,
                })))
            }
            StepConfig::Unsupported { step_type, .. } => Err(Error::UnsupportedStepType(step_type.clone())),
        }
    }

    async fn send_notification(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        config: &NotificationConfig,
        recipient_field: &str,
        recipient_label: &str,
    ) -> Result<StepOutcome> {
        let recipient = execution
            .context
            .subscriber_field(recipient_field)
            .ok_or_else(|| Error::MissingRecipient(recipient_label.to_string()))?
            .to_string();
        let template_id = config
            .template_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingTemplate)?
            .to_string();

        let variables = template_view(workflow, step, execution, &config.custom_data);
        let subject = match &config.subject {
            Some(subject) => render_template(subject, &variables)?,
            None => format!("Workflow {} notification", workflow.name),
        };
        let body = match &config.body {
            Some(body) => render_template(body, &variables)?,
            None => format!("You have a notification from workflow {}", workflow.name),
        };
        let channel = step.step_type();

        let receipt = self
            .notifications
            .send(NotificationRequest {
                tenant_id: execution.tenant_id.clone(),
                channel: channel.clone(),
                recipient: recipient.clone(),
                template_id: template_id.clone(),
                subject,
                body,
                priority: config.priority.clone().unwrap_or_else(|| "normal".to_string()),
                variables,
                idempotency_key: idempotency_key(execution.id, &step.id),
            })
            .await?;

        Ok(StepOutcome::Completed(json!({
            "type": channel.to_string(),
            "sent": true,
            "recipient": recipient,
            "template_id": template_id,
            "notification_id": receipt.notification_id,
            "status": receipt.status,
        })))
    }

    async fn deliver_webhook(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        config: &WebhookConfig,
    ) -> Result<StepOutcome> {
        let view = template_view(workflow, step, execution, &serde_json::Map::new());
        let body = match &config.body {
            Some(body) => render_value(body, &view)?,
            None => json!({
                "workflow_id": workflow.id,
                "execution_id": execution.id,
                "step_id": step.id,
                "tenant_id": execution.tenant_id,
                "payload": execution.payload,
                "context": execution.context,
            }),
        };

        let status_code = self
            .webhooks
            .deliver(WebhookRequest {
                url: config.url.clone(),
                method: config.method.clone(),
                headers: config.headers.clone(),
                body,
                idempotency_key: idempotency_key(execution.id, &step.id),
            })
            .await?;

        Ok(StepOutcome::Completed(json!({
            "type": "webhook",
            "sent": true,
            "url": config.url,
            "status_code": status_code,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Condition, ConditionConfig, ConditionOperator, DelayConfig, ExecutionContext, WorkflowStep,
    };

    fn workflow_with(step: WorkflowStep) -> Workflow {
        Workflow::builder("acme", "Welcome").step(step).build()
    }

    fn execution_for(workflow: &Workflow, subscriber: Value) -> WorkflowExecution {
        let ctx = ExecutionContext {
            subscriber: subscriber.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        };
        WorkflowExecution::new(workflow, "signup", json!({ "plan": "pro" }), ctx)
    }

    fn email_step(template: Option<&str>) -> WorkflowStep {
        WorkflowStep::new(
            "send",
            StepConfig::Email(NotificationConfig {
                template_id: template.map(String::from),
                subject: Some("Hello {{ subscriber.first_name }}".into()),
                ..Default::default()
            }),
        )
        .with_id("send")
    }

    fn dispatcher(notifications: MockNotificationSender, webhooks: MockWebhookSender) -> StepDispatcher {
        StepDispatcher::new(Arc::new(notifications), Arc::new(webhooks))
    }

    #[tokio::test]
    async fn test_email_step_sends_rendered_notification() {
        let workflow = workflow_with(email_step(Some("T1")));
        let exec = execution_for(&workflow, json!({ "email": "a@b.com", "first_name": "Ada" }));

        let mut notifications = MockNotificationSender::new();
        notifications
            .expect_send()
            .withf(|req| {
                req.recipient == "a@b.com"
                    && req.template_id == "T1"
                    && req.subject == "Hello Ada"
                    && req.body == "You have a notification from workflow Welcome"
                    && req.priority == "normal"
                    && req.channel == StepType::Email
            })
            .times(1)
            .returning(|_| {
                Ok(NotificationReceipt {
                    notification_id: "n-1".into(),
                    status: "queued".into(),
                })
            });

        let outcome = dispatcher(notifications, MockWebhookSender::new())
            .execute(&workflow, &workflow.steps[0], &exec, Utc::now())
            .await
            .unwrap();

        match outcome {
            StepOutcome::Completed(result) => {
                assert_eq!(result["notification_id"], "n-1");
                assert_eq!(result["recipient"], "a@b.com");
                assert_eq!(result["type"], "email");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_recipient_and_template() {
        let workflow = workflow_with(email_step(Some("T1")));
        let exec = execution_for(&workflow, json!({}));
        let mut notifications = MockNotificationSender::new();
        notifications.expect_send().times(0);

        let d = dispatcher(notifications, MockWebhookSender::new());
        let err = d.execute(&workflow, &workflow.steps[0], &exec, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("no email recipient"));

        let workflow = workflow_with(email_step(None));
        let exec = execution_for(&workflow, json!({ "email": "a@b.com" }));
        let err = d.execute(&workflow, &workflow.steps[0], &exec, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::MissingTemplate));
    }

    #[tokio::test]
    async fn test_sms_uses_phone_recipient() {
        let step = WorkflowStep::new(
            "text",
            StepConfig::Sms(NotificationConfig {
                template_id: Some("S1".into()),
                ..Default::default()
            }),
        );
        let workflow = workflow_with(step);
        let exec = execution_for(&workflow, json!({ "email": "a@b.com" }));
        let err = dispatcher(MockNotificationSender::new(), MockWebhookSender::new())
            .execute(&workflow, &workflow.steps[0], &exec, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no phone recipient found in context");
    }

    #[tokio::test]
    async fn test_webhook_carries_idempotency_key() {
        let step = WorkflowStep::new(
            "hook",
            StepConfig::Webhook(WebhookConfig {
                url: "https://hooks.example.com/in".into(),
                method: "POST".into(),
                headers: HashMap::new(),
                body: Some(json!({ "plan": "{{ payload.plan }}" })),
            }),
        )
        .with_id("hook");
        let workflow = workflow_with(step);
        let exec = execution_for(&workflow, json!({}));
        let expected_key = idempotency_key(exec.id, "hook");

        let mut webhooks = MockWebhookSender::new();
        webhooks
            .expect_deliver()
            .withf(move |req| req.idempotency_key == expected_key && req.body == json!({ "plan": "pro" }))
            .times(1)
            .returning(|_| Ok(202));

        let outcome = dispatcher(MockNotificationSender::new(), webhooks)
            .execute(&workflow, &workflow.steps[0], &exec, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Completed(json!({
                "type": "webhook",
                "sent": true,
                "url": "https://hooks.example.com/in",
                "status_code": 202,
            }))
        );
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_an_error() {
        let d = dispatcher(MockNotificationSender::new(), MockWebhookSender::new());
        let huge = workflow_with(
            WorkflowStep::new("wait", StepConfig::Delay(DelayConfig { delay_minutes: 1_000_000_000_000_000 }))
                .with_id("wait"),
        );
        let exec = execution_for(&huge, json!({}));

        let err = d.execute(&huge, &huge.steps[0], &exec, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::WorkflowValidation(_)));
        assert!(err.to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn test_delay_condition_digest_and_unsupported() {
        let now = Utc::now();
        let d = dispatcher(MockNotificationSender::new(), MockWebhookSender::new());

        let delay = workflow_with(WorkflowStep::new("wait", StepConfig::Delay(DelayConfig { delay_minutes: 1 })));
        let exec = execution_for(&delay, json!({}));
        assert_eq!(
            d.execute(&delay, &delay.steps[0], &exec, now).await.unwrap(),
            StepOutcome::Delayed { until: now + Duration::minutes(1) }
        );

        let check = workflow_with(WorkflowStep::new(
            "check",
            StepConfig::Condition(ConditionConfig {
                conditions: vec![Condition::new("payload.plan", ConditionOperator::Eq, json!("pro"))],
            }),
        ));
        let exec = execution_for(&check, json!({}));
        assert_eq!(
            d.execute(&check, &check.steps[0], &exec, now).await.unwrap(),
            StepOutcome::Completed(json!({ "type": "condition", "result": true }))
        );

        let digest = workflow_with(WorkflowStep::new("digest", StepConfig::Digest(Default::default())));
        let exec = execution_for(&digest, json!({}));
        assert_eq!(
            d.execute(&digest, &digest.steps[0], &exec, now).await.unwrap(),
            StepOutcome::Completed(json!({ "type": "digest", "scheduled": true }))
        );

        let fax = workflow_with(WorkflowStep::new(
            "fax",
            StepConfig::Unsupported { step_type: "fax".into(), config: json!({}) },
        ));
        let exec = execution_for(&fax, json!({}));
        let err = d.execute(&fax, &fax.steps[0], &exec, now).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported step type: fax");
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(idempotency_key(id, "a"), idempotency_key(id, "a"));
        assert_ne!(idempotency_key(id, "a"), idempotency_key(id, "b"));
        assert_eq!(idempotency_key(id, "a").len(), 64);
    }
}
