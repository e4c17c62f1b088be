use async_trait::async_trait;
use chrono::{Duration, Utc};
use notiflow_engine::{
    config::EngineConfig,
    dispatcher::{
        NotificationReceipt, NotificationRequest, NotificationSender, StepDispatcher, WebhookRequest,
        WebhookSender,
    },
    engine::WorkflowEngine,
    events::BroadcastPublisher,
    model::{
        Condition, ConditionOperator, DelayConfig, ExecutionContext, ExecutionStatus, NotificationConfig,
        ScheduleDefinition, StepConfig, StepStatus, Workflow, WorkflowDefinition, WorkflowStatus, WorkflowStep,
        WorkflowTrigger,
    },
    pool::{Job, JobSubmitter},
    scheduler::Scheduler,
    store::{ExecutionFilter, MemoryStore, ScheduleRepository, TenantStores, WorkflowRepository},
    Error, Result,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// Holds submitted jobs until the test runs them.
#[derive(Default)]
struct QueueSubmitter {
    jobs: Mutex<VecDeque<Box<dyn Job>>>,
    reject: AtomicBool,
}

impl JobSubmitter for QueueSubmitter {
    fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::QueueFull);
        }
        self.jobs.lock().unwrap().push_back(job);
        Ok(())
    }
}

impl QueueSubmitter {
    fn pop(&self) -> Option<Box<dyn Job>> {
        self.jobs.lock().unwrap().pop_front()
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn clear(&self) {
        self.jobs.lock().unwrap().clear();
    }

    /// Runs queued jobs, including the ones they submit, until none are left.
    async fn drain(&self) -> usize {
        let mut processed = 0;
        while let Some(job) = self.pop() {
            job.process().await.unwrap();
            processed += 1;
        }
        processed
    }
}

#[derive(Default)]
struct FakeNotifications {
    sent: Mutex<Vec<NotificationRequest>>,
    attempts: AtomicUsize,
    transient_failures: AtomicUsize,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    latency: Option<std::time::Duration>,
}

impl FakeNotifications {
    fn failing(times: usize) -> Self {
        Self {
            transient_failures: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, release)),
            ..Default::default()
        }
    }

    fn slow(latency: std::time::Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSender for FakeNotifications {
    async fn send(&self, request: NotificationRequest) -> Result<NotificationReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Provider("smtp relay unavailable".into()));
        }
        self.sent.lock().unwrap().push(request);
        Ok(NotificationReceipt {
            notification_id: format!("n-{}", self.sent_count()),
            status: "queued".into(),
        })
    }
}

#[derive(Default)]
struct FakeWebhooks {
    delivered: Mutex<Vec<WebhookRequest>>,
}

#[async_trait]
impl WebhookSender for FakeWebhooks {
    async fn deliver(&self, request: WebhookRequest) -> Result<u16> {
        self.delivered.lock().unwrap().push(request);
        Ok(200)
    }
}

struct Harness {
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<Scheduler>,
    store: Arc<MemoryStore>,
    queue: Arc<QueueSubmitter>,
    notifications: Arc<FakeNotifications>,
    webhooks: Arc<FakeWebhooks>,
    events: Arc<BroadcastPublisher>,
}

fn harness_with(notifications: FakeNotifications, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(QueueSubmitter::default());
    let notifications = Arc::new(notifications);
    let webhooks = Arc::new(FakeWebhooks::default());
    let events = Arc::new(BroadcastPublisher::new(64));

    let engine = WorkflowEngine::new(
        TenantStores::new(store.clone()),
        StepDispatcher::new(notifications.clone(), webhooks.clone()),
        events.clone(),
        queue.clone(),
        &config,
    );
    let scheduler = Scheduler::new(engine.clone(), &config);

    Harness {
        engine,
        scheduler,
        store,
        queue,
        notifications,
        webhooks,
        events,
    }
}

fn harness() -> Harness {
    harness_with(FakeNotifications::default(), EngineConfig::default())
}

fn email(id: &str) -> WorkflowStep {
    WorkflowStep::new(
        id,
        StepConfig::Email(NotificationConfig {
            template_id: Some("T1".into()),
            ..Default::default()
        }),
    )
    .with_id(id)
}

fn subscriber(email: &str) -> ExecutionContext {
    let mut ctx = ExecutionContext::default();
    ctx.subscriber.insert("email".into(), json!(email));
    ctx
}

async fn active_workflow(h: &Harness, steps: Vec<WorkflowStep>) -> Workflow {
    let mut builder = Workflow::builder("acme", "Welcome");
    for step in steps {
        builder = builder.step(step);
    }
    let mut workflow = builder.build();
    workflow.activate().unwrap();
    h.store.save_workflow(&workflow).await.unwrap();
    workflow
}

async fn trigger(h: &Harness, workflow: &Workflow, ctx: ExecutionContext, payload: Value) -> Uuid {
    h.engine
        .trigger_workflow("acme", workflow.id, "user.signup", payload, ctx)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_single_email_step_completes() {
    let h = harness();
    let mut events = h.events.subscribe();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let execution = h
        .engine
        .trigger_workflow("acme", workflow.id, "user.signup", json!({}), subscriber("a@b.com"))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(h.queue.len(), 1);

    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.steps.len(), 1);
    let step = &execution.steps[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.result.as_ref().unwrap()["notification_id"], "n-1");
    assert_eq!(h.notifications.sent.lock().unwrap()[0].recipient, "a@b.com");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type());
    }
    assert_eq!(
        seen,
        vec![
            "workflow.execution.started",
            "workflow.step.executed",
            "workflow.execution.completed"
        ]
    );
}

#[tokio::test]
async fn test_missing_recipient_fails_without_retry() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let id = trigger(&h, &workflow, ExecutionContext::default(), json!({})).await;
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.as_deref().unwrap().contains("no email recipient"));
    assert_eq!(execution.failed_step_id.as_deref(), Some("welcome"));
    assert_eq!(execution.steps[0].status, StepStatus::Failed);
    assert_eq!(execution.steps[0].retry_count, 0);
    assert_eq!(h.notifications.attempts.load(Ordering::SeqCst), 0);

    let failed = h.engine.failed_executions("acme", 10).await.unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_delay_step_parks_until_due() {
    let h = harness();
    let workflow = active_workflow(
        &h,
        vec![
            WorkflowStep::new("wait", StepConfig::Delay(DelayConfig { delay_minutes: 1 })).with_id("wait"),
            email("welcome"),
        ],
    )
    .await;

    let before = Utc::now();
    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;
    let after = Utc::now();

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.steps.len(), 1);
    let parked = &execution.steps[0];
    assert_eq!(parked.status, StepStatus::Pending);
    let until = parked.delay_until.unwrap();
    assert!(until >= before + Duration::minutes(1) && until <= after + Duration::minutes(1));

    // Not due yet, and the pending sweep leaves parked executions alone.
    assert_eq!(h.scheduler.sweep_delayed_steps_at(Utc::now()).await.unwrap(), 0);
    assert_eq!(
        h.scheduler
            .sweep_pending_executions_at(Utc::now() + Duration::minutes(10))
            .await
            .unwrap(),
        0
    );
    assert_eq!(h.notifications.sent_count(), 0);

    let due = Utc::now() + Duration::minutes(2);
    assert_eq!(h.scheduler.sweep_delayed_steps_at(due).await.unwrap(), 1);
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 2);
    assert!(execution.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(execution.steps[0].result.as_ref().unwrap()["type"], "delay");
    assert_eq!(h.notifications.sent_count(), 1);

    // A second sweep finds nothing left to resume.
    assert_eq!(h.scheduler.sweep_delayed_steps_at(due).await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let config = EngineConfig {
        max_retries: 3,
        ..EngineConfig::default()
    };
    let h = harness_with(FakeNotifications::failing(usize::MAX), config);
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.steps[0].status, StepStatus::Retrying);
    assert_eq!(execution.steps[0].retry_count, 1);
    assert!(execution.steps[0].delay_until.is_some());

    for _ in 0..2 {
        let later = Utc::now() + Duration::hours(1);
        assert_eq!(h.scheduler.sweep_delayed_steps_at(later).await.unwrap(), 1);
        h.queue.drain().await;
    }

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_step_id.as_deref(), Some("welcome"));
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].status, StepStatus::Failed);
    assert_eq!(execution.steps[0].retry_count, 3);
    assert_eq!(h.notifications.attempts.load(Ordering::SeqCst), 3);

    // No fourth attempt.
    let later = Utc::now() + Duration::hours(2);
    assert_eq!(h.scheduler.sweep_delayed_steps_at(later).await.unwrap(), 0);
    h.queue.drain().await;
    assert_eq!(h.notifications.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_wins_over_in_flight_step() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(
        FakeNotifications::gated(entered.clone(), release.clone()),
        EngineConfig::default(),
    );
    let workflow = active_workflow(&h, vec![email("welcome")]).await;
    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;

    let job = h.queue.pop().unwrap();
    let pass = tokio::spawn(async move { job.process().await });

    entered.notified().await;
    let cancelled = h.engine.cancel_execution("acme", id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    release.notify_one();
    pass.await.unwrap().unwrap();

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_ne!(execution.steps[0].status, StepStatus::Completed);
    assert_eq!(h.queue.len(), 0);

    let err = h.engine.cancel_execution("acme", id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_pending_sweep_leaves_in_flight_execution_alone() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(
        FakeNotifications::gated(entered.clone(), release.clone()),
        EngineConfig::default(),
    );
    let workflow = active_workflow(
        &h,
        vec![
            WorkflowStep::new("wait", StepConfig::Delay(DelayConfig { delay_minutes: 10 })).with_id("wait"),
            email("welcome"),
        ],
    )
    .await;
    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;

    let due = Utc::now() + Duration::minutes(11);
    assert_eq!(h.scheduler.sweep_delayed_steps_at(due).await.unwrap(), 1);
    let job = h.queue.pop().unwrap();
    let resume = tokio::spawn(async move { job.process().await });

    // The resumed pass is blocked inside the email send.
    entered.notified().await;
    assert!(h.engine.is_in_flight(id));
    assert_eq!(h.scheduler.sweep_pending_executions_at(due).await.unwrap(), 0);
    assert_eq!(h.queue.len(), 0);

    // A second pass request is folded into the running pass.
    h.engine.process_execution("acme", id).await.unwrap();

    release.notify_one();
    resume.await.unwrap().unwrap();
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 2);
    assert_eq!(h.notifications.attempts.load(Ordering::SeqCst), 1);
    assert!(!h.engine.is_in_flight(id));
}

#[tokio::test]
async fn test_slow_step_times_out_and_retries() {
    let config = EngineConfig {
        step_timeout: std::time::Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let h = harness_with(FakeNotifications::slow(std::time::Duration::from_secs(5)), config);
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    let step = &execution.steps[0];
    assert_eq!(step.status, StepStatus::Retrying);
    assert_eq!(step.retry_count, 1);
    assert!(step.error_message.as_deref().unwrap().contains("timed out"));
    assert!(step.delay_until.is_some());
    assert_eq!(h.notifications.sent_count(), 0);
}

#[tokio::test]
async fn test_failing_condition_skips_step() {
    let h = harness();
    let workflow = active_workflow(
        &h,
        vec![
            email("vip").with_condition(Condition::new("payload.plan", ConditionOperator::Eq, json!("vip"))),
            email("everyone"),
        ],
    )
    .await;

    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({ "plan": "free" })).await;
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].step_id, "everyone");
}

#[tokio::test]
async fn test_graph_workflow_from_definition() {
    let h = harness();
    let definition: WorkflowDefinition = serde_json::from_value(json!({
        "name": "Onboarding",
        "trigger": { "type": "event", "identifier": "user.signup" },
        "steps": [
            { "id": "check", "type": "condition", "name": "Is pro?",
              "config": { "conditions": [{ "field": "payload.plan", "operator": "eq", "value": "pro" }] },
              "next_steps": ["pro_welcome", "notify_crm"] },
            { "id": "pro_welcome", "type": "email", "name": "Pro welcome",
              "config": { "template_id": "PRO" },
              "conditions": [{ "field": "steps.check.result", "operator": "eq", "value": true }] },
            { "id": "notify_crm", "type": "webhook", "name": "CRM",
              "config": { "url": "https://crm.example.com/hooks/signup" } }
        ]
    }))
    .unwrap();

    let saved = h.engine.save_workflow("acme", definition).await.unwrap();
    h.engine.activate_workflow("acme", saved.id).await.unwrap();

    let execution = h
        .engine
        .trigger_by_identifier("acme", "user.signup", json!({ "plan": "free" }), subscriber("a@b.com"))
        .await
        .unwrap();
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let ran: Vec<&str> = execution.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ran, vec!["check", "notify_crm"]);
    assert_eq!(h.notifications.sent_count(), 0);
    assert_eq!(h.webhooks.delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_failure_fails_new_execution() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;
    h.queue.reject.store(true, Ordering::SeqCst);

    let err = h
        .engine
        .trigger_workflow("acme", workflow.id, "user.signup", json!({}), subscriber("a@b.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull));

    let executions = h.engine.list_executions("acme", &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(
        executions[0].error_message.as_deref(),
        Some("Failed to submit execution job: worker pool queue is full")
    );
}

#[tokio::test]
async fn test_trigger_rejects_unknown_and_inactive_workflows() {
    let h = harness();
    let err = h
        .engine
        .trigger_workflow("acme", Uuid::new_v4(), "t", json!({}), ExecutionContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowNotFound(_)));

    let draft = Workflow::builder("acme", "Draft").step(email("welcome")).build();
    h.store.save_workflow(&draft).await.unwrap();
    let err = h
        .engine
        .trigger_workflow("acme", draft.id, "t", json!({}), ExecutionContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowInactive(_)));

    // Another tenant cannot see the workflow.
    let err = h
        .engine
        .trigger_workflow("globex", draft.id, "t", json!({}), ExecutionContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowNotFound(_)));

    assert!(h.engine.list_executions("acme", &ExecutionFilter::default()).await.unwrap().is_empty());
    assert_eq!(h.queue.len(), 0);
}

#[tokio::test]
async fn test_manual_retry_reruns_failed_step() {
    let config = EngineConfig {
        max_retries: 1,
        ..EngineConfig::default()
    };
    let h = harness_with(FakeNotifications::failing(1), config);
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;
    assert_eq!(
        h.engine.get_execution("acme", id).await.unwrap().status,
        ExecutionStatus::Failed
    );

    let retried = h.engine.retry_execution("acme", id).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Pending);
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.error_message.is_none());
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].status, StepStatus::Completed);
    assert_eq!(execution.steps[0].retry_count, 2);

    let err = h.engine.retry_execution("acme", id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_pending_sweep_recovers_lost_pass() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;
    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;

    // The job never reaches a worker.
    h.queue.clear();

    assert_eq!(h.scheduler.sweep_pending_executions_at(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + Duration::minutes(10);
    assert_eq!(h.scheduler.sweep_pending_executions_at(later).await.unwrap(), 1);
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.notifications.sent_count(), 1);
}

#[tokio::test]
async fn test_webhook_step_sends_idempotency_key() {
    let h = harness();
    let workflow = active_workflow(
        &h,
        vec![WorkflowStep::new(
            "hook",
            StepConfig::Webhook(notiflow_engine::model::WebhookConfig {
                url: "https://hooks.example.com/in".into(),
                method: "POST".into(),
                headers: Default::default(),
                body: None,
            }),
        )
        .with_id("hook")],
    )
    .await;

    let id = trigger(&h, &workflow, ExecutionContext::default(), json!({ "order": 7 })).await;
    h.queue.drain().await;

    let delivered = h.webhooks.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].idempotency_key,
        notiflow_engine::dispatcher::idempotency_key(id, "hook")
    );
    assert_eq!(delivered[0].body["payload"]["order"], 7);
}

fn every_five_minutes(ctx: ExecutionContext) -> ScheduleDefinition {
    ScheduleDefinition {
        cron_expression: "*/5 * * * *".into(),
        payload: json!({ "digest": "weekly" }),
        context: ctx,
    }
}

#[tokio::test]
async fn test_schedule_sweep_triggers_due_workflow() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("digest")]).await;
    let schedule = h
        .engine
        .create_schedule("acme", workflow.id, every_five_minutes(subscriber("a@b.com")))
        .await
        .unwrap();
    assert!(schedule.is_active);
    assert!(schedule.next_execution_at > schedule.created_at);

    // Nothing fires before the first cron time.
    assert_eq!(h.scheduler.sweep_schedules_at(schedule.created_at).await.unwrap(), 0);
    assert_eq!(h.queue.len(), 0);

    let fired_at = Utc::now() + Duration::minutes(10);
    assert_eq!(h.scheduler.sweep_schedules_at(fired_at).await.unwrap(), 1);
    h.queue.drain().await;

    let executions = h.engine.list_executions("acme", &ExecutionFilter::default()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].trigger_id, format!("schedule:{}", schedule.id));
    assert_eq!(executions[0].payload["digest"], "weekly");
    assert_eq!(h.notifications.sent_count(), 1);

    let schedules = h.engine.list_schedules("acme", workflow.id).await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].last_execution_at, Some(fired_at));
    assert!(schedules[0].next_execution_at > fired_at);

    // Already advanced past this sweep time.
    assert_eq!(h.scheduler.sweep_schedules_at(fired_at).await.unwrap(), 0);
}

#[tokio::test]
async fn test_schedule_of_paused_workflow_still_advances() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("digest")]).await;
    let schedule = h
        .engine
        .create_schedule("acme", workflow.id, every_five_minutes(subscriber("a@b.com")))
        .await
        .unwrap();
    h.engine.pause_workflow("acme", workflow.id).await.unwrap();

    let fired_at = Utc::now() + Duration::minutes(10);
    assert_eq!(h.scheduler.sweep_schedules_at(fired_at).await.unwrap(), 0);
    assert_eq!(h.queue.len(), 0);

    let stored = h.store.get_schedule("acme", schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.last_execution_at, Some(fired_at));
    assert!(stored.next_execution_at > fired_at);
    assert!(h.engine.list_executions("acme", &ExecutionFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_cron_and_unknown_workflow_are_rejected() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("digest")]).await;

    let err = h
        .engine
        .create_schedule(
            "acme",
            workflow.id,
            ScheduleDefinition {
                cron_expression: "every monday".into(),
                payload: Value::Null,
                context: ExecutionContext::default(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowValidation(_)));

    let err = h
        .engine
        .create_schedule("globex", workflow.id, every_five_minutes(ExecutionContext::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowNotFound(_)));

    let err = h.engine.delete_schedule("acme", Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::ScheduleNotFound(_)));
}

#[tokio::test]
async fn test_update_workflow_replaces_steps() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let updated = h
        .engine
        .update_workflow(
            "acme",
            workflow.id,
            WorkflowDefinition {
                tenant_id: None,
                name: "Welcome v2".into(),
                description: "webhook only".into(),
                trigger: WorkflowTrigger::event("user.created"),
                steps: vec![WorkflowStep::new(
                    "hook",
                    StepConfig::Webhook(notiflow_engine::model::WebhookConfig {
                        url: "https://hooks.example.com/in".into(),
                        method: "POST".into(),
                        headers: Default::default(),
                        body: None,
                    }),
                )
                .with_id("hook")],
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.id, workflow.id);
    assert_eq!(updated.status, WorkflowStatus::Active);

    let execution = h
        .engine
        .trigger_by_identifier("acme", "user.created", json!({}), subscriber("a@b.com"))
        .await
        .unwrap();
    h.queue.drain().await;

    let execution = h.engine.get_execution("acme", execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps[0].step_id, "hook");
    assert_eq!(h.notifications.sent_count(), 0);
    assert_eq!(h.webhooks.delivered.lock().unwrap().len(), 1);

    // A definition for another tenant is refused.
    let err = h
        .engine
        .update_workflow(
            "acme",
            workflow.id,
            WorkflowDefinition {
                tenant_id: Some("globex".into()),
                name: "Stolen".into(),
                description: String::new(),
                trigger: WorkflowTrigger::event("user.created"),
                steps: vec![email("welcome")],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowValidation(_)));
}

#[tokio::test]
async fn test_delete_workflow_keeps_executions() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;
    let schedule = h
        .engine
        .create_schedule("acme", workflow.id, every_five_minutes(subscriber("a@b.com")))
        .await
        .unwrap();
    let id = trigger(&h, &workflow, subscriber("a@b.com"), json!({})).await;
    h.queue.drain().await;

    // Another tenant cannot delete it.
    let err = h.engine.delete_workflow("globex", workflow.id).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowNotFound(_)));

    h.engine.delete_workflow("acme", workflow.id).await.unwrap();
    assert!(matches!(
        h.engine.get_workflow("acme", workflow.id).await.unwrap_err(),
        Error::WorkflowNotFound(_)
    ));
    assert!(h.store.get_schedule("acme", schedule.id).await.unwrap().is_none());
    assert_eq!(
        h.scheduler
            .sweep_schedules_at(Utc::now() + Duration::hours(1))
            .await
            .unwrap(),
        0
    );

    let execution = h.engine.get_execution("acme", id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let err = h.engine.delete_workflow("acme", workflow.id).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowNotFound(_)));
}

#[tokio::test]
async fn test_archived_workflow_rejects_triggers() {
    let h = harness();
    let workflow = active_workflow(&h, vec![email("welcome")]).await;

    let archived = h.engine.archive_workflow("acme", workflow.id).await.unwrap();
    assert_eq!(archived.status, WorkflowStatus::Archived);

    let err = h
        .engine
        .trigger_workflow("acme", workflow.id, "user.signup", json!({}), subscriber("a@b.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowInactive(_)));

    let err = h.engine.activate_workflow("acme", workflow.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}
