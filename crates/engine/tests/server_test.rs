use axum::http::StatusCode;
use notiflow_engine::{
    config::{EngineConfig, PoolConfig},
    dispatcher::{HttpWebhookSender, LogNotificationSender, StepDispatcher},
    engine::WorkflowEngine,
    events::TracingPublisher,
    pool::WorkerPool,
    server::Server,
    store::{create_store, DatabaseConfig, TenantStores},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn test_server() -> (axum_test::TestServer, Arc<WorkerPool>) {
    let store = create_store(&DatabaseConfig::in_memory_sqlite())
        .await
        .expect("Failed to create store");
    store.init().await.expect("Failed to initialize store");

    let config = EngineConfig::default();
    let pool = Arc::new(WorkerPool::start(&PoolConfig {
        workers: 2,
        queue_capacity: 16,
    }));
    let dispatcher = StepDispatcher::new(
        Arc::new(LogNotificationSender),
        Arc::new(HttpWebhookSender::new(config.step_timeout).unwrap()),
    );
    let engine = WorkflowEngine::new(
        TenantStores::new(store),
        dispatcher,
        Arc::new(TracingPublisher),
        pool.clone(),
        &config,
    );

    let app = Server::new(engine).build_router();
    (axum_test::TestServer::new(app).unwrap(), pool)
}

fn welcome_definition() -> Value {
    json!({
        "name": "Welcome",
        "trigger": { "type": "event", "identifier": "user.signup" },
        "steps": [
            { "id": "welcome", "type": "email", "name": "Welcome email",
              "config": { "template_id": "WELCOME", "subject": "Hi {{ subscriber.first_name }}" } }
        ]
    })
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (client, _pool) = test_server().await;

    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_trigger_runs_workflow_to_completion() {
    let (client, pool) = test_server().await;

    let response = client.post("/tenants/acme/workflows").json(&welcome_definition()).await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let workflow: Value = response.json();
    assert_eq!(workflow["status"], "draft");
    let workflow_id = workflow["id"].as_str().unwrap().to_string();

    // Draft workflows do not answer triggers yet.
    let response = client
        .post("/tenants/acme/triggers/user.signup")
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = client
        .post(&format!("/tenants/acme/workflows/{}/activate", workflow_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let workflow: Value = response.json();
    assert_eq!(workflow["status"], "active");

    let response = client
        .post("/tenants/acme/triggers/user.signup")
        .json(&json!({
            "payload": { "plan": "pro" },
            "context": { "subscriber": { "email": "ada@example.com", "first_name": "Ada" } }
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let execution: Value = response.json();
    let execution_id = execution["id"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..50 {
        let body: Value = client
            .get(&format!("/tenants/acme/executions/{}", execution_id))
            .await
            .json();
        status = body["status"].clone();
        if status == "completed" {
            assert_eq!(body["steps"][0]["step_id"], "welcome");
            assert_eq!(body["steps"][0]["result"]["recipient"], "ada@example.com");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "completed");

    let listed: Vec<Value> = client
        .get("/tenants/acme/executions")
        .add_query_param("status", "completed")
        .await
        .json();
    assert_eq!(listed.len(), 1);

    // Other tenants see nothing.
    let response = client.get(&format!("/tenants/globex/executions/{}", execution_id)).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_error_bodies() {
    let (client, _pool) = test_server().await;

    let response = client
        .get(&format!("/tenants/acme/executions/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().starts_with("execution not found"));

    let mut definition = welcome_definition();
    definition["steps"][0]["next_steps"] = json!(["missing"]);
    let response = client.post("/tenants/acme/workflows").json(&definition).await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("unknown next step 'missing'"));

    let mut definition = welcome_definition();
    definition["steps"] = json!([]);
    let workflow: Value = client.post("/tenants/acme/workflows").json(&definition).await.json();
    let response = client
        .post(&format!("/tenants/acme/workflows/{}/activate", workflow["id"].as_str().unwrap()))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["error"], "workflow must have at least one step");
}

#[tokio::test]
async fn test_cancel_and_retry_conflicts() {
    let (client, _pool) = test_server().await;

    let workflow: Value = client
        .post("/tenants/acme/workflows")
        .json(&welcome_definition())
        .await
        .json();
    client
        .post(&format!("/tenants/acme/workflows/{}/activate", workflow["id"].as_str().unwrap()))
        .await;

    // No subscriber email: the execution fails on its first step.
    let execution: Value = client
        .post("/tenants/acme/triggers/user.signup")
        .json(&json!({}))
        .await
        .json();
    let execution_id = execution["id"].as_str().unwrap().to_string();

    let mut failed = Vec::new();
    for _ in 0..50 {
        failed = client.get("/tenants/acme/executions/failed").await.json::<Vec<Value>>();
        if !failed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["failed_step_id"], "welcome");

    let response = client
        .post(&format!("/tenants/acme/executions/{}/cancel", execution_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    let response = client
        .post(&format!("/tenants/acme/executions/{}/retry", execution_id))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_workflow_update_schedules_and_delete() {
    let (client, _pool) = test_server().await;

    let workflow: Value = client
        .post("/tenants/acme/workflows")
        .json(&welcome_definition())
        .await
        .json();
    let workflow_id = workflow["id"].as_str().unwrap().to_string();
    let path = format!("/tenants/acme/workflows/{}", workflow_id);

    let mut definition = welcome_definition();
    definition["name"] = json!("Welcome v2");
    definition["trigger"]["identifier"] = json!("user.created");
    let response = client.put(&path).json(&definition).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let updated: Value = response.json();
    assert_eq!(updated["id"], workflow["id"]);
    assert_eq!(updated["name"], "Welcome v2");
    assert_eq!(updated["trigger"]["identifier"], "user.created");

    let response = client
        .post(&format!("{}/schedules", path))
        .json(&json!({ "cron_expression": "not cron" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = client
        .post(&format!("{}/schedules", path))
        .json(&json!({
            "cron_expression": "0 9 * * 1",
            "context": { "subscriber": { "email": "ada@example.com" } }
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let schedule: Value = response.json();
    assert_eq!(schedule["workflow_id"], workflow["id"]);
    assert_eq!(schedule["is_active"], true);

    let schedules: Vec<Value> = client.get(&format!("{}/schedules", path)).await.json();
    assert_eq!(schedules.len(), 1);

    let schedule_path = format!("/tenants/acme/schedules/{}", schedule["id"].as_str().unwrap());
    assert_eq!(client.delete(&schedule_path).await.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(client.delete(&schedule_path).await.status_code(), StatusCode::NOT_FOUND);

    let response = client.post(&format!("{}/archive", path)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let archived: Value = response.json();
    assert_eq!(archived["status"], "archived");
    let response = client.post(&format!("{}/activate", path)).await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    assert_eq!(client.delete(&path).await.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(client.get(&path).await.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(client.delete(&path).await.status_code(), StatusCode::NOT_FOUND);
}
