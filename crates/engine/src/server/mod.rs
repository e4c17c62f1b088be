mod routes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::WorkflowEngine;

pub use routes::TriggerRequest;

pub struct Server {
    engine: Arc<WorkflowEngine>,
}

impl Server {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route(
                "/tenants/{tenant}/workflows",
                get(routes::list_workflows).post(routes::create_workflow),
            )
            .route(
                "/tenants/{tenant}/workflows/{id}",
                get(routes::get_workflow)
                    .put(routes::update_workflow)
                    .delete(routes::delete_workflow),
            )
            .route("/tenants/{tenant}/workflows/{id}/activate", post(routes::activate_workflow))
            .route("/tenants/{tenant}/workflows/{id}/pause", post(routes::pause_workflow))
            .route("/tenants/{tenant}/workflows/{id}/archive", post(routes::archive_workflow))
            .route(
                "/tenants/{tenant}/workflows/{id}/schedules",
                get(routes::list_schedules).post(routes::create_schedule),
            )
            .route("/tenants/{tenant}/schedules/{id}", delete(routes::delete_schedule))
            .route("/tenants/{tenant}/triggers/{identifier}", post(routes::trigger))
            .route("/tenants/{tenant}/executions", get(routes::list_executions))
            .route("/tenants/{tenant}/executions/failed", get(routes::failed_executions))
            .route("/tenants/{tenant}/executions/{id}", get(routes::get_execution))
            .route("/tenants/{tenant}/executions/{id}/cancel", post(routes::cancel_execution))
            .route("/tenants/{tenant}/executions/{id}/retry", post(routes::retry_execution))
            .layer(TraceLayer::new_for_http())
            .with_state(self.engine)
    }
}
