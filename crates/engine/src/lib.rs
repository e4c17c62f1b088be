pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod template;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("workflow is not active: {0}")]
    WorkflowInactive(String),
    #[error("workflow must have at least one step")]
    WorkflowNoSteps,
    #[error("workflow validation failed: {0}")]
    WorkflowValidation(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("no {0} recipient found in context")]
    MissingRecipient(String),
    #[error("no template_id specified in step configuration")]
    MissingTemplate,
    #[error("unsupported step type: {0}")]
    UnsupportedStepType(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("worker pool queue is full")]
    QueueFull,
    #[error("condition error: {0}")]
    Condition(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient errors are eligible for step-level retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
