use thiserror::Error;

use crate::models::run::RunStatus;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("migration {name} failed: {reason}")]
    Migration { name: String, reason: String },

    #[error("deployment failed: {0}")]
    Deployment(String),

    #[error("health check still unhealthy after {rounds} rounds")]
    HealthCheckTimeout { rounds: u32 },

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("notification delivery to {channel} failed: {reason}")]
    NotificationDelivery { channel: String, reason: String },

    #[error("a deployment run is already in progress for {environment} (lock: {lock})")]
    RunInProgress { environment: String, lock: String },

    #[error("run cancelled before {stage}")]
    Cancelled { stage: String },

    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
