pub mod artifact_store;
pub mod backup;
pub mod components;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod health;
pub mod migrations;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod retention;
pub mod retry;
pub mod rollback;
pub mod state_db;
pub mod validation;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use context::DeployContext;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<DeployContext>,
}
