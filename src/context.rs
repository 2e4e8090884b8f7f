use std::sync::Arc;
use std::time::Duration;

use crate::artifact_store::ArtifactStore;
use crate::backup::BackupCoordinator;
use crate::components::{CommandServiceControl, ServiceControl, StatefulComponent, build_components};
use crate::config::ShipyardConfig;
use crate::health::HealthChecker;
use crate::migrations::{MIGRATION_DB, MigrationRunner};
use crate::notifier::NotificationDispatcher;
use crate::retry::RetryPolicy;
use crate::rollback::RollbackController;
use crate::state_db::StateDb;
use crate::validation::Validator;

/// Everything a command needs, built once from the loaded config.
pub struct DeployContext {
    pub config: Arc<ShipyardConfig>,
    pub state: Arc<StateDb>,
    pub store: Arc<ArtifactStore>,
    pub components: Vec<Arc<dyn StatefulComponent>>,
    pub control: Arc<dyn ServiceControl>,
    pub backup: Arc<BackupCoordinator>,
    pub migrations: MigrationRunner,
    pub health: Arc<HealthChecker>,
    pub notifier: Arc<NotificationDispatcher>,
}

impl DeployContext {
    pub fn from_config(config: ShipyardConfig) -> anyhow::Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let components = build_components(
            &config.components,
            Duration::from_secs(config.artifacts.capture_timeout_secs),
        )?;
        let control: Arc<dyn ServiceControl> = Arc::new(CommandServiceControl::new(config.services.clone()));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health.deadline_secs))
            .build()?;
        let health = HealthChecker::from_config(&config.health, &config.services, Arc::clone(&control), client);
        let notifier = NotificationDispatcher::from_config(&config.notifications, retry)?;
        Self::assemble(config, components, control, health, notifier)
    }

    /// Wire the stores and coordinators around already-built collaborators.
    pub fn assemble(
        config: ShipyardConfig,
        components: Vec<Arc<dyn StatefulComponent>>,
        control: Arc<dyn ServiceControl>,
        health: HealthChecker,
        notifier: NotificationDispatcher,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(StateDb::open(&config.deployment.state_db)?);
        let store = Arc::new(ArtifactStore::open(&config.artifacts.root)?);
        let migrations = MigrationRunner::new(&config.migrations);
        let mut components = components;
        if !components.iter().any(|c| c.name() == MIGRATION_DB) {
            components.insert(0, Arc::new(migrations.clone()));
        }
        let backup = BackupCoordinator::new(
            components.clone(),
            Arc::clone(&store),
            &config.deployment.environment,
            config.retention(),
        )
        .with_capture_timeout(Duration::from_secs(config.artifacts.capture_timeout_secs))
        .with_max_parallel(config.artifacts.max_parallel)
        .with_verify_retry(RetryPolicy::from(&config.retry));

        tracing::debug!(
            "context for {}: {} components, {} probes, {} notification channels",
            config.deployment.environment,
            components.len(),
            health.services().len(),
            notifier.channel_count()
        );

        Ok(Self {
            config: Arc::new(config),
            state,
            store,
            components,
            control,
            backup: Arc::new(backup),
            migrations,
            health: Arc::new(health),
            notifier: Arc::new(notifier),
        })
    }

    pub fn environment(&self) -> &str {
        &self.config.deployment.environment
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.config.validation.clone()).with_components(self.components.clone())
    }

    pub fn rollback_controller(&self) -> RollbackController {
        let services = &self.config.services;
        RollbackController::new(
            self.environment(),
            Arc::clone(&self.backup),
            self.components.clone(),
            Arc::clone(&self.control),
            Arc::clone(&self.health),
            Arc::clone(&self.state),
        )
        .with_services(services.names.clone(), services.dependents.clone())
        .with_timeouts(
            Duration::from_secs(services.timeout_secs),
            Duration::from_secs(self.config.artifacts.capture_timeout_secs),
        )
    }
}
