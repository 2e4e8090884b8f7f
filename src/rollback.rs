use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupCoordinator;
use crate::components::{ServiceControl, StatefulComponent};
use crate::error::{DeployError, Result};
use crate::health::HealthChecker;
use crate::models::artifact::{ArtifactKind, ArtifactStatus, BackupArtifact};
use crate::models::health::HealthReport;
use crate::models::run::{DeploymentRun, Release};
use crate::state_db::StateDb;

/// What to roll back to. The default restores the newest restorable
/// artifact and reverts to the newest known-good release.
#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    /// Restore from this artifact instead of the newest restorable one.
    pub artifact_id: Option<String>,
    /// Revert services to this revision instead of the newest known-good one.
    pub revision: Option<String>,
    /// Restore stateful components. Off for revision-only rollbacks.
    pub restore_data: bool,
    /// Accept an unusable artifact (verified components only) or a revision
    /// missing from the known-good history.
    pub force: bool,
}

impl RollbackRequest {
    pub fn automatic() -> Self {
        Self {
            restore_data: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub reason: String,
    pub forensic_backup: Option<String>,
    pub restored_from: Option<String>,
    pub restored_components: Vec<String>,
    pub skipped_components: Vec<String>,
    pub reverted_to: Option<Release>,
    pub health: Option<HealthReport>,
    pub error: Option<String>,
}

pub struct RollbackController {
    environment: String,
    backup: Arc<BackupCoordinator>,
    components: Vec<Arc<dyn StatefulComponent>>,
    control: Arc<dyn ServiceControl>,
    health: Arc<HealthChecker>,
    state: Arc<StateDb>,
    services: Vec<String>,
    dependents: Vec<String>,
    control_timeout: Duration,
    restore_timeout: Duration,
}

impl RollbackController {
    pub fn new(
        environment: &str,
        backup: Arc<BackupCoordinator>,
        components: Vec<Arc<dyn StatefulComponent>>,
        control: Arc<dyn ServiceControl>,
        health: Arc<HealthChecker>,
        state: Arc<StateDb>,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            backup,
            components,
            control,
            health,
            state,
            services: Vec::new(),
            dependents: Vec::new(),
            control_timeout: Duration::from_secs(300),
            restore_timeout: Duration::from_secs(600),
        }
    }

    /// `services` are restarted after the revert; `dependents` are stopped
    /// while stateful components are restored. Empty `dependents` means all
    /// services.
    pub fn with_services(mut self, services: Vec<String>, dependents: Vec<String>) -> Self {
        self.services = services;
        self.dependents = dependents;
        self
    }

    pub fn with_timeouts(mut self, control: Duration, restore: Duration) -> Self {
        self.control_timeout = control;
        self.restore_timeout = restore;
        self
    }

    /// Reverse a failed deployment. Never returns an error: the outcome
    /// records how far the rollback got. `success == false` means the
    /// environment needs an operator.
    pub async fn rollback(&self, run: Option<&DeploymentRun>, reason: &str, request: &RollbackRequest) -> RollbackOutcome {
        tracing::warn!("rollback of {} started: {reason}", self.environment);
        let mut outcome = RollbackOutcome {
            reason: reason.to_string(),
            ..RollbackOutcome::default()
        };

        // Forensic capture of the failed state; best effort.
        match self.backup.create_backup(ArtifactKind::PreRollback).await {
            Ok(artifact) => outcome.forensic_backup = Some(artifact.id),
            Err(e) => tracing::warn!("rollback: pre-rollback backup failed, continuing: {e}"),
        }

        match self.execute(run, request, &mut outcome).await {
            Ok(()) => {
                outcome.success = true;
                tracing::info!("rollback of {} complete", self.environment);
            }
            Err(e) => {
                tracing::error!("{e}");
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    async fn execute(
        &self,
        run: Option<&DeploymentRun>,
        request: &RollbackRequest,
        outcome: &mut RollbackOutcome,
    ) -> Result<()> {
        let artifact = if request.restore_data {
            self.choose_artifact(run, request)?
        } else {
            None
        };
        let release = self.choose_release(request)?;

        let holder = format!("rollback-{}", run.map_or_else(|| uuid::Uuid::new_v4().to_string(), |r| r.id.clone()));
        let lease = match &artifact {
            Some(a) => Some(self.backup.store().acquire(&a.id, &holder)?),
            None => None,
        };

        if let Some(artifact) = &artifact {
            let dependents = if self.dependents.is_empty() {
                &self.services
            } else {
                &self.dependents
            };
            if !dependents.is_empty() {
                tracing::info!("rollback: stopping {}", dependents.join(", "));
                self.control_call("stop", self.control.stop(dependents)).await?;
            }
            self.restore(artifact, outcome).await?;
            outcome.restored_from = Some(artifact.id.clone());
        }

        match release {
            Some(release) => {
                tracing::info!("rollback: reverting services to {}", release.revision);
                self.control_call("deploy", self.control.deploy(&release)).await?;
                outcome.reverted_to = Some(release);
            }
            None => tracing::warn!("rollback: no known-good release recorded, services keep their current version"),
        }

        if !self.services.is_empty() {
            self.control_call("start", self.control.start(&self.services)).await?;
        }

        let report = self.health.check().await;
        let unhealthy = report.is_unhealthy();
        let failing = report.failing_services().join(", ");
        outcome.health = Some(report);
        drop(lease);
        if unhealthy {
            return Err(DeployError::Rollback(format!(
                "services still unhealthy after rollback: {failing}"
            )));
        }
        Ok(())
    }

    fn choose_artifact(&self, run: Option<&DeploymentRun>, request: &RollbackRequest) -> Result<Option<BackupArtifact>> {
        let store = self.backup.store();
        if let Some(id) = &request.artifact_id {
            let artifact = store
                .get(id)?
                .ok_or_else(|| DeployError::Rollback(format!("artifact {id} not found")))?;
            if artifact.status == ArtifactStatus::Unusable && !request.force {
                return Err(DeployError::Rollback(format!(
                    "artifact {id} is unusable (failed: {}); pass --force to restore its verified components",
                    artifact.failed_components().join(", ")
                )));
            }
            return Ok(Some(artifact));
        }

        let own = match run.and_then(|r| r.backup_artifact_id.as_deref()) {
            Some(id) => store.get(id)?.filter(|a| a.status != ArtifactStatus::Unusable),
            None => None,
        };
        let artifact = match own {
            Some(a) => Some(a),
            None => store.latest_restorable(&self.environment)?,
        };
        match &artifact {
            Some(a) if a.status == ArtifactStatus::Degraded => tracing::warn!(
                "rollback: restoring from degraded artifact {}, skipping {}",
                a.id,
                a.failed_components().join(", ")
            ),
            Some(_) => {}
            None => tracing::warn!("rollback: no restorable artifact for {}, data is not restored", self.environment),
        }
        Ok(artifact)
    }

    fn choose_release(&self, request: &RollbackRequest) -> Result<Option<Release>> {
        match &request.revision {
            Some(revision) => match self.state.known_good_by_revision(&self.environment, revision)? {
                Some(release) => Ok(Some(release)),
                None if request.force => Ok(Some(Release {
                    revision: revision.clone(),
                    versions: Default::default(),
                })),
                None => Err(DeployError::Rollback(format!(
                    "revision {revision} never succeeded in {}; pass --force to deploy it anyway",
                    self.environment
                ))),
            },
            None => Ok(self.state.latest_known_good(&self.environment)?),
        }
    }

    /// Restore every verified component in dependency order. A critical
    /// component that fails to restore aborts the rollback; others are
    /// reported as skipped.
    async fn restore(&self, artifact: &BackupArtifact, outcome: &mut RollbackOutcome) -> Result<()> {
        let mut ordered: Vec<&Arc<dyn StatefulComponent>> = self.components.iter().collect();
        ordered.sort_by_key(|c| c.restore_order());

        let store = self.backup.store();
        for component in ordered {
            let name = component.name();
            let Some(archive) = artifact.component(name).filter(|a| a.is_verified()) else {
                tracing::warn!("rollback: {name} has no verified archive in {}, skipping", artifact.id);
                outcome.skipped_components.push(name.to_string());
                continue;
            };

            let restored = match store.verify_component(&artifact.id, archive) {
                Ok(payload) => match tokio::time::timeout(self.restore_timeout, component.restore(&payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("restore timed out after {}s", self.restore_timeout.as_secs())),
                },
                Err(e) => Err(e),
            };
            match restored {
                Ok(()) => {
                    tracing::info!("rollback: restored {name} from {}", artifact.id);
                    outcome.restored_components.push(name.to_string());
                }
                Err(e) if component.is_critical() => {
                    return Err(DeployError::Rollback(format!("restoring {name}: {e}")));
                }
                Err(e) => {
                    tracing::warn!("rollback: restoring {name} failed, continuing: {e}");
                    outcome.skipped_components.push(name.to_string());
                }
            }
        }
        Ok(())
    }

    async fn control_call(
        &self,
        action: &str,
        call: impl std::future::Future<Output = anyhow::Result<()>>,
    ) -> Result<()> {
        match tokio::time::timeout(self.control_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeployError::Rollback(format!("{action} failed: {e}"))),
            Err(_) => Err(DeployError::Rollback(format!(
                "{action} timed out after {}s",
                self.control_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::ArtifactStore;
    use crate::models::health::Verdict;
    use crate::retry::RetryPolicy;
    use crate::testing::{FakeControl, MemoryComponent, ScriptedProbe};

    struct Fixture {
        _dir: tempfile::TempDir,
        pg: Arc<MemoryComponent>,
        conf: Arc<MemoryComponent>,
        control: Arc<FakeControl>,
        state: Arc<StateDb>,
        backup: Arc<BackupCoordinator>,
        store: Arc<ArtifactStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let pg = MemoryComponent::new("postgres", b"v1-rows").critical().with_order(10);
        let conf = MemoryComponent::new("config", b"v1-conf").with_order(90);
        let components: Vec<Arc<dyn StatefulComponent>> = vec![pg.clone(), conf.clone()];
        let backup = Arc::new(
            BackupCoordinator::new(components, Arc::clone(&store), "staging", chrono::Duration::days(7))
                .with_verify_retry(RetryPolicy::once()),
        );
        Fixture {
            _dir: dir,
            pg,
            conf,
            control: FakeControl::new(),
            state: Arc::new(StateDb::open_in_memory().unwrap()),
            backup,
            store,
        }
    }

    fn controller(f: &Fixture, verdicts: &[Verdict]) -> RollbackController {
        let health = HealthChecker::new(vec![ScriptedProbe::new("proxy", true, verdicts)])
            .with_rounds(1, Duration::ZERO);
        RollbackController::new(
            "staging",
            Arc::clone(&f.backup),
            vec![f.conf.clone(), f.pg.clone()],
            f.control.clone(),
            Arc::new(health),
            Arc::clone(&f.state),
        )
        .with_services(vec!["api".into(), "proxy".into()], vec!["api".into()])
    }

    #[tokio::test]
    async fn restores_state_and_reverts_release() {
        let f = fixture();
        let good = Release {
            revision: "abc123".into(),
            versions: [("api".to_string(), "api:1.0".to_string())].into(),
        };
        f.state.record_known_good("staging", &good, "run-0").unwrap();
        let artifact = f.backup.create_backup(ArtifactKind::PreDeploy).await.unwrap();

        f.pg.set_data(b"v2-half-migrated");
        f.conf.set_data(b"v2-conf");

        let outcome = controller(&f, &[Verdict::Pass])
            .rollback(None, "health check failed", &RollbackRequest::automatic())
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.restored_from.as_deref(), Some(artifact.id.as_str()));
        assert_eq!(outcome.restored_components, vec!["postgres", "config"]);
        assert_eq!(outcome.reverted_to, Some(good));
        assert!(outcome.forensic_backup.is_some());
        assert_eq!(f.pg.data(), b"v1-rows");
        assert_eq!(f.conf.data(), b"v1-conf");
        assert_eq!(f.control.calls(), vec!["stop api", "deploy abc123", "start api,proxy"]);
        // lease released, artifact kept
        assert_eq!(f.store.ref_count(&artifact.id).unwrap(), 0);
        assert!(f.store.get(&artifact.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn degraded_artifact_restores_verified_components_only() {
        let f = fixture();
        f.conf.fail_dump(true);
        let artifact = f.backup.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Degraded);
        f.conf.fail_dump(false);
        f.pg.set_data(b"broken");
        f.conf.set_data(b"current-conf");

        let outcome = controller(&f, &[Verdict::Pass])
            .rollback(None, "migration failed", &RollbackRequest::automatic())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.restored_components, vec!["postgres"]);
        assert_eq!(outcome.skipped_components, vec!["config"]);
        assert_eq!(f.conf.data(), b"current-conf");
    }

    #[tokio::test]
    async fn unhealthy_after_rollback_fails() {
        let f = fixture();
        f.backup.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        let outcome = controller(&f, &[Verdict::Fail])
            .rollback(None, "deploy failed", &RollbackRequest::automatic())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("proxy"));
    }

    #[tokio::test]
    async fn unusable_artifact_needs_force() {
        let f = fixture();
        f.pg.fail_dump(true);
        let artifact = f.backup.create_backup(ArtifactKind::Manual).await.unwrap();
        f.pg.fail_dump(false);
        let request = RollbackRequest {
            artifact_id: Some(artifact.id.clone()),
            restore_data: true,
            ..RollbackRequest::default()
        };
        let ctl = controller(&f, &[Verdict::Pass]);
        let refused = ctl.rollback(None, "manual", &request).await;
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("--force"));

        let forced = ctl
            .rollback(None, "manual", &RollbackRequest { force: true, ..request })
            .await;
        assert!(forced.success);
        assert_eq!(forced.restored_components, vec!["config"]);
    }

    #[tokio::test]
    async fn revision_rollback_requires_history_unless_forced() {
        let f = fixture();
        let ctl = controller(&f, &[Verdict::Pass]);
        let request = RollbackRequest {
            revision: Some("deadbeef".into()),
            ..RollbackRequest::default()
        };
        assert!(!ctl.rollback(None, "manual", &request).await.success);

        let forced = ctl
            .rollback(None, "manual", &RollbackRequest { force: true, ..request })
            .await;
        assert!(forced.success);
        assert!(forced.restored_from.is_none());
        assert_eq!(f.control.deployed().last().unwrap().revision, "deadbeef");
    }

    #[tokio::test]
    async fn critical_restore_failure_aborts() {
        let f = fixture();
        f.backup.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        f.pg.fail_restore(true);
        let outcome = controller(&f, &[Verdict::Pass])
            .rollback(None, "deploy failed", &RollbackRequest::automatic())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("postgres"));
        assert!(f.control.deployed().is_empty());
    }
}
