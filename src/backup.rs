use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact_store::ArtifactStore;
use crate::components::StatefulComponent;
use crate::error::{DeployError, Result};
use crate::models::artifact::{ArtifactKind, ArtifactStatus, BackupArtifact, ComponentArchive, VerificationStatus};
use crate::retry::RetryPolicy;

/// Captures every stateful component into one artifact.
pub struct BackupCoordinator {
    components: Vec<Arc<dyn StatefulComponent>>,
    store: Arc<ArtifactStore>,
    environment: String,
    retention: chrono::Duration,
    capture_timeout: Duration,
    max_parallel: usize,
    verify_retry: RetryPolicy,
}

impl BackupCoordinator {
    pub fn new(
        components: Vec<Arc<dyn StatefulComponent>>,
        store: Arc<ArtifactStore>,
        environment: &str,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            components,
            store,
            environment: environment.to_string(),
            retention,
            capture_timeout: Duration::from_secs(600),
            max_parallel: 4,
            verify_retry: RetryPolicy::default(),
        }
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_verify_retry(mut self, retry: RetryPolicy) -> Self {
        self.verify_retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Capture all components concurrently and persist the artifact once
    /// every capture has reported. Component failures degrade the artifact
    /// instead of aborting the others; the returned artifact may therefore be
    /// `degraded` or `unusable` and callers decide what that means for them.
    pub async fn create_backup(&self, kind: ArtifactKind) -> Result<BackupArtifact> {
        if self.components.is_empty() {
            return Err(DeployError::Backup("no stateful components configured".to_string()));
        }

        let artifact_id = ArtifactStore::new_artifact_id(kind);
        let created_at = Utc::now();
        tracing::info!(
            "backup {artifact_id}: capturing {} components ({})",
            self.components.len(),
            kind.as_str()
        );

        let captures: Vec<_> = self
            .components
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, component)| {
                let capture = Capture {
                    store: Arc::clone(&self.store),
                    artifact_id: artifact_id.clone(),
                    timeout: self.capture_timeout,
                    verify_retry: self.verify_retry.clone(),
                };
                async move { (idx, capture.run(component).await) }
            })
            .collect();
        let mut captured: Vec<(usize, ComponentArchive)> = stream::iter(captures)
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;
        captured.sort_by_key(|(idx, _)| *idx);

        let mut artifact = BackupArtifact {
            id: artifact_id,
            kind,
            environment: self.environment.clone(),
            created_at,
            expires_at: created_at + self.retention,
            components: captured.into_iter().map(|(_, c)| c).collect(),
            total_size: 0,
            status: ArtifactStatus::Unusable,
        };
        artifact.refresh_status();

        self.store
            .save(&artifact)
            .map_err(|e| DeployError::Backup(format!("saving artifact index: {e}")))?;

        match artifact.status {
            ArtifactStatus::Verified => {
                tracing::info!("backup {}: verified ({} bytes)", artifact.id, artifact.total_size)
            }
            ArtifactStatus::Degraded => tracing::warn!(
                "backup {}: degraded, failed components: {}",
                artifact.id,
                artifact.failed_components().join(", ")
            ),
            ArtifactStatus::Unusable => tracing::error!(
                "backup {}: unusable, failed components: {}",
                artifact.id,
                artifact.failed_components().join(", ")
            ),
        }
        Ok(artifact)
    }

    /// Re-run integrity checks on a stored artifact and record the result.
    pub async fn verify(&self, artifact_id: &str) -> Result<BackupArtifact> {
        let mut artifact = self
            .store
            .get(artifact_id)?
            .ok_or_else(|| DeployError::Backup(format!("artifact {artifact_id} not found")))?;

        for archive in artifact.components.iter_mut() {
            if archive.file_name.is_empty() {
                // never captured
                continue;
            }
            match self.store.verify_component(artifact_id, archive) {
                Ok(_) => {
                    archive.verification = VerificationStatus::Verified;
                    archive.error = None;
                }
                Err(e) => {
                    tracing::warn!("artifact {artifact_id}: {} failed verification: {e}", archive.name);
                    archive.verification = VerificationStatus::Failed;
                    archive.error = Some(e.to_string());
                }
            }
        }
        artifact.refresh_status();
        self.store.record_verification(&artifact)?;
        Ok(artifact)
    }

    pub fn list(&self) -> Result<Vec<BackupArtifact>> {
        Ok(self.store.list(Some(&self.environment))?)
    }
}

/// Periodic backups while `serve` is running. Follows the same pattern as
/// the retention sweeper.

/// Everything one component capture needs, owned so the capture future can
/// be polled from any worker thread.
struct Capture {
    store: Arc<ArtifactStore>,
    artifact_id: String,
    timeout: Duration,
    verify_retry: RetryPolicy,
}

impl Capture {
    async fn run(self, component: Arc<dyn StatefulComponent>) -> ComponentArchive {
        let artifact_id = self.artifact_id.as_str();
        let name = component.name();
        let critical = component.is_critical();

        let raw = match tokio::time::timeout(self.timeout, component.dump()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!("backup {artifact_id}: {name} dump failed: {e}");
                return ComponentArchive::failed(name, critical, e.to_string());
            }
            Err(_) => {
                tracing::warn!("backup {artifact_id}: {name} dump timed out");
                return ComponentArchive::failed(
                    name,
                    critical,
                    format!("dump timed out after {}s", self.timeout.as_secs()),
                );
            }
        };

        let mut archive = match self.store.write_component(artifact_id, name, critical, &raw) {
            Ok(archive) => archive,
            Err(e) => {
                tracing::warn!("backup {artifact_id}: writing {name} failed: {e}");
                return ComponentArchive::failed(name, critical, e.to_string());
            }
        };
        drop(raw);

        let label = format!("verify {name}");
        let store = &self.store;
        let verified = self
            .verify_retry
            .retry(&label, |_| {
                let archive = &archive;
                async move { store.verify_component(artifact_id, archive).map(|_| ()) }
            })
            .await;
        if let Err(e) = verified {
            tracing::warn!("backup {artifact_id}: {name} failed verification: {e}");
            archive.verification = VerificationStatus::Failed;
            archive.error = Some(e.to_string());
        }
        archive
    }
}

pub fn spawn_backup_schedule(coordinator: Arc<BackupCoordinator>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::info!("scheduled backups: disabled by config");
        return;
    }

    tokio::spawn(async move {
        tracing::info!("scheduled backups: started (interval={interval_secs}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // first tick fires immediately; skip it so startup doesn't dump everything
        interval.tick().await;
        loop {
            interval.tick().await;
            match coordinator.create_backup(ArtifactKind::Scheduled).await {
                Ok(artifact) => tracing::info!(
                    "scheduled backup {} finished: {}",
                    artifact.id,
                    artifact.status.as_str()
                ),
                Err(e) => tracing::error!("scheduled backup failed: {e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryComponent;

    fn coordinator(dir: &std::path::Path, components: Vec<Arc<dyn StatefulComponent>>) -> BackupCoordinator {
        let store = Arc::new(ArtifactStore::open(dir).unwrap());
        BackupCoordinator::new(components, store, "staging", chrono::Duration::days(7))
            .with_verify_retry(RetryPolicy::once())
    }

    #[tokio::test]
    async fn all_components_verified() {
        let dir = tempfile::tempdir().unwrap();
        let pg = MemoryComponent::new("postgres", b"rows").critical();
        let mongo = MemoryComponent::new("mongo", b"docs");
        let coord = coordinator(dir.path(), vec![pg, mongo]);

        let artifact = coord.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Verified);
        assert_eq!(artifact.components.len(), 2);
        assert_eq!(artifact.components[0].name, "postgres");
        assert_eq!(artifact.total_size, 8);
        assert!(coord.store().get(&artifact.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn non_critical_failure_degrades_without_aborting_others() {
        let dir = tempfile::tempdir().unwrap();
        let pg = MemoryComponent::new("postgres", b"rows").critical();
        let druid = MemoryComponent::new("druid", b"segments");
        druid.fail_dump(true);
        let mongo = MemoryComponent::new("mongo", b"docs");
        let coord = coordinator(dir.path(), vec![pg, druid, mongo]);

        let artifact = coord.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Degraded);
        assert!(artifact.can_restore("postgres"));
        assert!(artifact.can_restore("mongo"));
        assert!(!artifact.can_restore("druid"));
    }

    #[tokio::test]
    async fn structured_store_failure_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let pg = MemoryComponent::new("postgres", b"rows").critical();
        pg.fail_dump(true);
        let coord = coordinator(dir.path(), vec![pg, MemoryComponent::new("mongo", b"docs")]);

        let artifact = coord.create_backup(ArtifactKind::PreDeploy).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Unusable);
        assert!(coord.store().latest_restorable("staging").unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_dump_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let slow = MemoryComponent::new("analytics", b"x");
        slow.set_dump_delay(Duration::from_secs(5));
        let coord = coordinator(dir.path(), vec![MemoryComponent::new("postgres", b"rows").critical(), slow])
            .with_capture_timeout(Duration::from_millis(50));

        let artifact = coord.create_backup(ArtifactKind::Manual).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Degraded);
        let failed = artifact.component("analytics").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn backup_runs_on_a_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let coord = Arc::new(coordinator(
            dir.path(),
            vec![
                MemoryComponent::new("postgres", b"rows").critical(),
                MemoryComponent::new("mongo", b"docs"),
            ],
        ));

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_backup(ArtifactKind::Scheduled).await }
        });
        let artifact = task.await.unwrap().unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Verified);
        assert_eq!(artifact.components[1].name, "mongo");
    }

    #[tokio::test]
    async fn no_components_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path(), vec![]);
        assert!(matches!(
            coord.create_backup(ArtifactKind::Manual).await,
            Err(DeployError::Backup(_))
        ));
    }

    #[tokio::test]
    async fn reverify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(
            dir.path(),
            vec![
                MemoryComponent::new("postgres", b"rows").critical(),
                MemoryComponent::new("mongo", b"docs"),
            ],
        );
        let artifact = coord.create_backup(ArtifactKind::Manual).await.unwrap();
        let mongo = artifact.component("mongo").unwrap();
        std::fs::write(dir.path().join(&artifact.id).join(&mongo.file_name), b"garbage").unwrap();

        let reverified = coord.verify(&artifact.id).await.unwrap();
        assert_eq!(reverified.status, ArtifactStatus::Degraded);
        assert_eq!(
            coord.store().get(&artifact.id).unwrap().unwrap().status,
            ArtifactStatus::Degraded
        );
    }
}
