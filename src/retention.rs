use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact_store::ArtifactStore;

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// Expired, but held by a live rollback or restore.
    pub skipped_referenced: Vec<String>,
    pub failed: Vec<String>,
}

/// Spawn the retention sweeper as a background task (fire-and-forget).
/// Follows the same pattern as `backup::spawn_backup_schedule`.
pub fn spawn_retention_sweeper(store: Arc<ArtifactStore>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::info!("retention sweeper: disabled by config");
        return;
    }

    tokio::spawn(async move {
        tracing::info!("retention sweeper: started (interval={interval_secs}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || sweep(&store, Utc::now(), false)).await {
                Ok(Ok(report)) if !report.deleted.is_empty() => {
                    tracing::info!("retention sweeper: removed {} artifacts", report.deleted.len())
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("retention sweeper error: {e}"),
                Err(e) => tracing::error!("retention sweeper task panicked: {e}"),
            }
        }
    });
}

/// Delete every artifact whose retention window has elapsed and that no
/// live rollback references. One failed deletion never stops the sweep.
pub fn sweep(store: &ArtifactStore, now: DateTime<Utc>, dry_run: bool) -> anyhow::Result<SweepReport> {
    let mut report = SweepReport::default();

    for artifact in store.expired(now)? {
        if dry_run {
            if store.ref_count(&artifact.id)? > 0 {
                report.skipped_referenced.push(artifact.id);
            } else {
                tracing::info!("retention sweeper [DRY RUN]: would delete {}", artifact.id);
                report.deleted.push(artifact.id);
            }
            continue;
        }

        match store.delete(&artifact.id) {
            Ok(true) => {
                tracing::debug!("retention sweeper: deleted {}", artifact.id);
                report.deleted.push(artifact.id);
            }
            Ok(false) => {
                tracing::info!("retention sweeper: {} is referenced, keeping it", artifact.id);
                report.skipped_referenced.push(artifact.id);
            }
            Err(e) => {
                tracing::warn!("retention sweeper: deleting {} failed: {e}", artifact.id);
                report.failed.push(artifact.id);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::artifact::{ArtifactKind, ArtifactStatus, BackupArtifact};

    fn saved(store: &ArtifactStore, age_days: i64, retention_days: i64) -> String {
        let id = ArtifactStore::new_artifact_id(ArtifactKind::Scheduled);
        let comp = store.write_component(&id, "mongo", false, b"docs").unwrap();
        let created_at = Utc::now() - chrono::Duration::days(age_days);
        let mut artifact = BackupArtifact {
            id: id.clone(),
            kind: ArtifactKind::Scheduled,
            environment: "production".into(),
            created_at,
            expires_at: created_at + chrono::Duration::days(retention_days),
            components: vec![comp],
            total_size: 0,
            status: ArtifactStatus::Verified,
        };
        artifact.refresh_status();
        store.save(&artifact).unwrap();
        id
    }

    #[test]
    fn deletes_only_expired_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let old = saved(&store, 40, 30);
        let held = saved(&store, 35, 30);
        let fresh = saved(&store, 1, 30);

        let lease = store.acquire(&held, "rollback-7").unwrap();
        let report = sweep(&store, Utc::now(), false).unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert_eq!(report.skipped_referenced, vec![held.clone()]);
        assert!(store.get(&old).unwrap().is_none());
        assert!(store.get(&held).unwrap().is_some());
        assert!(store.get(&fresh).unwrap().is_some());

        drop(lease);
        let report = sweep(&store, Utc::now(), false).unwrap();
        assert_eq!(report.deleted, vec![held]);
    }

    #[test]
    fn dry_run_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let old = saved(&store, 40, 30);

        let report = sweep(&store, Utc::now(), true).unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(store.get(&old).unwrap().is_some());
    }
}
