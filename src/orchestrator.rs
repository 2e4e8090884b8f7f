//! The deployment pipeline: Validate → Backup → Migrate → Deploy →
//! HealthCheck, with automatic rollback once anything has been committed.
//!
//! Stages run strictly in order. Every transition is persisted to the run
//! audit log before the next stage starts and is announced through the
//! notification dispatcher. Cancellation is only observed between stages.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

use crate::context::DeployContext;
use crate::error::{DeployError, Result};
use crate::models::artifact::{ArtifactKind, ArtifactStatus};
use crate::models::health::{AggregateVerdict, Verdict};
use crate::models::notification::{EventType, NotificationEvent, NotificationRecord};
use crate::models::run::{DeploymentRun, Release, RunStatus};
use crate::retention;
use crate::rollback::{RollbackController, RollbackOutcome, RollbackRequest};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub release: Release,
    pub skip_validation: bool,
    pub skip_backup: bool,
    pub skip_migrations: bool,
}

// ── Operator decisions ──

/// Decides whether to continue when the pre-deploy backup is unusable.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Asks on the terminal. Anything but `y`/`yes` declines.
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        eprint!("{prompt} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Headless answer taken from `deployment.continue_without_backup`.
pub struct PolicyConfirmer(pub bool);

#[async_trait]
impl Confirmer for PolicyConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        tracing::info!("{prompt} -> {} (continue_without_backup)", if self.0 { "yes" } else { "no" });
        self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Run lock ──

/// Exclusive per-environment lock file, removed on drop.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(lock_dir: &Path, environment: &str, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{environment}.lock"));
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid={}\nrun={run_id}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(DeployError::RunInProgress {
                environment: environment.to_string(),
                lock: path.display().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove run lock {}: {e}", self.path.display());
        }
    }
}

/// Operator-requested rollback outside a deployment run. Holds the
/// environment's run lock for its whole duration, so it fails with
/// `RunInProgress` instead of racing a live run.
pub async fn manual_rollback(ctx: &DeployContext, reason: &str, request: &RollbackRequest) -> Result<RollbackOutcome> {
    let cfg = &ctx.config.deployment;
    let holder = format!("manual-rollback-{}", uuid::Uuid::new_v4().simple());
    let _lock = RunLock::acquire(&cfg.lock_dir, &cfg.environment, &holder)?;
    Ok(ctx.rollback_controller().rollback(None, reason, request).await)
}

// ── Orchestrator ──

pub struct DeploymentOrchestrator {
    ctx: Arc<DeployContext>,
    rollback: RollbackController,
    confirmer: Arc<dyn Confirmer>,
    cancel: CancelToken,
}

impl DeploymentOrchestrator {
    pub fn new(ctx: Arc<DeployContext>, confirmer: Arc<dyn Confirmer>) -> Self {
        let rollback = ctx.rollback_controller();
        Self {
            ctx,
            rollback,
            confirmer,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute one deployment run. Stage failures end up in the returned
    /// run's status; `Err` means the run could not start (another run holds
    /// the lock) or its audit log could not be written. In the latter case
    /// the run is still finished: rolled back if anything was committed,
    /// failed otherwise.
    pub async fn run(&self, opts: RunOptions) -> Result<DeploymentRun> {
        let cfg = &self.ctx.config.deployment;
        let mut run = DeploymentRun::new(&cfg.environment, opts.release.clone());
        let _lock = RunLock::acquire(&cfg.lock_dir, &cfg.environment, &run.id)?;
        self.ctx.state.insert_run(&run)?;
        tracing::info!(
            "run {} started for {} (revision {})",
            run.id,
            run.environment,
            run.release.revision
        );

        if let Err(e) = self.drive(&mut run, &opts).await {
            tracing::error!("run {} interrupted in {}: {e}", run.id, run.status);
            let settled = if run.status.can_transition_to(RunStatus::RollingBack) {
                self.roll_back(&mut run, &e).await
            } else if run.status.can_transition_to(RunStatus::Failed) {
                self.abort(&mut run, &e).await
            } else {
                run.error.get_or_insert_with(|| e.to_string());
                Ok(())
            };
            if let Err(again) = settled {
                tracing::error!("run {}: audit log still failing: {again}", run.id);
            }
            if let Err(persist) = self.ctx.state.update_run(&run) {
                tracing::error!("run {}: could not record outcome: {persist}", run.id);
            }
            return Err(e);
        }

        tracing::info!("run {} finished: {}", run.id, run.status);
        Ok(run)
    }

    async fn drive(&self, run: &mut DeploymentRun, opts: &RunOptions) -> Result<()> {
        // ── Validate ──
        if !opts.skip_validation {
            self.advance(run, RunStatus::Validating, None).await?;
            let report = self.ctx.validator().run().await;
            if !report.passed() {
                return self.abort(run, &DeployError::Validation(report.failure_summary())).await;
            }
            for w in report.warnings() {
                tracing::warn!("validation warning: {}: {}", w.name, w.detail);
            }
        }

        // ── Backup ──
        if self.cancel.is_cancelled() {
            return self.stop_for_cancel(run, "backup").await;
        }
        if !opts.skip_backup {
            self.advance(run, RunStatus::BackingUp, None).await?;
            if let Some(reason) = self.backup_stage(run).await? {
                let prompt = format!("Backup failed ({reason}). Continue without a backup?");
                if !self.confirmer.confirm(&prompt).await {
                    return self.abort(run, &DeployError::Backup(reason)).await;
                }
                tracing::warn!("run {}: continuing without a usable backup", run.id);
                self.emit(run, EventType::Warning, "continuing without backup", &reason).await?;
            }
        }

        // ── Migrate ──
        if self.cancel.is_cancelled() {
            return self.stop_for_cancel(run, "migrations").await;
        }
        if !opts.skip_migrations {
            self.advance(run, RunStatus::Migrating, None).await?;
            if let Err(e) = self.migrate_stage(run).await {
                return self.roll_back(run, &e).await;
            }
        }

        // ── Deploy ──
        if self.cancel.is_cancelled() {
            return self.stop_for_cancel(run, "deploy").await;
        }
        let revision = run.release.revision.clone();
        self.advance(run, RunStatus::Deploying, Some(revision)).await?;
        let timeout = Duration::from_secs(self.ctx.config.services.timeout_secs);
        let deployed = match tokio::time::timeout(timeout, self.ctx.control.deploy(&run.release)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeployError::Deployment(e.to_string())),
            Err(_) => Err(DeployError::Deployment(format!("timed out after {}s", timeout.as_secs()))),
        };
        if let Err(e) = deployed {
            return self.roll_back(run, &e).await;
        }

        // ── Health check ──
        if self.cancel.is_cancelled() {
            return self.stop_for_cancel(run, "health check").await;
        }
        self.advance(run, RunStatus::HealthChecking, None).await?;
        let settle = Duration::from_secs(self.ctx.config.health.settle_delay_secs);
        if !settle.is_zero() {
            tracing::info!("waiting {}s for services to settle", settle.as_secs());
            tokio::time::sleep(settle).await;
        }
        let report = self.ctx.health.check().await;
        match report.verdict {
            AggregateVerdict::Unhealthy => {
                tracing::warn!("unhealthy services: {}", report.failing_services().join(", "));
                return self
                    .roll_back(run, &DeployError::HealthCheckTimeout { rounds: report.rounds })
                    .await;
            }
            AggregateVerdict::Degraded => {
                let warned: Vec<String> = report
                    .results
                    .iter()
                    .filter(|r| r.required && r.verdict != Verdict::Pass)
                    .map(|r| r.service.clone())
                    .collect();
                self.emit(
                    run,
                    EventType::Warning,
                    "deployed with degraded services",
                    &format!("services reporting warnings: {}", warned.join(", ")),
                )
                .await?;
            }
            AggregateVerdict::Healthy => {}
        }

        // ── Finalize ──
        self.advance(run, RunStatus::Succeeded, Some(report.verdict.as_str().to_string()))
            .await?;
        self.ctx
            .state
            .record_known_good(&run.environment, &run.release, &run.id)?;
        self.cleanup().await;
        let body = format!(
            "revision {} is live ({} migrations applied)",
            run.release.revision,
            run.migrations_applied.len()
        );
        self.emit(run, EventType::Success, "deployment succeeded", &body).await
    }

    /// Returns the reason the backup is unusable, if it is.
    async fn backup_stage(&self, run: &mut DeploymentRun) -> Result<Option<String>> {
        let artifact = match self.ctx.backup.create_backup(ArtifactKind::PreDeploy).await {
            Ok(artifact) => artifact,
            Err(e) => return Ok(Some(e.to_string())),
        };
        match artifact.status {
            ArtifactStatus::Unusable => Ok(Some(format!(
                "artifact {} is unusable, failed: {}",
                artifact.id,
                artifact.failed_components().join(", ")
            ))),
            status => {
                run.backup_artifact_id = Some(artifact.id.clone());
                self.ctx.state.update_run(run)?;
                if status == ArtifactStatus::Degraded {
                    let body = format!(
                        "artifact {} is degraded; these components cannot be restored: {}",
                        artifact.id,
                        artifact.failed_components().join(", ")
                    );
                    self.emit(run, EventType::Warning, "backup degraded", &body).await?;
                }
                Ok(None)
            }
        }
    }

    async fn migrate_stage(&self, run: &mut DeploymentRun) -> Result<()> {
        let runner = self.ctx.migrations.clone();
        let report = tokio::task::spawn_blocking(move || runner.apply_pending())
            .await
            .map_err(|e| DeployError::Migration {
                name: "<runner>".to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| DeployError::Migration {
                name: "<ledger>".to_string(),
                reason: e.to_string(),
            })?;

        run.migrations_applied = report.applied.clone();
        self.ctx.state.update_run(run)?;
        match report.failed.first() {
            Some(name) => Err(DeployError::Migration {
                name: name.clone(),
                reason: report.error.unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    async fn cleanup(&self) {
        let timeout = Duration::from_secs(self.ctx.config.services.timeout_secs);
        match tokio::time::timeout(timeout, self.ctx.control.prune()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("cleanup: prune failed: {e}"),
            Err(_) => tracing::warn!("cleanup: prune timed out"),
        }
        let store = Arc::clone(&self.ctx.store);
        match tokio::task::spawn_blocking(move || retention::sweep(&store, chrono::Utc::now(), false)).await {
            Ok(Ok(report)) if !report.deleted.is_empty() => {
                tracing::info!("cleanup: removed {} expired artifacts", report.deleted.len())
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("cleanup: retention sweep failed: {e}"),
            Err(e) => tracing::warn!("cleanup: retention sweep panicked: {e}"),
        }
    }

    // ── Outcomes ──

    /// Nothing committed yet: fail without rolling back.
    async fn abort(&self, run: &mut DeploymentRun, err: &DeployError) -> Result<()> {
        tracing::warn!("run {}: {err}", run.id);
        run.error = Some(err.to_string());
        let mut audit = Ok(());
        keep(&mut audit, self.advance(run, RunStatus::Failed, Some(err.to_string())).await);
        keep(
            &mut audit,
            self.emit(run, EventType::Failure, "deployment aborted", &err.to_string()).await,
        );
        audit
    }

    /// Once the rollback controller is involved every step runs even when
    /// the audit log refuses writes; the first such error is returned at
    /// the end.
    async fn roll_back(&self, run: &mut DeploymentRun, err: &DeployError) -> Result<()> {
        tracing::error!("run {}: {err}, rolling back", run.id);
        run.error = Some(err.to_string());
        let mut audit = Ok(());
        keep(
            &mut audit,
            self.emit(run, EventType::Failure, "deployment failed, rolling back", &err.to_string())
                .await,
        );
        keep(
            &mut audit,
            self.advance(run, RunStatus::RollingBack, Some(err.to_string())).await,
        );

        let outcome = self
            .rollback
            .rollback(Some(&*run), &err.to_string(), &RollbackRequest::automatic())
            .await;

        if outcome.success {
            let restored = outcome.restored_from.as_deref().unwrap_or("no artifact");
            let detail = format!("restored from {restored}");
            keep(
                &mut audit,
                self.advance(run, RunStatus::RolledBack, Some(detail.clone())).await,
            );
            let body = match &outcome.reverted_to {
                Some(release) => format!("{detail}; services reverted to {}", release.revision),
                None => detail,
            };
            keep(
                &mut audit,
                self.emit(run, EventType::Success, "rollback succeeded", &body).await,
            );
        } else {
            let reason = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            let failure = DeployError::Rollback(reason);
            run.error = Some(format!("{err}; {failure}"));
            keep(
                &mut audit,
                self.advance(run, RunStatus::Failed, Some(failure.to_string())).await,
            );
            keep(
                &mut audit,
                self.emit(
                    run,
                    EventType::Failure,
                    "rollback failed, manual intervention required",
                    &failure.to_string(),
                )
                .await,
            );
        }
        audit
    }

    async fn stop_for_cancel(&self, run: &mut DeploymentRun, stage: &str) -> Result<()> {
        let err = DeployError::Cancelled {
            stage: stage.to_string(),
        };
        if run.status.can_transition_to(RunStatus::RollingBack) {
            self.roll_back(run, &err).await
        } else {
            self.abort(run, &err).await
        }
    }

    // ── Bookkeeping ──

    async fn advance(&self, run: &mut DeploymentRun, to: RunStatus, detail: Option<String>) -> Result<()> {
        let transition = run.transition(to, detail)?.clone();
        self.ctx.state.append_transition(&run.id, &transition)?;
        self.ctx.state.update_run(run)?;
        tracing::info!("run {}: {} -> {}", run.id, transition.from, transition.to);

        let body = transition.detail.clone().unwrap_or_default();
        self.emit(run, EventType::StageTransition, &format!("{} -> {}", transition.from, to), &body)
            .await
    }

    async fn emit(&self, run: &mut DeploymentRun, event_type: EventType, title: &str, body: &str) -> Result<()> {
        let event = NotificationEvent::new(event_type, &run.environment, title, body).for_run(&run.id);
        let report = self.ctx.notifier.notify(&event).await;
        run.notifications.push(NotificationRecord::new(&event, &report));
        self.ctx.state.update_run(run)?;
        Ok(())
    }
}


/// Log a bookkeeping failure and remember the first one.
fn keep(audit: &mut Result<()>, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!("audit log write failed, continuing: {e}");
        if audit.is_ok() {
            *audit = Err(e);
        }
    }
}
