use anyhow::Context;
use axum::{Router, routing::get};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use shipyard::AppState;
use shipyard::artifact_store::ArtifactStore;
use shipyard::backup;
use shipyard::config::ShipyardConfig;
use shipyard::context::DeployContext;
use shipyard::handlers;
use shipyard::migrations::MigrationRunner;
use shipyard::models::artifact::ArtifactKind;
use shipyard::models::notification::{EventType, NotificationEvent};
use shipyard::models::run::Release;
use shipyard::notifier::NotificationDispatcher;
use shipyard::orchestrator::{self, Confirmer, DeploymentOrchestrator, PolicyConfirmer, RunOptions, StdinConfirmer};
use shipyard::retention;
use shipyard::retry::RetryPolicy;
use shipyard::rollback::RollbackRequest;
use shipyard::state_db::StateDb;

/// Deployment lifecycle orchestrator: validate, back up, migrate, deploy,
/// health-check, and roll back when something goes wrong.
#[derive(Debug, Parser)]
#[command(name = "shipyard", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SHIPYARD_CONFIG", default_value = "shipyard.toml", global = true)]
    config: PathBuf,

    /// Debug logging (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full deployment pipeline.
    Deploy {
        /// Target environment; overrides `deployment.environment`.
        environment: Option<String>,
        #[arg(long)]
        skip_validation: bool,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        no_migrations: bool,
        /// Revision to deploy; overrides `deployment.revision`.
        #[arg(long)]
        revision: Option<String>,
    },
    /// Restore data and revert services to the last known-good release.
    Rollback {
        #[arg(long, conflicts_with = "to_revision")]
        to_backup: Option<String>,
        /// Revert services only; no data is restored.
        #[arg(long)]
        to_revision: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Manage backup artifacts.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Probe every managed service once.
    HealthCheck {
        #[arg(long)]
        json: bool,
        /// Print latency and error detail per service.
        #[arg(long)]
        verbose: bool,
    },
    /// Send a notification to every configured channel.
    Notify {
        /// stage_transition, success, failure or warning.
        event_type: String,
        message: String,
        details: Option<String>,
    },
    /// Apply pending migrations.
    Migrate {
        /// Show applied and pending migrations without applying anything.
        #[arg(long)]
        status: bool,
    },
    /// Delete artifacts past their retention window.
    Sweep {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent deployment runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Serve the status API and run scheduled backups and retention sweeps.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    Create,
    List,
    Verify { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "shipyard=debug,tower_http=debug"
    } else {
        "shipyard=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = ShipyardConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Command::Deploy {
            environment,
            skip_validation,
            no_backup,
            no_migrations,
            revision,
        } => deploy(config, environment, revision, skip_validation, no_backup, no_migrations).await,
        Command::Rollback {
            to_backup,
            to_revision,
            force,
        } => rollback(config, to_backup, to_revision, force).await,
        Command::Backup { action } => backup_command(config, action).await,
        Command::HealthCheck { json, verbose } => health_check(config, json, verbose).await,
        Command::Notify {
            event_type,
            message,
            details,
        } => notify(config, &event_type, &message, details).await,
        Command::Migrate { status } => migrate(config, status).await,
        Command::Sweep { dry_run } => {
            let store = ArtifactStore::open(&config.artifacts.root)?;
            let report = retention::sweep(&store, Utc::now(), dry_run)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::from(if report.failed.is_empty() { 0 } else { 1 }))
        }
        Command::Runs { limit } => {
            let state = StateDb::open(&config.deployment.state_db)?;
            for run in state.list_runs(Some(&config.deployment.environment), limit)? {
                println!(
                    "{}  {}  {:<14} {}  {}",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status.as_str(),
                    run.release.revision,
                    run.error.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { addr } => serve(config, addr).await,
    }
}

async fn deploy(
    mut config: ShipyardConfig,
    environment: Option<String>,
    revision: Option<String>,
    skip_validation: bool,
    skip_backup: bool,
    skip_migrations: bool,
) -> anyhow::Result<ExitCode> {
    if let Some(env) = environment {
        config.deployment.environment = env;
    }
    let revision = revision
        .or_else(|| config.deployment.revision.clone())
        .context("nothing to deploy: pass --revision or set deployment.revision")?;
    let release = Release {
        revision,
        versions: config.deployment.target_versions.clone(),
    };

    let confirmer: Arc<dyn Confirmer> = if config.deployment.interactive && std::io::stdin().is_terminal() {
        Arc::new(StdinConfirmer)
    } else {
        Arc::new(PolicyConfirmer(config.deployment.continue_without_backup))
    };

    let ctx = Arc::new(DeployContext::from_config(config)?);
    let orchestrator = DeploymentOrchestrator::new(ctx, confirmer);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancel requested; stopping at the next stage boundary");
            cancel.cancel();
        }
    });

    let opts = RunOptions {
        release,
        skip_validation,
        skip_backup,
        skip_migrations,
    };
    match orchestrator.run(opts).await {
        Ok(run) => {
            println!("run {} finished: {}", run.id, run.status.as_str());
            if let Some(error) = &run.error {
                println!("  {error}");
            }
            Ok(ExitCode::from(run.exit_code()))
        }
        Err(e) => {
            tracing::error!("deploy run did not complete cleanly: {e}");
            Ok(ExitCode::from(1))
        }
    }
}

async fn rollback(
    config: ShipyardConfig,
    to_backup: Option<String>,
    to_revision: Option<String>,
    force: bool,
) -> anyhow::Result<ExitCode> {
    let ctx = DeployContext::from_config(config)?;
    let request = RollbackRequest {
        restore_data: to_revision.is_none(),
        artifact_id: to_backup,
        revision: to_revision,
        force,
    };
    let outcome = match orchestrator::manual_rollback(&ctx, "operator requested rollback", &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("rollback did not start: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    let event = if outcome.success {
        NotificationEvent::new(
            EventType::Success,
            ctx.environment(),
            "manual rollback finished",
            format!(
                "restored from {}; reverted to {}",
                outcome.restored_from.as_deref().unwrap_or("nothing"),
                outcome.reverted_to.as_ref().map(|r| r.revision.as_str()).unwrap_or("current release")
            ),
        )
    } else {
        NotificationEvent::new(
            EventType::Failure,
            ctx.environment(),
            "manual rollback failed",
            outcome.error.clone().unwrap_or_default(),
        )
    };
    ctx.notifier.notify(&event).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(ExitCode::from(if outcome.success { 0 } else { 1 }))
}

async fn backup_command(config: ShipyardConfig, action: BackupAction) -> anyhow::Result<ExitCode> {
    let ctx = DeployContext::from_config(config)?;
    match action {
        BackupAction::Create => match ctx.backup.create_backup(ArtifactKind::Manual).await {
            Ok(artifact) => {
                println!("{}", serde_json::to_string_pretty(&artifact)?);
                let failed = artifact.failed_components();
                if !failed.is_empty() {
                    tracing::warn!("backup {} is {}: {}", artifact.id, artifact.status.as_str(), failed.join(", "));
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                tracing::error!("backup failed: {e}");
                Ok(ExitCode::from(1))
            }
        },
        BackupAction::List => {
            let now = Utc::now();
            for artifact in ctx.backup.list()? {
                let retention = if artifact.is_expired(now) { "expired" } else { "expires" };
                println!(
                    "{}  {:<12} {:<9} {}  {retention} {}",
                    artifact.id,
                    artifact.kind.as_str(),
                    artifact.status.as_str(),
                    artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                    artifact.expires_at.format("%Y-%m-%d")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        BackupAction::Verify { id } => match ctx.backup.verify(&id).await {
            Ok(artifact) => {
                for archive in &artifact.components {
                    println!(
                        "{:<16} {}",
                        archive.name,
                        if archive.is_verified() { "verified" } else { "failed" }
                    );
                }
                println!("{}: {}", artifact.id, artifact.status.as_str());
                Ok(ExitCode::from(if artifact.components.iter().all(|c| c.is_verified()) { 0 } else { 1 }))
            }
            Err(e) => {
                tracing::error!("verify failed: {e}");
                Ok(ExitCode::from(1))
            }
        },
    }
}

async fn health_check(config: ShipyardConfig, json: bool, verbose: bool) -> anyhow::Result<ExitCode> {
    let ctx = DeployContext::from_config(config)?;
    let report = ctx.health.check().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report.summary_json())?);
    } else {
        for result in &report.results {
            if verbose {
                println!(
                    "{:<16} {:<4} {:>6}ms {}{}",
                    result.service,
                    result.verdict.as_str(),
                    result.latency_ms,
                    if result.required { "" } else { "(optional) " },
                    result.error.as_deref().unwrap_or("")
                );
            } else {
                println!("{:<16} {}", result.service, result.verdict.as_str());
            }
        }
        println!("overall: {}", report.verdict.as_str());
    }
    Ok(ExitCode::from(if report.is_unhealthy() { 1 } else { 0 }))
}

async fn notify(
    config: ShipyardConfig,
    event_type: &str,
    message: &str,
    details: Option<String>,
) -> anyhow::Result<ExitCode> {
    let event_type = EventType::parse(event_type).with_context(|| format!("unknown event type {event_type}"))?;
    let dispatcher = NotificationDispatcher::from_config(&config.notifications, RetryPolicy::from(&config.retry))?;
    let event = NotificationEvent::new(
        event_type,
        &config.deployment.environment,
        message,
        details.unwrap_or_default(),
    );
    let report = dispatcher.notify(&event).await;
    if report.is_noop() {
        if config.notifications.mandatory {
            tracing::error!("no notification channel configured and delivery is mandatory");
            return Ok(ExitCode::from(1));
        }
        tracing::info!("no notification channel configured");
    } else if report.failed_count() > 0 {
        tracing::warn!(
            "notification delivered to {} of {} channels",
            report.delivered_count(),
            report.delivered_count() + report.failed_count()
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn migrate(config: ShipyardConfig, status_only: bool) -> anyhow::Result<ExitCode> {
    let runner = MigrationRunner::new(&config.migrations);
    if status_only {
        for (name, applied_at) in runner.status()? {
            println!("{name:<40} {}", applied_at.as_deref().unwrap_or("pending"));
        }
        return Ok(ExitCode::SUCCESS);
    }
    let report = tokio::task::spawn_blocking(move || runner.apply_pending()).await??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(if report.is_success() { 0 } else { 1 }))
}

async fn serve(config: ShipyardConfig, addr: SocketAddr) -> anyhow::Result<ExitCode> {
    let backup_interval = config.artifacts.schedule_interval_secs;
    let sweep_interval = config.artifacts.sweep_interval_secs;
    let ctx = Arc::new(DeployContext::from_config(config)?);

    backup::spawn_backup_schedule(Arc::clone(&ctx.backup), backup_interval);
    retention::spawn_retention_sweeper(Arc::clone(&ctx.store), sweep_interval);

    let state = AppState { ctx };
    let app = Router::new()
        // Run audit log
        .route("/api/v1/runs", get(handlers::runs::list_runs))
        .route("/api/v1/runs/{id}", get(handlers::runs::get_run))
        // Backup artifacts
        .route("/api/v1/artifacts", get(handlers::artifacts::list_artifacts))
        .route("/api/v1/artifacts/{id}", get(handlers::artifacts::get_artifact))
        // Managed service health
        .route("/api/v1/health", get(handlers::health::service_health))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("shipyard status api listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(ExitCode::SUCCESS)
}
