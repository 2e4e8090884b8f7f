use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level config loaded from `shipyard.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ShipyardConfig {
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub migrations: MigrationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    /// SQLite file holding the run audit log and known-good releases.
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,
    /// Directory for per-environment run lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Ask the operator on stdin instead of applying the headless policy.
    #[serde(default)]
    pub interactive: bool,
    /// Headless answer to "backup failed, continue anyway?". Fail-closed.
    #[serde(default)]
    pub continue_without_backup: bool,
    #[serde(default)]
    pub revision: Option<String>,
    /// Service name -> image/version to roll out.
    #[serde(default)]
    pub target_versions: BTreeMap<String, String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            state_db: default_state_db(),
            lock_dir: default_lock_dir(),
            interactive: false,
            continue_without_backup: false,
            revision: None,
            target_versions: BTreeMap::new(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_state_db() -> PathBuf {
    PathBuf::from("./shipyard.db")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("./.shipyard")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Executables that must be on PATH.
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Environment keys that must be set to a non-placeholder value.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default = "default_placeholders")]
    pub placeholder_values: Vec<String>,
    /// Declarative config files to syntax-check (by extension).
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    #[serde(default = "default_min_disk_free_mb")]
    pub min_disk_free_mb: u64,
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
    #[serde(default = "default_max_load_per_cpu")]
    pub max_load_per_cpu: f64,
    /// `host:port` targets that must be reachable.
    #[serde(default)]
    pub egress_targets: Vec<String>,
    /// Ports the service set needs to bind.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Files that must not be group/world accessible.
    #[serde(default)]
    pub private_files: Vec<PathBuf>,
    #[serde(default = "default_5")]
    pub check_timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_tools: Vec::new(),
            required_env: Vec::new(),
            placeholder_values: default_placeholders(),
            config_files: Vec::new(),
            disk_path: default_disk_path(),
            min_disk_free_mb: default_min_disk_free_mb(),
            min_memory_mb: default_min_memory_mb(),
            max_load_per_cpu: default_max_load_per_cpu(),
            egress_targets: Vec::new(),
            ports: Vec::new(),
            private_files: Vec::new(),
            check_timeout_secs: 5,
        }
    }
}

fn default_placeholders() -> Vec<String> {
    ["changeme", "change_me", "CHANGE_ME", "your_password_here", "xxx", "todo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_disk_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_min_disk_free_mb() -> u64 {
    1024
}

fn default_min_memory_mb() -> u64 {
    512
}

fn default_max_load_per_cpu() -> f64 {
    2.0
}

fn default_5() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_artifact_root")]
    pub root: PathBuf,
    #[serde(default = "default_30")]
    pub retention_days: u32,
    #[serde(default = "default_3600")]
    pub sweep_interval_secs: u64,
    /// Scheduled backups under `serve`. 0 = disabled.
    #[serde(default)]
    pub schedule_interval_secs: u64,
    #[serde(default = "default_600")]
    pub capture_timeout_secs: u64,
    /// Concurrent component captures.
    #[serde(default = "default_4")]
    pub max_parallel: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: default_artifact_root(),
            retention_days: 30,
            sweep_interval_secs: 3600,
            schedule_interval_secs: 0,
            capture_timeout_secs: 600,
            max_parallel: 4,
        }
    }
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_30() -> u32 {
    30
}

fn default_3600() -> u64 {
    3600
}

fn default_600() -> u64 {
    600
}

fn default_4() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Dump/restore/ping via shell commands (pg_dump, mongodump, ...).
    Command,
    /// A directory tree captured as a tarball (configuration).
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    /// The structured-data store: its failure makes an artifact unusable.
    #[serde(default)]
    pub critical: bool,
    /// Restore order, ascending. Readers come after what they read.
    #[serde(default = "default_restore_order")]
    pub restore_order: u32,
    /// Command kind: writes the dump to stdout.
    pub dump: Option<String>,
    /// Command kind: reads the dump from stdin.
    pub restore: Option<String>,
    /// Command kind: exit status 0 means reachable.
    pub ping: Option<String>,
    /// Directory kind.
    pub path: Option<PathBuf>,
}

fn default_restore_order() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// The managed service set, in start order.
    #[serde(default)]
    pub names: Vec<String>,
    /// Services reading from stateful components; stopped during restore.
    #[serde(default)]
    pub dependents: Vec<String>,
    /// `{services}` expands to the space-separated set.
    #[serde(default = "default_start_cmd")]
    pub start_cmd: String,
    #[serde(default = "default_stop_cmd")]
    pub stop_cmd: String,
    /// `{service}` expands to one service; exit 0 = pass, 1 = warn, other = fail.
    #[serde(default = "default_status_cmd")]
    pub status_cmd: String,
    /// Fetches target artifacts and replaces running instances. `{revision}`
    /// expands to the release revision; versions are exported as
    /// `SHIPYARD_VERSION_<SERVICE>`.
    #[serde(default = "default_deploy_cmd")]
    pub deploy_cmd: String,
    /// Optional cleanup of superseded images after a successful run.
    #[serde(default)]
    pub prune_cmd: Option<String>,
    #[serde(default = "default_300")]
    pub timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            dependents: Vec::new(),
            start_cmd: default_start_cmd(),
            stop_cmd: default_stop_cmd(),
            status_cmd: default_status_cmd(),
            deploy_cmd: default_deploy_cmd(),
            prune_cmd: None,
            timeout_secs: 300,
        }
    }
}

fn default_start_cmd() -> String {
    "docker compose up -d {services}".to_string()
}

fn default_stop_cmd() -> String {
    "docker compose stop {services}".to_string()
}

fn default_status_cmd() -> String {
    "docker compose ps --status running --services | grep -qx {service}".to_string()
}

fn default_deploy_cmd() -> String {
    "docker compose pull && docker compose up -d --remove-orphans".to_string()
}

fn default_300() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Per-probe timeout.
    #[serde(default = "default_10")]
    pub deadline_secs: u64,
    /// Total probe rounds before giving up.
    #[serde(default = "default_3")]
    pub max_retries: u32,
    #[serde(default = "default_10")]
    pub interval_secs: u64,
    /// Wait after deploy before the first round.
    #[serde(default = "default_15")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_8")]
    pub max_parallel: usize,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 10,
            max_retries: 3,
            interval_secs: 10,
            settle_delay_secs: 15,
            max_parallel: 8,
            probes: Vec::new(),
        }
    }
}

fn default_10() -> u64 {
    10
}

fn default_3() -> u32 {
    3
}

fn default_15() -> u64 {
    15
}

fn default_8() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    pub service: String,
    /// GET this URL; 2xx (or `expect_status`) passes.
    pub http: Option<String>,
    #[serde(default)]
    pub expect_status: Option<u16>,
    /// `host:port` TCP connect.
    pub tcp: Option<String>,
    /// Shell command; exit 0 passes, 1 warns, anything else fails.
    pub command: Option<String>,
    /// Failures of required services escalate to `fail`; others to `warn`.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Passing probes slower than this are reported as `warn`.
    #[serde(default)]
    pub warn_latency_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
    /// The structured store the migrations (and their ledger) live in.
    #[serde(default = "default_migrations_db")]
    pub database: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            database: default_migrations_db(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("./migrations")
}

fn default_migrations_db() -> PathBuf {
    PathBuf::from("./data/app.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default = "default_10")]
    pub timeout_secs: u64,
    /// `notify` exits non-zero when no channel is configured.
    #[serde(default)]
    pub mandatory: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            smtp: None,
            timeout_secs: 10,
            mandatory: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook,
    Slack,
    Email,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    pub url: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default = "default_smtp_from")]
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_from() -> String {
    "shipyard@localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_3")]
    pub max_attempts: u32,
    #[serde(default = "default_500")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_10000")]
    pub clamp_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2,
            clamp_backoff_ms: 10_000,
        }
    }
}

fn default_500() -> u64 {
    500
}

fn default_multiplier() -> u32 {
    2
}

fn default_10000() -> u64 {
    10_000
}

impl ShipyardConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: ShipyardConfig = toml::from_str(&contents)?;
            tracing::info!("loaded config from {}", path.display());
            config
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: ShipyardConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `SHIPYARD_*` variables win over file values.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(env) = var("SHIPYARD_ENVIRONMENT") {
            self.deployment.environment = env;
        }
        if let Some(path) = var("SHIPYARD_STATE_DB") {
            self.deployment.state_db = PathBuf::from(path);
        }
        if let Some(root) = var("SHIPYARD_ARTIFACT_ROOT") {
            self.artifacts.root = PathBuf::from(root);
        }
        if let Some(host) = var("SHIPYARD_SMTP_HOST") {
            let smtp = self.notifications.smtp.get_or_insert_with(|| SmtpConfig {
                host: host.clone(),
                port: default_smtp_port(),
                user: None,
                pass: None,
                from: default_smtp_from(),
            });
            smtp.host = host;
        }
        if let Some(smtp) = self.notifications.smtp.as_mut() {
            if let Some(port) = var("SHIPYARD_SMTP_PORT").and_then(|p| p.parse().ok()) {
                smtp.port = port;
            }
            if let Some(user) = var("SHIPYARD_SMTP_USER") {
                smtp.user = Some(user);
            }
            if let Some(pass) = var("SHIPYARD_SMTP_PASS") {
                smtp.pass = Some(pass);
            }
            if let Some(from) = var("SHIPYARD_SMTP_FROM") {
                smtp.from = from;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.deployment.environment.trim().is_empty() {
            anyhow::bail!("deployment.environment must not be empty");
        }

        let mut seen = HashSet::new();
        for c in &self.components {
            if !seen.insert(c.name.as_str()) {
                anyhow::bail!("duplicate component name: {}", c.name);
            }
            match c.kind {
                ComponentKind::Command => {
                    if c.dump.is_none() || c.restore.is_none() {
                        anyhow::bail!("component {}: command kind needs `dump` and `restore`", c.name);
                    }
                }
                ComponentKind::Directory => {
                    if c.path.is_none() {
                        anyhow::bail!("component {}: directory kind needs `path`", c.name);
                    }
                }
            }
        }
        if self.components.iter().filter(|c| c.critical).count() > 1 {
            tracing::warn!("more than one component is marked critical");
        }

        for ch in &self.notifications.channels {
            match ch.kind {
                ChannelKind::Webhook | ChannelKind::Slack if ch.url.is_none() => {
                    anyhow::bail!("channel {}: `url` is required", ch.name);
                }
                ChannelKind::Email if ch.to.is_none() => {
                    anyhow::bail!("channel {}: `to` is required", ch.name);
                }
                _ => {}
            }
        }

        for p in &self.health.probes {
            let targets = [p.http.is_some(), p.tcp.is_some(), p.command.is_some()]
                .iter()
                .filter(|t| **t)
                .count();
            if targets > 1 {
                anyhow::bail!("probe {}: set at most one of http, tcp, command", p.service);
            }
        }
        if self.health.max_retries == 0 {
            anyhow::bail!("health.max_retries must be at least 1");
        }
        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.artifacts.retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ShipyardConfig::from_toml("").unwrap();
        assert_eq!(config.deployment.environment, "production");
        assert!(!config.deployment.continue_without_backup);
        assert_eq!(config.artifacts.retention_days, 30);
        assert_eq!(config.health.max_retries, 3);
        assert!(config.notifications.channels.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let config = ShipyardConfig::from_toml(
            r#"
            [deployment]
            environment = "staging"
            continue_without_backup = true

            [deployment.target_versions]
            api = "registry/api:1.4.2"

            [[components]]
            name = "postgres"
            kind = "command"
            critical = true
            restore_order = 10
            dump = "pg_dump -Fc app"
            restore = "pg_restore -d app --clean"

            [[components]]
            name = "config"
            kind = "directory"
            path = "/etc/app"
            restore_order = 90

            [services]
            names = ["nginx", "api"]
            dependents = ["api"]

            [[health.probes]]
            service = "nginx"
            http = "http://localhost/healthz"

            [[health.probes]]
            service = "druid-historical"
            tcp = "localhost:8083"
            required = false

            [[notifications.channels]]
            name = "ops"
            kind = "slack"
            url = "https://hooks.slack.com/services/T/B/X"
            "#,
        )
        .unwrap();

        assert_eq!(config.deployment.environment, "staging");
        assert_eq!(config.deployment.target_versions["api"], "registry/api:1.4.2");
        assert_eq!(config.components.len(), 2);
        assert!(config.components[0].critical);
        assert_eq!(config.components[1].kind, ComponentKind::Directory);
        assert_eq!(config.services.dependents, vec!["api"]);
        assert!(!config.health.probes[1].required);
        assert_eq!(config.notifications.channels[0].kind, ChannelKind::Slack);
    }

    #[test]
    fn rejects_incomplete_components() {
        let err = ShipyardConfig::from_toml(
            r#"
            [[components]]
            name = "mongo"
            kind = "command"
            dump = "mongodump --archive"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mongo"));
    }

    #[test]
    fn rejects_channel_without_url() {
        let err = ShipyardConfig::from_toml(
            r#"
            [[notifications.channels]]
            name = "hook"
            kind = "webhook"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = ShipyardConfig::default();
        config.apply_env_overrides(|key| match key {
            "SHIPYARD_ENVIRONMENT" => Some("staging".to_string()),
            "SHIPYARD_SMTP_HOST" => Some("smtp.example.com".to_string()),
            "SHIPYARD_SMTP_PORT" => Some("2525".to_string()),
            _ => None,
        });
        assert_eq!(config.deployment.environment, "staging");
        let smtp = config.notifications.smtp.unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);
    }
}
