//! Collaborators the orchestrator drives but does not implement: stateful
//! components (dump/restore/ping) and the managed-service control plane.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{ComponentConfig, ComponentKind, ServicesConfig};
use crate::models::health::Verdict;
use crate::models::run::Release;

#[async_trait]
pub trait StatefulComponent: Send + Sync {
    fn name(&self) -> &str;

    /// The structured-data store. An artifact without a verified dump of a
    /// critical component is unusable.
    fn is_critical(&self) -> bool {
        false
    }

    /// Ascending restore order.
    fn restore_order(&self) -> u32 {
        50
    }

    async fn dump(&self) -> anyhow::Result<Vec<u8>>;

    async fn restore(&self, payload: &[u8]) -> anyhow::Result<()>;

    async fn ping(&self) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, services: &[String]) -> anyhow::Result<()>;

    async fn stop(&self, services: &[String]) -> anyhow::Result<()>;

    async fn status(&self, services: &[String]) -> anyhow::Result<BTreeMap<String, Verdict>>;

    /// Fetch the release's artifacts and replace running instances.
    async fn deploy(&self, release: &Release) -> anyhow::Result<()>;

    /// Remove superseded images/artifacts. Best-effort.
    async fn prune(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Shell execution ──

/// Output of a finished shell command.
#[derive(Debug)]
pub struct ShellOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `sh -c cmd`, optionally feeding `stdin`. The child is killed if the
/// timeout elapses.
pub async fn run_shell(
    cmd: &str,
    stdin: Option<&[u8]>,
    envs: &[(String, String)],
    timeout: Duration,
) -> anyhow::Result<ShellOutput> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in envs {
        command.env(k, v);
    }

    let mut child = command.spawn().with_context(|| format!("spawning `{cmd}`"))?;
    let writer = match (stdin, child.stdin.take()) {
        (Some(payload), Some(mut pipe)) => {
            let payload = payload.to_vec();
            Some(tokio::spawn(async move {
                let result = pipe.write_all(&payload).await;
                drop(pipe);
                result
            }))
        }
        _ => None,
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("waiting for `{cmd}`"))?,
        Err(_) => anyhow::bail!("`{cmd}` timed out after {}s", timeout.as_secs()),
    };
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("`{cmd}`: stdin closed early: {e}"),
            Err(e) => tracing::warn!("`{cmd}`: stdin writer panicked: {e}"),
        }
    }

    Ok(ShellOutput {
        code: output.status.code(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

async fn run_checked(
    cmd: &str,
    stdin: Option<&[u8]>,
    envs: &[(String, String)],
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let out = run_shell(cmd, stdin, envs, timeout).await?;
    if !out.success() {
        anyhow::bail!(
            "`{cmd}` exited with {}: {}",
            out.code.map_or("signal".to_string(), |c| c.to_string()),
            out.stderr
        );
    }
    Ok(out.stdout)
}

// ── Command-backed component ──

/// A store dumped and restored through its own CLI tools
/// (`pg_dump`/`pg_restore`, `mongodump`/`mongorestore`, ...).
pub struct CommandComponent {
    name: String,
    critical: bool,
    restore_order: u32,
    dump_cmd: String,
    restore_cmd: String,
    ping_cmd: Option<String>,
    timeout: Duration,
}

impl CommandComponent {
    pub fn new(name: &str, dump_cmd: &str, restore_cmd: &str) -> Self {
        Self {
            name: name.to_string(),
            critical: false,
            restore_order: 50,
            dump_cmd: dump_cmd.to_string(),
            restore_cmd: restore_cmd.to_string(),
            ping_cmd: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn restore_order(mut self, order: u32) -> Self {
        self.restore_order = order;
        self
    }

    pub fn ping_cmd(mut self, cmd: Option<String>) -> Self {
        self.ping_cmd = cmd;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StatefulComponent for CommandComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn restore_order(&self) -> u32 {
        self.restore_order
    }

    async fn dump(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = run_checked(&self.dump_cmd, None, &[], self.timeout).await?;
        if bytes.is_empty() {
            anyhow::bail!("{}: dump produced no output", self.name);
        }
        Ok(bytes)
    }

    async fn restore(&self, payload: &[u8]) -> anyhow::Result<()> {
        run_checked(&self.restore_cmd, Some(payload), &[], self.timeout).await?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<bool> {
        match &self.ping_cmd {
            Some(cmd) => Ok(run_shell(cmd, None, &[], self.timeout).await?.success()),
            None => Ok(true),
        }
    }
}

// ── Directory-backed component ──

/// A directory tree (the configuration tree) captured as a gzip tarball.
pub struct DirectoryComponent {
    name: String,
    path: PathBuf,
    critical: bool,
    restore_order: u32,
}

impl DirectoryComponent {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            critical: false,
            restore_order: 90,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn restore_order(mut self, order: u32) -> Self {
        self.restore_order = order;
        self
    }
}

fn pack_dir(path: &Path) -> anyhow::Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", path)
        .with_context(|| format!("archiving {}", path.display()))?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Unpack next to the target, then swap directories so a failed unpack
/// leaves the current tree in place.
fn unpack_dir(path: &Path, payload: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("directory component path has no file name")?;
    let staging = parent.join(format!(".{file_name}.restore"));
    let previous = parent.join(format!(".{file_name}.previous"));
    for leftover in [&staging, &previous] {
        if leftover.exists() {
            std::fs::remove_dir_all(leftover)?;
        }
    }

    std::fs::create_dir_all(&staging)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(payload));
    if let Err(e) = archive.unpack(&staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e).with_context(|| format!("unpacking into {}", staging.display()));
    }

    if path.exists() {
        std::fs::rename(path, &previous)?;
    }
    std::fs::rename(&staging, path)?;
    if previous.exists() {
        std::fs::remove_dir_all(&previous)?;
    }
    Ok(())
}

#[async_trait]
impl StatefulComponent for DirectoryComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn restore_order(&self) -> u32 {
        self.restore_order
    }

    async fn dump(&self) -> anyhow::Result<Vec<u8>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || pack_dir(&path)).await?
    }

    async fn restore(&self, payload: &[u8]) -> anyhow::Result<()> {
        let path = self.path.clone();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || unpack_dir(&path, &payload)).await?
    }

    async fn ping(&self) -> anyhow::Result<bool> {
        Ok(self.path.is_dir())
    }
}

pub fn build_components(configs: &[ComponentConfig], timeout: Duration) -> anyhow::Result<Vec<Arc<dyn StatefulComponent>>> {
    let mut components: Vec<Arc<dyn StatefulComponent>> = Vec::new();
    for c in configs {
        let component: Arc<dyn StatefulComponent> = match c.kind {
            ComponentKind::Command => {
                let dump = c.dump.as_deref().with_context(|| format!("component {}: missing dump", c.name))?;
                let restore = c
                    .restore
                    .as_deref()
                    .with_context(|| format!("component {}: missing restore", c.name))?;
                Arc::new(
                    CommandComponent::new(&c.name, dump, restore)
                        .critical(c.critical)
                        .restore_order(c.restore_order)
                        .ping_cmd(c.ping.clone())
                        .timeout(timeout),
                )
            }
            ComponentKind::Directory => {
                let path = c.path.as_ref().with_context(|| format!("component {}: missing path", c.name))?;
                Arc::new(
                    DirectoryComponent::new(&c.name, path)
                        .critical(c.critical)
                        .restore_order(c.restore_order),
                )
            }
        };
        components.push(component);
    }
    Ok(components)
}

// ── Command-backed control plane ──

/// Drives the service set through configured shell commands
/// (docker compose by default).
pub struct CommandServiceControl {
    cfg: ServicesConfig,
}

impl CommandServiceControl {
    pub fn new(cfg: ServicesConfig) -> Self {
        Self { cfg }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_secs)
    }

    fn expand_services(template: &str, services: &[String]) -> String {
        template.replace("{services}", &services.join(" "))
    }
}

/// `SHIPYARD_VERSION_<SERVICE>` with the service name upper-cased and
/// non-alphanumerics replaced by `_`.
pub fn version_env_key(service: &str) -> String {
    let normalized: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("SHIPYARD_VERSION_{normalized}")
}

#[async_trait]
impl ServiceControl for CommandServiceControl {
    async fn start(&self, services: &[String]) -> anyhow::Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let cmd = Self::expand_services(&self.cfg.start_cmd, services);
        run_checked(&cmd, None, &[], self.timeout()).await?;
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> anyhow::Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let cmd = Self::expand_services(&self.cfg.stop_cmd, services);
        run_checked(&cmd, None, &[], self.timeout()).await?;
        Ok(())
    }

    async fn status(&self, services: &[String]) -> anyhow::Result<BTreeMap<String, Verdict>> {
        let mut statuses = BTreeMap::new();
        for service in services {
            let cmd = self.cfg.status_cmd.replace("{service}", service);
            let verdict = match run_shell(&cmd, None, &[], self.timeout()).await {
                Ok(out) => match out.code {
                    Some(0) => Verdict::Pass,
                    Some(1) => Verdict::Warn,
                    _ => Verdict::Fail,
                },
                Err(e) => {
                    tracing::warn!("status of {service} failed: {e}");
                    Verdict::Fail
                }
            };
            statuses.insert(service.clone(), verdict);
        }
        Ok(statuses)
    }

    async fn deploy(&self, release: &Release) -> anyhow::Result<()> {
        let cmd = self.cfg.deploy_cmd.replace("{revision}", &release.revision);
        let mut envs: Vec<(String, String)> = release
            .versions
            .iter()
            .map(|(service, version)| (version_env_key(service), version.clone()))
            .collect();
        envs.push(("SHIPYARD_REVISION".to_string(), release.revision.clone()));
        run_checked(&cmd, None, &envs, self.timeout()).await?;
        Ok(())
    }

    async fn prune(&self) -> anyhow::Result<()> {
        if let Some(cmd) = &self.cfg.prune_cmd {
            run_checked(cmd, None, &[], self.timeout()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_captures_stdout_and_exit_code() {
        let out = run_shell("printf hello; exit 3", None, &[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn shell_times_out() {
        let err = run_shell("sleep 5", None, &[], Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn command_component_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("store.dat");
        std::fs::write(&data, b"state S").unwrap();
        let component = CommandComponent::new(
            "kv",
            &format!("cat {}", data.display()),
            &format!("cat > {}", data.display()),
        );

        let dump = component.dump().await.unwrap();
        std::fs::write(&data, b"state S-prime").unwrap();
        component.restore(&dump).await.unwrap();
        assert_eq!(std::fs::read(&data).unwrap(), b"state S");
        assert!(component.ping().await.unwrap());
    }

    #[tokio::test]
    async fn failing_dump_is_an_error() {
        let component = CommandComponent::new("broken", "echo nope >&2; exit 2", "true");
        let err = component.dump().await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn directory_component_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("conf");
        std::fs::create_dir_all(conf.join("nginx")).unwrap();
        std::fs::write(conf.join("nginx/site.conf"), "listen 443;").unwrap();
        let component = DirectoryComponent::new("config", &conf);

        let dump = component.dump().await.unwrap();
        std::fs::write(conf.join("nginx/site.conf"), "listen 80;").unwrap();
        std::fs::write(conf.join("stray.conf"), "x").unwrap();
        component.restore(&dump).await.unwrap();

        assert_eq!(std::fs::read_to_string(conf.join("nginx/site.conf")).unwrap(), "listen 443;");
        assert!(!conf.join("stray.conf").exists());
        assert!(component.ping().await.unwrap());
    }

    #[test]
    fn version_env_keys_are_normalized() {
        assert_eq!(version_env_key("druid-broker"), "SHIPYARD_VERSION_DRUID_BROKER");
    }

    #[tokio::test]
    async fn deploy_exports_versions() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("deployed");
        let control = CommandServiceControl::new(ServicesConfig {
            deploy_cmd: format!("echo \"{{revision}} $SHIPYARD_VERSION_API\" > {}", out.display()),
            ..ServicesConfig::default()
        });
        let release = Release {
            revision: "abc123".into(),
            versions: BTreeMap::from([("api".to_string(), "api:7".to_string())]),
        };
        control.deploy(&release).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "abc123 api:7");
    }
}
