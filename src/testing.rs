//! In-process fakes for the collaborator traits.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::components::{ServiceControl, StatefulComponent};
use crate::config::{MigrationConfig, RetryConfig, ShipyardConfig, ValidationConfig};
use crate::context::DeployContext;
use crate::health::{HealthChecker, Probe};
use crate::models::health::Verdict;
use crate::models::run::Release;
use crate::notifier::{NotificationChannel, NotificationDispatcher};
use crate::retry::RetryPolicy;

// ── Stateful component ──

pub struct MemoryComponent {
    name: String,
    critical: AtomicBool,
    order: AtomicU32,
    data: Mutex<Vec<u8>>,
    fail_dump: AtomicBool,
    fail_restore: AtomicBool,
    fail_ping: AtomicBool,
    dump_delay: Mutex<Duration>,
}

impl MemoryComponent {
    pub fn new(name: &str, data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            critical: AtomicBool::new(false),
            order: AtomicU32::new(50),
            data: Mutex::new(data.to_vec()),
            fail_dump: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            dump_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn critical(self: Arc<Self>) -> Arc<Self> {
        self.critical.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_order(self: Arc<Self>, order: u32) -> Arc<Self> {
        self.order.store(order, Ordering::SeqCst);
        self
    }

    pub fn fail_dump(&self, fail: bool) {
        self.fail_dump.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_dump_delay(&self, delay: Duration) {
        *self.dump_delay.lock().unwrap() = delay;
    }

    pub fn set_data(&self, data: &[u8]) {
        *self.data.lock().unwrap() = data.to_vec();
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatefulComponent for MemoryComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst)
    }

    fn restore_order(&self) -> u32 {
        self.order.load(Ordering::SeqCst)
    }

    async fn dump(&self) -> anyhow::Result<Vec<u8>> {
        let delay = *self.dump_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_dump.load(Ordering::SeqCst) {
            anyhow::bail!("{}: dump refused", self.name);
        }
        Ok(self.data())
    }

    async fn restore(&self, payload: &[u8]) -> anyhow::Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            anyhow::bail!("{}: restore refused", self.name);
        }
        self.set_data(payload);
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<bool> {
        if self.fail_ping.load(Ordering::SeqCst) {
            anyhow::bail!("{}: connection refused", self.name);
        }
        Ok(true)
    }
}

// ── Control plane ──

type DeployHook = Box<dyn Fn(&Release) + Send + Sync>;

#[derive(Default)]
pub struct FakeControl {
    calls: Mutex<Vec<String>>,
    deployed: Mutex<Vec<Release>>,
    statuses: Mutex<BTreeMap<String, Verdict>>,
    fail_deploy: AtomicBool,
    on_deploy: Mutex<Option<DeployHook>>,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deployed(&self) -> Vec<Release> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn set_status(&self, service: &str, verdict: Verdict) {
        self.statuses.lock().unwrap().insert(service.to_string(), verdict);
    }

    pub fn fail_deploy(&self, fail: bool) {
        self.fail_deploy.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` on every successful deploy, e.g. to simulate a release
    /// that mutates state.
    pub fn on_deploy(&self, hook: impl Fn(&Release) + Send + Sync + 'static) {
        *self.on_deploy.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl ServiceControl for FakeControl {
    async fn start(&self, services: &[String]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("start {}", services.join(",")));
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", services.join(",")));
        Ok(())
    }

    async fn status(&self, services: &[String]) -> anyhow::Result<BTreeMap<String, Verdict>> {
        let statuses = self.statuses.lock().unwrap();
        Ok(services
            .iter()
            .map(|s| (s.clone(), statuses.get(s).copied().unwrap_or(Verdict::Pass)))
            .collect())
    }

    async fn deploy(&self, release: &Release) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("deploy {}", release.revision));
        if self.fail_deploy.load(Ordering::SeqCst) {
            anyhow::bail!("image pull failed for {}", release.revision);
        }
        self.deployed.lock().unwrap().push(release.clone());
        if let Some(hook) = self.on_deploy.lock().unwrap().as_ref() {
            hook(release);
        }
        Ok(())
    }
}

// ── Probe ──

/// Replays a verdict script, one entry per call; the last entry repeats.
pub struct ScriptedProbe {
    service: String,
    required: bool,
    script: Mutex<VecDeque<Verdict>>,
    calls: AtomicU32,
    delay: Mutex<Duration>,
}

impl ScriptedProbe {
    pub fn new(service: &str, required: bool, script: &[Verdict]) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            required,
            script: Mutex::new(script.iter().copied().collect()),
            calls: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    fn service(&self) -> &str {
        &self.service
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn check(&self) -> anyhow::Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        let verdict = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        Ok(verdict.unwrap_or(Verdict::Pass))
    }
}

// ── Notification channel ──

type SendHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct RecordingChannel {
    name: String,
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    on_send: Mutex<Option<SendHook>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            on_send: Mutex::new(None),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Run `hook` with the title of every message, before delivery.
    pub fn on_send(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str) -> anyhow::Result<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = self.on_send.lock().unwrap().as_ref() {
            hook(title);
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("503 Service Unavailable");
        }
        self.sent.lock().unwrap().push((title.to_string(), body.to_string()));
        Ok(())
    }
}

// ── Assembly ──

/// Config rooted in `dir` with no waits and host checks that always pass.
pub fn config(dir: &Path) -> ShipyardConfig {
    let mut config = ShipyardConfig::default();
    config.deployment.environment = "staging".to_string();
    config.deployment.state_db = dir.join("state.db");
    config.deployment.lock_dir = dir.join("locks");
    config.artifacts.root = dir.join("backups");
    config.migrations = MigrationConfig {
        dir: dir.join("migrations"),
        database: dir.join("data/app.db"),
    };
    config.services.names = vec!["api".to_string(), "proxy".to_string()];
    config.health.settle_delay_secs = 0;
    config.health.interval_secs = 0;
    config.health.max_retries = 3;
    config.health.deadline_secs = 5;
    config.validation = ValidationConfig {
        min_disk_free_mb: 0,
        min_memory_mb: 0,
        max_load_per_cpu: f64::MAX,
        ..ValidationConfig::default()
    };
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_backoff_ms: 0,
        multiplier: 1,
        clamp_backoff_ms: 0,
    };
    config
}

pub fn context(
    config: ShipyardConfig,
    components: Vec<Arc<MemoryComponent>>,
    control: Arc<FakeControl>,
    probes: Vec<Arc<ScriptedProbe>>,
    channels: Vec<Arc<RecordingChannel>>,
) -> DeployContext {
    let components: Vec<Arc<dyn StatefulComponent>> = components
        .into_iter()
        .map(|c| c as Arc<dyn StatefulComponent>)
        .collect();
    let probes: Vec<Arc<dyn Probe>> = probes.into_iter().map(|p| p as Arc<dyn Probe>).collect();
    let channels: Vec<Arc<dyn NotificationChannel>> = channels
        .into_iter()
        .map(|c| c as Arc<dyn NotificationChannel>)
        .collect();

    let health = HealthChecker::new(probes)
        .with_rounds(config.health.max_retries, Duration::from_secs(config.health.interval_secs))
        .with_deadline(Duration::from_secs(config.health.deadline_secs));
    let notifier = NotificationDispatcher::new(channels, Duration::from_secs(1), RetryPolicy::once());
    DeployContext::assemble(config, components, control, health, notifier).unwrap()
}
