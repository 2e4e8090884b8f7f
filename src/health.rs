use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::components::{ServiceControl, run_shell};
use crate::config::{HealthConfig, ProbeConfig, ServicesConfig};
use crate::models::health::{AggregateVerdict, HealthCheckResult, HealthReport, Verdict};
use crate::retry::RetryPolicy;

/// One service probe. `check` reports what the service says about itself;
/// timeouts and required/best-effort escalation are applied by the checker.
#[async_trait]
pub trait Probe: Send + Sync {
    fn service(&self) -> &str;

    /// Required services gate the aggregate verdict.
    fn required(&self) -> bool;

    fn warn_latency(&self) -> Option<Duration> {
        None
    }

    async fn check(&self) -> anyhow::Result<Verdict>;
}

// ── Probe kinds ──

pub struct HttpProbe {
    service: String,
    required: bool,
    url: String,
    expect_status: Option<u16>,
    warn_latency: Option<Duration>,
    client: reqwest::Client,
}

#[async_trait]
impl Probe for HttpProbe {
    fn service(&self) -> &str {
        &self.service
    }

    fn required(&self) -> bool {
        self.required
    }

    fn warn_latency(&self) -> Option<Duration> {
        self.warn_latency
    }

    async fn check(&self) -> anyhow::Result<Verdict> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        let ok = match self.expect_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        if !ok {
            anyhow::bail!("{} returned {status}", self.url);
        }
        Ok(Verdict::Pass)
    }
}

pub struct TcpProbe {
    service: String,
    required: bool,
    addr: String,
    warn_latency: Option<Duration>,
}

impl TcpProbe {
    pub fn new(service: &str, addr: &str, required: bool) -> Self {
        Self {
            service: service.to_string(),
            required,
            addr: addr.to_string(),
            warn_latency: None,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn service(&self) -> &str {
        &self.service
    }

    fn required(&self) -> bool {
        self.required
    }

    fn warn_latency(&self) -> Option<Duration> {
        self.warn_latency
    }

    async fn check(&self) -> anyhow::Result<Verdict> {
        tokio::net::TcpStream::connect(&self.addr).await?;
        Ok(Verdict::Pass)
    }
}

pub struct CommandProbe {
    service: String,
    required: bool,
    command: String,
    timeout: Duration,
    warn_latency: Option<Duration>,
}

impl CommandProbe {
    pub fn new(service: &str, command: &str, required: bool, timeout: Duration) -> Self {
        Self {
            service: service.to_string(),
            required,
            command: command.to_string(),
            timeout,
            warn_latency: None,
        }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    fn service(&self) -> &str {
        &self.service
    }

    fn required(&self) -> bool {
        self.required
    }

    fn warn_latency(&self) -> Option<Duration> {
        self.warn_latency
    }

    async fn check(&self) -> anyhow::Result<Verdict> {
        let out = run_shell(&self.command, None, &[], self.timeout).await?;
        match out.code {
            Some(0) => Ok(Verdict::Pass),
            Some(1) => Ok(Verdict::Warn),
            code => anyhow::bail!("exit {code:?}: {}", out.stderr.trim()),
        }
    }
}

/// Asks the managed-service control plane for the service's own status.
pub struct ControlPlaneProbe {
    service: String,
    required: bool,
    control: Arc<dyn ServiceControl>,
    warn_latency: Option<Duration>,
}

impl ControlPlaneProbe {
    pub fn new(service: &str, required: bool, control: Arc<dyn ServiceControl>) -> Self {
        Self {
            service: service.to_string(),
            required,
            control,
            warn_latency: None,
        }
    }
}

#[async_trait]
impl Probe for ControlPlaneProbe {
    fn service(&self) -> &str {
        &self.service
    }

    fn required(&self) -> bool {
        self.required
    }

    fn warn_latency(&self) -> Option<Duration> {
        self.warn_latency
    }

    async fn check(&self) -> anyhow::Result<Verdict> {
        let statuses = self.control.status(std::slice::from_ref(&self.service)).await?;
        statuses
            .get(&self.service)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("control plane did not report {}", self.service))
    }
}

pub fn build_probe(
    cfg: &ProbeConfig,
    control: &Arc<dyn ServiceControl>,
    client: &reqwest::Client,
    command_timeout: Duration,
) -> Arc<dyn Probe> {
    let warn_latency = cfg.warn_latency_ms.map(Duration::from_millis);
    if let Some(url) = &cfg.http {
        Arc::new(HttpProbe {
            service: cfg.service.clone(),
            required: cfg.required,
            url: url.clone(),
            expect_status: cfg.expect_status,
            warn_latency,
            client: client.clone(),
        })
    } else if let Some(addr) = &cfg.tcp {
        let mut probe = TcpProbe::new(&cfg.service, addr, cfg.required);
        probe.warn_latency = warn_latency;
        Arc::new(probe)
    } else if let Some(cmd) = &cfg.command {
        let mut probe = CommandProbe::new(&cfg.service, cmd, cfg.required, command_timeout);
        probe.warn_latency = warn_latency;
        Arc::new(probe)
    } else {
        let mut probe = ControlPlaneProbe::new(&cfg.service, cfg.required, Arc::clone(control));
        probe.warn_latency = warn_latency;
        Arc::new(probe)
    }
}

// ── Aggregation ──

/// Worst verdict over required services wins: fail → unhealthy,
/// warn → degraded. Best-effort services never move the aggregate.
pub fn aggregate(results: &[HealthCheckResult]) -> AggregateVerdict {
    match results.iter().filter(|r| r.required).map(|r| r.verdict).max() {
        Some(Verdict::Fail) => AggregateVerdict::Unhealthy,
        Some(Verdict::Warn) => AggregateVerdict::Degraded,
        _ => AggregateVerdict::Healthy,
    }
}

/// Apply timeout, latency and required/best-effort escalation to one raw
/// probe outcome.
fn escalate(
    required: bool,
    outcome: anyhow::Result<Verdict>,
    latency: Duration,
    warn_latency: Option<Duration>,
) -> (Verdict, Option<String>) {
    let (verdict, error) = match outcome {
        Ok(Verdict::Pass) if warn_latency.is_some_and(|w| latency > w) => {
            (Verdict::Warn, Some(format!("slow response ({}ms)", latency.as_millis())))
        }
        Ok(verdict) => (verdict, None),
        Err(e) => (Verdict::Fail, Some(e.to_string())),
    };
    if verdict == Verdict::Fail && !required {
        return (Verdict::Warn, error);
    }
    (verdict, error)
}

// ── Checker ──

async fn run_probe(probe: Arc<dyn Probe>, deadline: Duration) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(deadline, probe.check()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!("no response within {}ms", deadline.as_millis())),
    };
    let latency = started.elapsed();
    let (verdict, error) = escalate(probe.required(), outcome, latency, probe.warn_latency());
    if let Some(e) = &error {
        tracing::debug!("health: {} {}: {e}", probe.service(), verdict.as_str());
    }
    HealthCheckResult {
        service: probe.service().to_string(),
        required: probe.required(),
        verdict,
        latency_ms: latency.as_millis() as u64,
        checked_at: Utc::now(),
        error,
    }
}

pub struct HealthChecker {
    probes: Vec<Arc<dyn Probe>>,
    deadline: Duration,
    max_rounds: u32,
    interval: Duration,
    max_parallel: usize,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn Probe>>) -> Self {
        Self {
            probes,
            deadline: Duration::from_secs(10),
            max_rounds: 3,
            interval: Duration::from_secs(10),
            max_parallel: 8,
        }
    }

    /// Configured probes plus a control-plane probe for every managed
    /// service that has none of its own.
    pub fn from_config(
        health: &HealthConfig,
        services: &ServicesConfig,
        control: Arc<dyn ServiceControl>,
        client: reqwest::Client,
    ) -> Self {
        let deadline = Duration::from_secs(health.deadline_secs);
        let mut probes: Vec<Arc<dyn Probe>> = health
            .probes
            .iter()
            .map(|p| build_probe(p, &control, &client, deadline))
            .collect();
        for name in &services.names {
            if !health.probes.iter().any(|p| &p.service == name) {
                probes.push(Arc::new(ControlPlaneProbe::new(name, true, Arc::clone(&control))));
            }
        }
        Self {
            probes,
            deadline,
            max_rounds: health.max_retries.max(1),
            interval: Duration::from_secs(health.interval_secs),
            max_parallel: health.max_parallel.max(1),
        }
    }

    pub fn with_rounds(mut self, max_rounds: u32, interval: Duration) -> Self {
        self.max_rounds = max_rounds.max(1);
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn services(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.service().to_string()).collect()
    }

    /// Probe with the configured deadline and round budget.
    pub async fn check(&self) -> HealthReport {
        self.probe(&[], self.deadline, self.max_rounds).await
    }

    /// Probe `services` (all when empty) in parallel rounds. An unhealthy
    /// round is retried after the fixed interval until `max_rounds` rounds
    /// have run; a healthy or degraded round ends polling immediately.
    pub async fn probe(&self, services: &[String], deadline: Duration, max_rounds: u32) -> HealthReport {
        let probes: Vec<&Arc<dyn Probe>> = self
            .probes
            .iter()
            .filter(|p| services.is_empty() || services.iter().any(|s| s == p.service()))
            .collect();
        let policy = RetryPolicy::fixed(self.interval, max_rounds);

        let mut round = 0;
        loop {
            let results = self.round(&probes, deadline).await;
            let verdict = aggregate(&results);
            round += 1;
            if verdict != AggregateVerdict::Unhealthy || round >= policy.max_attempts {
                tracing::info!("health: {} after {round} round(s)", verdict.as_str());
                return HealthReport {
                    verdict,
                    rounds: round,
                    results,
                };
            }
            let failing: Vec<&str> = results
                .iter()
                .filter(|r| r.verdict == Verdict::Fail)
                .map(|r| r.service.as_str())
                .collect();
            tracing::warn!(
                "health: round {round}/{} unhealthy ({}), re-probing",
                policy.max_attempts,
                failing.join(", ")
            );
            policy.sleep(round - 1).await;
        }
    }

    async fn round(&self, probes: &[&Arc<dyn Probe>], deadline: Duration) -> Vec<HealthCheckResult> {
        let checks: Vec<_> = probes
            .iter()
            .map(|probe| Arc::clone(*probe))
            .enumerate()
            .map(|(idx, probe)| async move { (idx, run_probe(probe, deadline).await) })
            .collect();
        let mut results: Vec<(usize, HealthCheckResult)> = stream::iter(checks)
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, r)| r).collect()
    }
}
