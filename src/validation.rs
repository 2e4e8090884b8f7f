//! Pre-flight checks. Nothing here mutates state; a failing report aborts a
//! run before the first backup is taken.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::components::{StatefulComponent, run_shell};
use crate::config::ValidationConfig;
use crate::models::health::Verdict;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub verdict: Verdict,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            verdict,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.verdict != Verdict::Fail)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.verdict == Verdict::Fail).collect()
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.verdict == Verdict::Warn).collect()
    }

    /// One line per failed check, for run errors and notifications.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct Validator {
    cfg: ValidationConfig,
    env: Option<HashMap<String, String>>,
    components: Vec<Arc<dyn StatefulComponent>>,
}

impl Validator {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self {
            cfg,
            env: None,
            components: Vec::new(),
        }
    }

    /// Ping these components as part of the run. An unreachable critical
    /// component fails validation, any other one only warns.
    pub fn with_components(mut self, components: Vec<Arc<dyn StatefulComponent>>) -> Self {
        self.components = components;
        self
    }

    /// Resolve required keys from `env` instead of the process environment.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    fn var(&self, key: &str) -> Option<String> {
        match &self.env {
            Some(env) => env.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.check_timeout_secs.max(1))
    }

    pub async fn run(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        // ── Tools and configuration ──
        for tool in &self.cfg.required_tools {
            report.checks.push(check_tool(tool));
        }
        for key in &self.cfg.required_env {
            report.checks.push(self.check_env(key));
        }
        for path in &self.cfg.config_files {
            report.checks.push(check_config_syntax(path));
        }
        for path in &self.cfg.private_files {
            report.checks.push(check_private_file(path));
        }

        // ── Host resources ──
        report.checks.push(self.check_disk().await);
        report.checks.push(self.check_memory());
        report.checks.push(self.check_load());

        // ── Network ──
        let egress = futures_util::future::join_all(
            self.cfg.egress_targets.iter().map(|target| check_egress(target, self.timeout())),
        )
        .await;
        report.checks.extend(egress);
        for port in &self.cfg.ports {
            report.checks.push(check_port(*port));
        }

        // ── Stateful components ──
        let pings = futures_util::future::join_all(
            self.components
                .iter()
                .cloned()
                .map(|component| check_component(component, self.timeout())),
        )
        .await;
        report.checks.extend(pings);

        for c in report.failures() {
            tracing::warn!("validation: {} failed: {}", c.name, c.detail);
        }
        for c in report.warnings() {
            tracing::info!("validation: {} warning: {}", c.name, c.detail);
        }
        report
    }

    /// Configured placeholder words, or an unrendered template marker such
    /// as `<password>`, `${TOKEN}` or `{{ secret }}`.
    fn is_placeholder(&self, value: &str) -> bool {
        static TEMPLATE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^(<[^>]*>|\$\{[^}]*\}|\{\{.*\}\})$").unwrap());
        let value = value.trim();
        self.cfg.placeholder_values.iter().any(|p| p.eq_ignore_ascii_case(value)) || TEMPLATE.is_match(value)
    }

    fn check_env(&self, key: &str) -> CheckResult {
        let name = format!("env:{key}");
        match self.var(key) {
            None => CheckResult::new(name, Verdict::Fail, "not set"),
            Some(v) if v.trim().is_empty() => CheckResult::new(name, Verdict::Fail, "empty"),
            Some(v) if self.is_placeholder(&v) => {
                CheckResult::new(name, Verdict::Fail, "still set to a placeholder value")
            }
            Some(_) => CheckResult::new(name, Verdict::Pass, "set"),
        }
    }

    async fn check_disk(&self) -> CheckResult {
        let name = "disk";
        let path = self.cfg.disk_path.display().to_string();
        let out = match run_shell(&format!("df -Pk '{path}'"), None, &[], self.timeout()).await {
            Ok(out) if out.success() => out,
            Ok(out) => return CheckResult::new(name, Verdict::Warn, format!("df failed: {}", out.stderr.trim())),
            Err(e) => return CheckResult::new(name, Verdict::Warn, format!("df failed: {e}")),
        };
        let Some(available_kb) = parse_df_available(&String::from_utf8_lossy(&out.stdout)) else {
            return CheckResult::new(name, Verdict::Warn, "could not parse df output");
        };
        let available_mb = available_kb / 1024;
        threshold(name, available_mb, self.cfg.min_disk_free_mb, &format!("{available_mb}MB free on {path}"))
    }

    fn check_memory(&self) -> CheckResult {
        let name = "memory";
        let Some(available_kb) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_available(&s))
        else {
            return CheckResult::new(name, Verdict::Warn, "MemAvailable not readable");
        };
        let available_mb = available_kb / 1024;
        threshold(name, available_mb, self.cfg.min_memory_mb, &format!("{available_mb}MB available"))
    }

    fn check_load(&self) -> CheckResult {
        let name = "cpu_load";
        let Some(load) = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| parse_loadavg(&s))
        else {
            return CheckResult::new(name, Verdict::Warn, "load average not readable");
        };
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        let per_cpu = load / cpus;
        let detail = format!("load {load:.2} over {cpus} cpus");
        if per_cpu > self.cfg.max_load_per_cpu {
            CheckResult::new(name, Verdict::Warn, detail)
        } else {
            CheckResult::new(name, Verdict::Pass, detail)
        }
    }
}

async fn check_component(component: Arc<dyn StatefulComponent>, timeout: Duration) -> CheckResult {
    let name = format!("component:{}", component.name());
    let unreachable = if component.is_critical() { Verdict::Fail } else { Verdict::Warn };
    match tokio::time::timeout(timeout, component.ping()).await {
        Ok(Ok(true)) => CheckResult::new(name, Verdict::Pass, "reachable"),
        Ok(Ok(false)) => CheckResult::new(name, unreachable, "not ready"),
        Ok(Err(e)) => CheckResult::new(name, unreachable, e.to_string()),
        Err(_) => CheckResult::new(name, unreachable, format!("no answer within {}s", timeout.as_secs())),
    }
}

/// Below the minimum fails; within 2x of it warns.
fn threshold(name: &str, actual: u64, minimum: u64, detail: &str) -> CheckResult {
    if actual < minimum {
        CheckResult::new(name, Verdict::Fail, format!("{detail}, need {minimum}MB"))
    } else if actual < minimum.saturating_mul(2) {
        CheckResult::new(name, Verdict::Warn, format!("{detail}, close to the {minimum}MB minimum"))
    } else {
        CheckResult::new(name, Verdict::Pass, detail)
    }
}

fn check_tool(tool: &str) -> CheckResult {
    let name = format!("tool:{tool}");
    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false);
    if found {
        CheckResult::new(name, Verdict::Pass, "found on PATH")
    } else {
        CheckResult::new(name, Verdict::Fail, "not found on PATH")
    }
}

fn check_config_syntax(path: &Path) -> CheckResult {
    let name = format!("config:{}", path.display());
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return CheckResult::new(name, Verdict::Fail, e.to_string()),
    };
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str::<toml::Value>(&contents).map(|_| ()).map_err(|e| e.to_string()),
        Some("json") => serde_json::from_str::<serde_json::Value>(&contents)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        _ => return CheckResult::new(name, Verdict::Pass, "present (no syntax checker for this type)"),
    };
    match parsed {
        Ok(()) => CheckResult::new(name, Verdict::Pass, "valid"),
        Err(e) => CheckResult::new(name, Verdict::Fail, e),
    }
}

fn check_private_file(path: &Path) -> CheckResult {
    let name = format!("permissions:{}", path.display());
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return CheckResult::new(name, Verdict::Fail, e.to_string()),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return CheckResult::new(name, Verdict::Fail, format!("mode {mode:o} is group/world accessible"));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    CheckResult::new(name, Verdict::Pass, "private")
}

async fn check_egress(target: &str, timeout: Duration) -> CheckResult {
    let name = format!("egress:{target}");
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target)).await {
        Ok(Ok(_)) => CheckResult::new(name, Verdict::Pass, "reachable"),
        Ok(Err(e)) => CheckResult::new(name, Verdict::Fail, e.to_string()),
        Err(_) => CheckResult::new(name, Verdict::Fail, format!("no connection within {}s", timeout.as_secs())),
    }
}

/// A port held by the running release is expected during redeploys, so
/// in-use only warns.
fn check_port(port: u16) -> CheckResult {
    let name = format!("port:{port}");
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => CheckResult::new(name, Verdict::Pass, "available"),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            CheckResult::new(name, Verdict::Warn, "in use")
        }
        Err(e) => CheckResult::new(name, Verdict::Fail, e.to_string()),
    }
}

// ── Parsers ──

/// Available KiB from `df -Pk` output (fourth column of the data row).
pub fn parse_df_available(output: &str) -> Option<u64> {
    output.lines().nth(1)?.split_whitespace().nth(3)?.parse().ok()
}

pub fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// One-minute load average.
pub fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}
