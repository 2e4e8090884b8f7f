use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered so that `max()` picks the worst verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Warn => "warn",
            Verdict::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl AggregateVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateVerdict::Healthy => "healthy",
            AggregateVerdict::Degraded => "degraded",
            AggregateVerdict::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub required: bool,
    pub verdict: Verdict,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub verdict: AggregateVerdict,
    /// Probe rounds executed, including the final one.
    pub rounds: u32,
    /// Results of the final round.
    pub results: Vec<HealthCheckResult>,
}

impl HealthReport {
    pub fn is_unhealthy(&self) -> bool {
        self.verdict == AggregateVerdict::Unhealthy
    }

    /// `{status, services: {name: verdict}}`
    pub fn summary_json(&self) -> serde_json::Value {
        let services: BTreeMap<&str, &str> = self
            .results
            .iter()
            .map(|r| (r.service.as_str(), r.verdict.as_str()))
            .collect();
        serde_json::json!({
            "status": self.verdict.as_str(),
            "services": services,
        })
    }

    pub fn failing_services(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.verdict == Verdict::Fail)
            .map(|r| r.service.as_str())
            .collect()
    }
}
