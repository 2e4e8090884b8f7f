use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StageTransition,
    Success,
    Failure,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StageTransition => "stage_transition",
            EventType::Success => "success",
            EventType::Failure => "failure",
            EventType::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "stage_transition" | "stage" | "info" => EventType::StageTransition,
            "success" => EventType::Success,
            "failure" | "error" => EventType::Failure,
            "warning" | "warn" => EventType::Warning,
            _ => return None,
        })
    }

    fn label(&self) -> &'static str {
        match self {
            EventType::StageTransition => "INFO",
            EventType::Success => "SUCCESS",
            EventType::Failure => "FAILURE",
            EventType::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub environment: String,
    pub run_id: Option<String>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(event_type: EventType, environment: &str, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            event_type,
            environment: environment.to_string(),
            run_id: None,
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    pub fn for_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn rendered_title(&self) -> String {
        format!("[{}] {}: {}", self.environment, self.event_type.label(), self.title)
    }

    pub fn rendered_body(&self) -> String {
        let mut body = self.body.clone();
        if let Some(run_id) = &self.run_id {
            body.push_str(&format!("\n\nrun: {run_id}"));
        }
        body.push_str(&format!("\nat: {}", self.created_at.format("%Y-%m-%dT%H:%M:%SZ")));
        body
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: String,
    pub delivered: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub event_type: EventType,
    pub deliveries: Vec<ChannelDelivery>,
}

impl DeliveryReport {
    /// Zero configured channels.
    pub fn is_noop(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn delivered_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.delivered).count()
    }

    pub fn failed_count(&self) -> usize {
        self.deliveries.len() - self.delivered_count()
    }
}

/// What a DeploymentRun keeps about each notification it emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub event_type: EventType,
    pub title: String,
    pub delivered: usize,
    pub failed: usize,
}

impl NotificationRecord {
    pub fn new(event: &NotificationEvent, report: &DeliveryReport) -> Self {
        Self {
            event_type: event.event_type,
            title: event.title.clone(),
            delivered: report.delivered_count(),
            failed: report.failed_count(),
        }
    }
}
