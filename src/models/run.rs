use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeployError;
use crate::models::notification::NotificationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Validating,
    BackingUp,
    Migrating,
    Deploying,
    HealthChecking,
    Succeeded,
    RollingBack,
    RolledBack,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Validating => "validating",
            RunStatus::BackingUp => "backing_up",
            RunStatus::Migrating => "migrating",
            RunStatus::Deploying => "deploying",
            RunStatus::HealthChecking => "health_checking",
            RunStatus::Succeeded => "succeeded",
            RunStatus::RollingBack => "rolling_back",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RunStatus::Pending,
            "validating" => RunStatus::Validating,
            "backing_up" => RunStatus::BackingUp,
            "migrating" => RunStatus::Migrating,
            "deploying" => RunStatus::Deploying,
            "health_checking" => RunStatus::HealthChecking,
            "succeeded" => RunStatus::Succeeded,
            "rolling_back" => RunStatus::RollingBack,
            "rolled_back" => RunStatus::RolledBack,
            "failed" => RunStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::RolledBack | RunStatus::Failed
        )
    }

    /// Position in the forward pipeline, `None` for outcome states.
    fn stage_rank(&self) -> Option<u8> {
        match self {
            RunStatus::Pending => Some(0),
            RunStatus::Validating => Some(1),
            RunStatus::BackingUp => Some(2),
            RunStatus::Migrating => Some(3),
            RunStatus::Deploying => Some(4),
            RunStatus::HealthChecking => Some(5),
            _ => None,
        }
    }

    /// Skipped stages are allowed (a run started with `--no-backup` goes
    /// straight from `Validating` to `Migrating`), but `HealthChecking` is
    /// only reachable from `Deploying`. Nothing committed exists before
    /// `Migrating`, so only those early states may fail without rolling back.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (RunStatus::RollingBack, RunStatus::RolledBack | RunStatus::Failed) => true,
            (RunStatus::RollingBack, _) => false,
            (from, RunStatus::Failed) => matches!(
                from,
                RunStatus::Pending | RunStatus::Validating | RunStatus::BackingUp
            ),
            (from, RunStatus::RollingBack) => matches!(
                from,
                RunStatus::Migrating | RunStatus::Deploying | RunStatus::HealthChecking
            ),
            (RunStatus::HealthChecking, RunStatus::Succeeded) => true,
            (RunStatus::Deploying, RunStatus::HealthChecking) => true,
            (from, to) => match (from.stage_rank(), to.stage_rank()) {
                (Some(a), Some(b)) => b > a && b <= 4,
                _ => false,
            },
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What gets deployed: a source revision plus the per-service image/version set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub revision: String,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub seq: u32,
    pub from: RunStatus,
    pub to: RunStatus,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: String,
    pub environment: String,
    pub release: Release,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub backup_artifact_id: Option<String>,
    #[serde(default)]
    pub migrations_applied: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<StageTransition>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
}

impl DeploymentRun {
    pub fn new(environment: &str, release: Release) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            environment: environment.to_string(),
            release,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            backup_artifact_id: None,
            migrations_applied: Vec::new(),
            error: None,
            transitions: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Advance the state machine. Terminal runs are immutable.
    pub fn transition(
        &mut self,
        to: RunStatus,
        detail: Option<String>,
    ) -> Result<&StageTransition, DeployError> {
        if !self.status.can_transition_to(to) {
            return Err(DeployError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.transitions.push(StageTransition {
            seq: self.transitions.len() as u32 + 1,
            from: self.status,
            to,
            at: now,
            detail,
        });
        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    pub fn passed_through(&self, status: RunStatus) -> bool {
        self.transitions.iter().any(|t| t.to == status)
    }

    /// CLI exit code: 0 success, 1 nothing-happened or rolled back,
    /// 2 rollback failed and an operator has to step in.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed if self.passed_through(RunStatus::RollingBack) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> DeploymentRun {
        DeploymentRun::new("staging", Release::default())
    }

    #[test]
    fn happy_path_transitions() {
        let mut run = run();
        for status in [
            RunStatus::Validating,
            RunStatus::BackingUp,
            RunStatus::Migrating,
            RunStatus::Deploying,
            RunStatus::HealthChecking,
            RunStatus::Succeeded,
        ] {
            run.transition(status, None).unwrap();
        }
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.transitions.len(), 6);
        assert_eq!(run.transitions[0].from, RunStatus::Pending);
        assert!(run.ended_at.is_some());
        assert_eq!(run.exit_code(), 0);
    }

    #[test]
    fn skipped_stages_are_allowed() {
        let mut run = run();
        run.transition(RunStatus::Deploying, None).unwrap();
        run.transition(RunStatus::HealthChecking, None).unwrap();
        assert_eq!(run.status, RunStatus::HealthChecking);
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let mut run = run();
        run.transition(RunStatus::Validating, None).unwrap();
        run.transition(RunStatus::Failed, Some("disk".into())).unwrap();
        let err = run.transition(RunStatus::BackingUp, None).unwrap_err();
        assert!(matches!(err, DeployError::InvalidTransition { .. }));
        assert_eq!(run.transitions.len(), 2);
        assert_eq!(run.exit_code(), 1);
    }

    #[test]
    fn committed_stages_cannot_fail_without_rollback() {
        assert!(!RunStatus::Migrating.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Deploying.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Migrating.can_transition_to(RunStatus::RollingBack));
        assert!(RunStatus::BackingUp.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::BackingUp.can_transition_to(RunStatus::RollingBack));
        assert!(!RunStatus::Migrating.can_transition_to(RunStatus::HealthChecking));
        assert!(!RunStatus::HealthChecking.can_transition_to(RunStatus::Deploying));
    }

    #[test]
    fn rollback_failure_exits_with_two() {
        let mut run = run();
        run.transition(RunStatus::Deploying, None).unwrap();
        run.transition(RunStatus::RollingBack, None).unwrap();
        run.transition(RunStatus::Failed, None).unwrap();
        assert_eq!(run.exit_code(), 2);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [RunStatus::Pending, RunStatus::HealthChecking, RunStatus::RolledBack] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }
}
