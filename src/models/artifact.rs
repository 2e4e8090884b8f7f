use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    PreDeploy,
    Scheduled,
    PreRollback,
    Manual,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::PreDeploy => "pre_deploy",
            ArtifactKind::Scheduled => "scheduled",
            ArtifactKind::PreRollback => "pre_rollback",
            ArtifactKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pre_deploy" => ArtifactKind::PreDeploy,
            "scheduled" => ArtifactKind::Scheduled,
            "pre_rollback" => ArtifactKind::PreRollback,
            "manual" => ArtifactKind::Manual,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Every component archive passed its integrity check.
    Verified,
    /// Some non-critical component is missing or corrupt; still restorable
    /// component by component.
    Degraded,
    /// The structured-data store is missing or corrupt.
    Unusable,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Verified => "verified",
            ArtifactStatus::Degraded => "degraded",
            ArtifactStatus::Unusable => "unusable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "verified" => ArtifactStatus::Verified,
            "degraded" => ArtifactStatus::Degraded,
            "unusable" => ArtifactStatus::Unusable,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentArchive {
    pub name: String,
    pub critical: bool,
    pub file_name: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the uncompressed dump.
    pub checksum: String,
    pub verification: VerificationStatus,
    pub error: Option<String>,
}

impl ComponentArchive {
    pub fn failed(name: &str, critical: bool, error: String) -> Self {
        Self {
            name: name.to_string(),
            critical,
            file_name: String::new(),
            size_bytes: 0,
            checksum: String::new(),
            verification: VerificationStatus::Failed,
            error: Some(error),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification == VerificationStatus::Verified
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub components: Vec<ComponentArchive>,
    pub total_size: u64,
    pub status: ArtifactStatus,
}

impl BackupArtifact {
    /// Fold component outcomes into an artifact status. A failed critical
    /// component makes the whole artifact unusable; any other failure only
    /// degrades it. An artifact with no components is unusable.
    pub fn reduce_status(components: &[ComponentArchive]) -> ArtifactStatus {
        if components.is_empty() {
            return ArtifactStatus::Unusable;
        }
        if components.iter().any(|c| c.critical && !c.is_verified()) {
            ArtifactStatus::Unusable
        } else if components.iter().any(|c| !c.is_verified()) {
            ArtifactStatus::Degraded
        } else {
            ArtifactStatus::Verified
        }
    }

    pub fn refresh_status(&mut self) {
        self.total_size = self.components.iter().map(|c| c.size_bytes).sum();
        self.status = Self::reduce_status(&self.components);
    }

    pub fn component(&self, name: &str) -> Option<&ComponentArchive> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Per-component restore capability: only verified archives are restored.
    pub fn can_restore(&self, component: &str) -> bool {
        self.component(component).is_some_and(|c| c.is_verified())
    }

    pub fn failed_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| !c.is_verified())
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str, critical: bool) -> ComponentArchive {
        ComponentArchive {
            name: name.to_string(),
            critical,
            file_name: format!("{name}.zst"),
            size_bytes: 10,
            checksum: "abc".to_string(),
            verification: VerificationStatus::Verified,
            error: None,
        }
    }

    #[test]
    fn all_verified_is_verified() {
        let comps = vec![ok("postgres", true), ok("mongo", false)];
        assert_eq!(BackupArtifact::reduce_status(&comps), ArtifactStatus::Verified);
    }

    #[test]
    fn non_critical_failure_degrades() {
        let comps = vec![
            ok("postgres", true),
            ComponentArchive::failed("druid", false, "timeout".into()),
        ];
        assert_eq!(BackupArtifact::reduce_status(&comps), ArtifactStatus::Degraded);
    }

    #[test]
    fn critical_failure_is_unusable() {
        let comps = vec![
            ComponentArchive::failed("postgres", true, "pg_dump exited 1".into()),
            ok("mongo", false),
        ];
        assert_eq!(BackupArtifact::reduce_status(&comps), ArtifactStatus::Unusable);
        assert_eq!(BackupArtifact::reduce_status(&[]), ArtifactStatus::Unusable);
    }
}
