use serde::{Deserialize, Serialize};

/// One migration file discovered on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

/// Ledger row: `migration_name` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub name: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub error: Option<String>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}
