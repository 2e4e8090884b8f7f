//! Durable storage for backup payloads.
//!
//! Layout under the artifact root:
//!
//! ```text
//! index.db                      artifact index + reference table
//! <artifact-id>/manifest.json   copy of the index row, for humans and tooling
//! <artifact-id>/<component>.zst zstd-compressed dump
//! ```
//!
//! Payload files are written once and never overwritten. Retention sweeps
//! and live rollbacks coordinate through the `artifact_refs` table rather
//! than locks.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::artifact::{ArtifactKind, ArtifactStatus, BackupArtifact, ComponentArchive, VerificationStatus};

const ZSTD_LEVEL: i32 = 3;

pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<Connection>,
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn conversion_error(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating artifact root {}", root.display()))?;
        let conn = Connection::open(root.join("index.db"))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS artifacts (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                environment TEXT NOT NULL,
                status      TEXT NOT NULL,
                total_size  INTEGER NOT NULL,
                components  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_env ON artifacts(environment, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_artifacts_expiry ON artifacts(expires_at);

            CREATE TABLE IF NOT EXISTS artifact_refs (
                artifact_id TEXT NOT NULL REFERENCES artifacts(id),
                holder      TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                PRIMARY KEY (artifact_id, holder)
            );
            ",
        )?;
        Ok(Self {
            root,
            index: Mutex::new(conn),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically sortable by creation time.
    pub fn new_artifact_id(kind: ArtifactKind) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            kind.as_str(),
            &suffix[..8]
        )
    }

    fn artifact_dir(&self, artifact_id: &str) -> PathBuf {
        self.root.join(artifact_id)
    }

    // ── Payloads ──

    /// Compress and persist one component dump. Fails if the file exists.
    pub fn write_component(
        &self,
        artifact_id: &str,
        name: &str,
        critical: bool,
        raw: &[u8],
    ) -> anyhow::Result<ComponentArchive> {
        let dir = self.artifact_dir(artifact_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("{name}.zst");
        let path = dir.join(&file_name);
        if path.exists() {
            anyhow::bail!("refusing to overwrite {}", path.display());
        }

        let compressed = zstd::encode_all(raw, ZSTD_LEVEL)?;
        let partial = dir.join(format!("{file_name}.partial"));
        {
            let mut file = std::fs::File::create(&partial)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        std::fs::rename(&partial, &path)?;

        Ok(ComponentArchive {
            name: name.to_string(),
            critical,
            file_name,
            size_bytes: raw.len() as u64,
            checksum: checksum(raw),
            verification: VerificationStatus::Verified,
            error: None,
        })
    }

    /// Decompress a component payload without verifying it.
    pub fn read_component(&self, artifact_id: &str, archive: &ComponentArchive) -> anyhow::Result<Vec<u8>> {
        let path = self.artifact_dir(artifact_id).join(&archive.file_name);
        let file = std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let raw = zstd::decode_all(file).with_context(|| format!("decompressing {}", path.display()))?;
        Ok(raw)
    }

    /// Structural read-back plus size and checksum comparison.
    pub fn verify_component(&self, artifact_id: &str, archive: &ComponentArchive) -> anyhow::Result<Vec<u8>> {
        let raw = self.read_component(artifact_id, archive)?;
        if raw.len() as u64 != archive.size_bytes {
            anyhow::bail!(
                "{}: size mismatch (expected {}, read {})",
                archive.name,
                archive.size_bytes,
                raw.len()
            );
        }
        let actual = checksum(&raw);
        if actual != archive.checksum {
            anyhow::bail!("{}: checksum mismatch", archive.name);
        }
        Ok(raw)
    }

    // ── Index ──

    /// Insert a finished artifact. Artifacts are never replaced.
    pub fn save(&self, artifact: &BackupArtifact) -> anyhow::Result<()> {
        let conn = self.index.lock().unwrap();
        conn.execute(
            "INSERT INTO artifacts (id, kind, environment, status, total_size, components, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                artifact.id,
                artifact.kind.as_str(),
                artifact.environment,
                artifact.status.as_str(),
                artifact.total_size as i64,
                serde_json::to_string(&artifact.components)?,
                artifact.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                artifact.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        drop(conn);

        let dir = self.artifact_dir(&artifact.id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(artifact)?)?;
        Ok(())
    }

    /// Record the outcome of a later re-verification. Only the index row
    /// changes; payload files are untouched.
    pub fn record_verification(&self, artifact: &BackupArtifact) -> anyhow::Result<bool> {
        let conn = self.index.lock().unwrap();
        let count = conn.execute(
            "UPDATE artifacts SET status = ?2, components = ?3 WHERE id = ?1",
            params![
                artifact.id,
                artifact.status.as_str(),
                serde_json::to_string(&artifact.components)?,
            ],
        )?;
        Ok(count > 0)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<BackupArtifact>> {
        let conn = self.index.lock().unwrap();
        let artifact = conn
            .query_row(
                "SELECT id, kind, environment, status, total_size, components, created_at, expires_at
                 FROM artifacts WHERE id = ?1",
                params![id],
                row_to_artifact,
            )
            .optional()?;
        Ok(artifact)
    }

    /// Newest first.
    pub fn list(&self, environment: Option<&str>) -> anyhow::Result<Vec<BackupArtifact>> {
        let conn = self.index.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, environment, status, total_size, components, created_at, expires_at
             FROM artifacts
             WHERE (?1 IS NULL OR environment = ?1)
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![environment], row_to_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent artifact eligible as an automatic rollback target:
    /// not unusable and not a forensic pre-rollback capture.
    pub fn latest_restorable(&self, environment: &str) -> anyhow::Result<Option<BackupArtifact>> {
        Ok(self.list(Some(environment))?.into_iter().find(|a| {
            a.status != ArtifactStatus::Unusable && a.kind != ArtifactKind::PreRollback
        }))
    }

    pub fn expired(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<BackupArtifact>> {
        let conn = self.index.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, environment, status, total_size, components, created_at, expires_at
             FROM artifacts WHERE expires_at <= ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![now.to_rfc3339_opts(SecondsFormat::Micros, true)], row_to_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── References ──

    /// Take a reference on an artifact. The reference is released when the
    /// returned lease is dropped.
    pub fn acquire(self: &Arc<Self>, artifact_id: &str, holder: &str) -> anyhow::Result<ArtifactLease> {
        {
            let conn = self.index.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO artifact_refs (artifact_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
                params![artifact_id, holder, Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)],
            )?;
        }
        tracing::debug!("artifact {artifact_id}: reference taken by {holder}");
        Ok(ArtifactLease {
            store: Arc::clone(self),
            artifact_id: artifact_id.to_string(),
            holder: holder.to_string(),
        })
    }

    fn release(&self, artifact_id: &str, holder: &str) -> anyhow::Result<()> {
        let conn = self.index.lock().unwrap();
        conn.execute(
            "DELETE FROM artifact_refs WHERE artifact_id = ?1 AND holder = ?2",
            params![artifact_id, holder],
        )?;
        Ok(())
    }

    pub fn ref_count(&self, artifact_id: &str) -> anyhow::Result<u32> {
        let conn = self.index.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM artifact_refs WHERE artifact_id = ?1",
            params![artifact_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove an artifact's payloads and index row. Returns `false` without
    /// touching anything if the artifact is referenced.
    pub fn delete(&self, artifact_id: &str) -> anyhow::Result<bool> {
        let conn = self.index.lock().unwrap();
        let refs: u32 = conn.query_row(
            "SELECT COUNT(*) FROM artifact_refs WHERE artifact_id = ?1",
            params![artifact_id],
            |row| row.get(0),
        )?;
        if refs > 0 {
            return Ok(false);
        }
        let dir = self.artifact_dir(artifact_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        conn.execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])?;
        Ok(true)
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupArtifact> {
    let kind: String = row.get(1)?;
    let status: String = row.get(3)?;
    let total_size: i64 = row.get(4)?;
    let components: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let expires_at: String = row.get(7)?;
    let parse_ts = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(e.to_string()))
    };
    Ok(BackupArtifact {
        id: row.get(0)?,
        kind: ArtifactKind::parse(&kind).ok_or_else(|| conversion_error(format!("unknown artifact kind {kind}")))?,
        environment: row.get(2)?,
        status: ArtifactStatus::parse(&status)
            .ok_or_else(|| conversion_error(format!("unknown artifact status {status}")))?,
        total_size: total_size as u64,
        components: serde_json::from_str(&components).map_err(|e| conversion_error(e.to_string()))?,
        created_at: parse_ts(&created_at)?,
        expires_at: parse_ts(&expires_at)?,
    })
}

/// A live reference on an artifact; blocks retention deletion until dropped.
pub struct ArtifactLease {
    store: Arc<ArtifactStore>,
    artifact_id: String,
    holder: String,
}

impl ArtifactLease {
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.artifact_id, &self.holder) {
            tracing::warn!("artifact {}: failed to release reference: {e}", self.artifact_id);
        }
    }
}
