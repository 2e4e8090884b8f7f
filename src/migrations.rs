use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, params};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::components::StatefulComponent;
use crate::config::MigrationConfig;
use crate::models::migration::{Migration, MigrationRecord, MigrationReport};

/// The ledger lives inside the structured store it describes, so a
/// migration's effect and its ledger row commit in the same transaction.
const LEDGER_DDL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    migration_name TEXT PRIMARY KEY,
    applied_at     TEXT NOT NULL
)";

/// Component name under which the migrated database is captured.
pub const MIGRATION_DB: &str = "migration-db";

#[derive(Debug, Clone)]
pub struct MigrationRunner {
    dir: PathBuf,
    database: PathBuf,
}

impl MigrationRunner {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            database: config.database.clone(),
        }
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        if let Some(parent) = self.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.database)
            .with_context(|| format!("opening {}", self.database.display()))?;
        conn.execute_batch(LEDGER_DDL)?;
        Ok(conn)
    }

    /// All `*.sql` files in the migration directory, in lexical order of
    /// file name. A missing directory means no migrations.
    pub fn discover(&self) -> anyhow::Result<Vec<Migration>> {
        discover(&self.dir)
    }

    pub fn applied(&self) -> anyhow::Result<Vec<MigrationRecord>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT migration_name, applied_at FROM schema_migrations ORDER BY migration_name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    name: row.get(0)?,
                    applied_at: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn pending(&self) -> anyhow::Result<Vec<Migration>> {
        let applied: Vec<String> = self.applied()?.into_iter().map(|r| r.name).collect();
        Ok(self
            .discover()?
            .into_iter()
            .filter(|m| !applied.contains(&m.name))
            .collect())
    }

    /// Every known migration with its applied-at timestamp, if any.
    pub fn status(&self) -> anyhow::Result<BTreeMap<String, Option<String>>> {
        let mut status: BTreeMap<String, Option<String>> =
            self.discover()?.into_iter().map(|m| (m.name, None)).collect();
        for record in self.applied()? {
            status.insert(record.name, Some(record.applied_at));
        }
        Ok(status)
    }

    /// Apply every not-yet-applied migration in order, each in its own
    /// transaction together with its ledger row. Stops at the first failure;
    /// whatever applied before it stays recorded so a rerun resumes there.
    ///
    /// `Err` is reserved for problems reaching the store or reading the
    /// migration directory. A failing migration is reported in the returned
    /// report instead.
    pub fn apply_pending(&self) -> anyhow::Result<MigrationReport> {
        let migrations = self.discover()?;
        let mut conn = self.connect()?;
        let applied: Vec<String> = {
            let mut stmt = conn.prepare("SELECT migration_name FROM schema_migrations")?;
            stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?
        };

        let mut report = MigrationReport::default();
        for migration in migrations {
            if applied.contains(&migration.name) {
                report.skipped.push(migration.name);
                continue;
            }
            tracing::info!("applying migration {}", migration.name);
            match apply_one(&mut conn, &migration) {
                Ok(()) => report.applied.push(migration.name),
                Err(e) => {
                    tracing::error!("migration {} failed: {e}", migration.name);
                    report.error = Some(e.to_string());
                    report.failed.push(migration.name);
                    break;
                }
            }
        }

        if report.is_success() {
            tracing::info!(
                "migrations complete ({} applied, {} already applied)",
                report.applied.len(),
                report.skipped.len()
            );
        }
        Ok(report)
    }
}

// ── Backup and restore ──

/// The migrated database is the structured store: every pre-deploy
/// artifact captures it and a rollback restores it before anything else.
#[async_trait]
impl StatefulComponent for MigrationRunner {
    fn name(&self) -> &str {
        MIGRATION_DB
    }

    fn is_critical(&self) -> bool {
        true
    }

    fn restore_order(&self) -> u32 {
        0
    }

    async fn dump(&self) -> anyhow::Result<Vec<u8>> {
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || snapshot(&database)).await?
    }

    async fn restore(&self, payload: &[u8]) -> anyhow::Result<()> {
        let database = self.database.clone();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || replace(&database, &payload)).await?
    }

    /// Read-only: a database that does not exist yet is created by the
    /// first migration run, not here.
    async fn ping(&self) -> anyhow::Result<bool> {
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            if !database.exists() {
                return Ok(true);
            }
            let conn = Connection::open_with_flags(&database, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("opening {}", database.display()))?;
            conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
            Ok(true)
        })
        .await?
    }
}

fn sibling(database: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(database.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// A consistent copy of the database file. A database that was never
/// created dumps as an empty payload.
fn snapshot(database: &Path) -> anyhow::Result<Vec<u8>> {
    if !database.exists() {
        return Ok(Vec::new());
    }
    let copy = sibling(database, ".snapshot");
    if copy.exists() {
        std::fs::remove_file(&copy)?;
    }
    {
        let conn = Connection::open(database).with_context(|| format!("opening {}", database.display()))?;
        conn.execute("VACUUM INTO ?1", params![copy.to_string_lossy().into_owned()])?;
    }
    let raw = std::fs::read(&copy)?;
    std::fs::remove_file(&copy)?;
    Ok(raw)
}

/// Swap the database file for `payload`; an empty payload removes it.
fn replace(database: &Path, payload: &[u8]) -> anyhow::Result<()> {
    for suffix in ["-wal", "-shm", "-journal"] {
        let stale = sibling(database, suffix);
        if stale.exists() {
            std::fs::remove_file(&stale)?;
        }
    }
    if payload.is_empty() {
        if database.exists() {
            std::fs::remove_file(database)?;
        }
        return Ok(());
    }
    if let Some(parent) = database.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let partial = sibling(database, ".restore");
    {
        let mut file = std::fs::File::create(&partial)?;
        file.write_all(payload)?;
        file.sync_all()?;
    }
    std::fs::rename(&partial, database)?;
    Ok(())
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(&migration.sql)?;
    tx.execute(
        "INSERT INTO schema_migrations (migration_name, applied_at) VALUES (?1, ?2)",
        params![
            migration.name,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
        ],
    )?;
    tx.commit()
}

fn discover(dir: &Path) -> anyhow::Result<Vec<Migration>> {
    if !dir.exists() {
        tracing::debug!("migration dir {} not found, nothing to apply", dir.display());
        return Ok(Vec::new());
    }
    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let sql = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        migrations.push(Migration { name, sql });
    }
    migrations.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(dir: &Path) -> MigrationRunner {
        std::fs::create_dir_all(dir.join("migrations")).unwrap();
        MigrationRunner::new(&MigrationConfig {
            dir: dir.join("migrations"),
            database: dir.join("data/app.db"),
        })
    }

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join("migrations").join(name), sql).unwrap();
    }

    #[test]
    fn applies_in_lexical_order_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        write(dir.path(), "0002_add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT;");
        write(dir.path(), "0001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        write(dir.path(), "README.md", "not a migration");

        let first = runner.apply_pending().unwrap();
        assert_eq!(first.applied, vec!["0001_users.sql", "0002_add_email.sql"]);
        assert!(first.is_success());

        let second = runner.apply_pending().unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert!(runner.pending().unwrap().is_empty());
    }

    #[test]
    fn failure_stops_and_leaves_no_partial_effect() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        write(dir.path(), "0001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        write(
            dir.path(),
            "0002_broken.sql",
            "CREATE TABLE orders (id INTEGER); INSERT INTO nowhere VALUES (1);",
        );
        write(dir.path(), "0003_later.sql", "CREATE TABLE later (id INTEGER);");

        let report = runner.apply_pending().unwrap();
        assert_eq!(report.applied, vec!["0001_users.sql"]);
        assert_eq!(report.failed, vec!["0002_broken.sql"]);
        assert!(report.error.is_some());

        let conn = Connection::open(dir.path().join("data/app.db")).unwrap();
        let orders: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'orders'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orders, 0);

        // fix and resume
        write(dir.path(), "0002_broken.sql", "CREATE TABLE orders (id INTEGER);");
        let resumed = runner.apply_pending().unwrap();
        assert_eq!(resumed.applied, vec!["0002_broken.sql", "0003_later.sql"]);
        assert_eq!(resumed.skipped, vec!["0001_users.sql"]);
    }

    #[tokio::test]
    async fn restoring_a_dump_rewinds_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let database = dir.path().join("data/app.db");

        // never created: empty dump, restoring it removes the file again
        let blank = runner.dump().await.unwrap();
        assert!(blank.is_empty());

        write(dir.path(), "0001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        runner.apply_pending().unwrap();
        let before = runner.dump().await.unwrap();
        assert!(!before.is_empty());

        write(dir.path(), "0002_orders.sql", "CREATE TABLE orders (id INTEGER PRIMARY KEY);");
        runner.apply_pending().unwrap();
        assert_eq!(runner.applied().unwrap().len(), 2);

        runner.restore(&before).await.unwrap();
        let names: Vec<String> = runner.applied().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["0001_users.sql"]);
        assert_eq!(runner.pending().unwrap().len(), 1);

        runner.restore(&blank).await.unwrap();
        assert!(!database.exists());
        assert!(runner.ping().await.unwrap());
        assert!(!database.exists());
        assert!(runner.applied().unwrap().is_empty());

        std::fs::write(&database, b"not a database").unwrap();
        assert!(runner.ping().await.is_err());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MigrationRunner::new(&MigrationConfig {
            dir: dir.path().join("absent"),
            database: dir.path().join("app.db"),
        });
        let report = runner.apply_pending().unwrap();
        assert!(report.applied.is_empty() && report.is_success());
        assert!(runner.status().unwrap().is_empty());
    }
}
