use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use crate::models::run::{DeploymentRun, Release, RunStatus, StageTransition};

/// Run audit log and known-good release history.
pub struct StateDb {
    conn: Mutex<Connection>,
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_status(s: &str) -> rusqlite::Result<RunStatus> {
    RunStatus::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown run status {s}").into(),
        )
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl StateDb {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS deployment_runs (
                id                 TEXT PRIMARY KEY,
                environment        TEXT NOT NULL,
                revision           TEXT NOT NULL DEFAULT '',
                versions           TEXT NOT NULL DEFAULT '{}',
                status             TEXT NOT NULL,
                backup_artifact_id TEXT,
                migrations_applied TEXT NOT NULL DEFAULT '[]',
                notifications      TEXT NOT NULL DEFAULT '[]',
                error              TEXT,
                started_at         TEXT NOT NULL,
                ended_at           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_env ON deployment_runs(environment, started_at DESC);

            CREATE TABLE IF NOT EXISTS run_transitions (
                run_id      TEXT NOT NULL REFERENCES deployment_runs(id),
                seq         INTEGER NOT NULL,
                from_status TEXT NOT NULL,
                to_status   TEXT NOT NULL,
                detail      TEXT,
                at          TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );

            CREATE TABLE IF NOT EXISTS known_good_releases (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                environment TEXT NOT NULL,
                revision    TEXT NOT NULL,
                versions    TEXT NOT NULL,
                run_id      TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_known_good_env ON known_good_releases(environment, id DESC);
            ",
        )?;
        Ok(())
    }

    // ── Deployment runs ──

    pub fn insert_run(&self, run: &DeploymentRun) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO deployment_runs
                (id, environment, revision, versions, status, backup_artifact_id,
                 migrations_applied, notifications, error, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id,
                run.environment,
                run.release.revision,
                serde_json::to_string(&run.release.versions)?,
                run.status.as_str(),
                run.backup_artifact_id,
                serde_json::to_string(&run.migrations_applied)?,
                serde_json::to_string(&run.notifications)?,
                run.error,
                ts(&run.started_at),
                run.ended_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Refresh the mutable summary columns. Transitions are append-only and
    /// written through `append_transition`.
    pub fn update_run(&self, run: &DeploymentRun) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE deployment_runs
             SET status = ?2, backup_artifact_id = ?3, migrations_applied = ?4,
                 notifications = ?5, error = ?6, ended_at = ?7
             WHERE id = ?1",
            params![
                run.id,
                run.status.as_str(),
                run.backup_artifact_id,
                serde_json::to_string(&run.migrations_applied)?,
                serde_json::to_string(&run.notifications)?,
                run.error,
                run.ended_at.as_ref().map(ts),
            ],
        )?;
        Ok(count > 0)
    }

    pub fn append_transition(&self, run_id: &str, t: &StageTransition) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_transitions (run_id, seq, from_status, to_status, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                t.seq,
                t.from.as_str(),
                t.to.as_str(),
                t.detail,
                ts(&t.at),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> anyhow::Result<Option<DeploymentRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, environment, revision, versions, status, backup_artifact_id,
                        migrations_applied, notifications, error, started_at, ended_at
                 FROM deployment_runs WHERE id = ?1",
                params![id],
                row_to_run,
            )
            .optional()?;
        let Some(mut run) = run else {
            return Ok(None);
        };
        run.transitions = load_transitions(&conn, &run.id)?;
        Ok(Some(run))
    }

    /// Newest first. Transitions are not loaded.
    pub fn list_runs(&self, environment: Option<&str>, limit: u32) -> anyhow::Result<Vec<DeploymentRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, environment, revision, versions, status, backup_artifact_id,
                    migrations_applied, notifications, error, started_at, ended_at
             FROM deployment_runs
             WHERE (?1 IS NULL OR environment = ?1)
             ORDER BY started_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![environment, limit], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Known-good releases ──

    pub fn record_known_good(&self, environment: &str, release: &Release, run_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO known_good_releases (environment, revision, versions, run_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                environment,
                release.revision,
                serde_json::to_string(&release.versions)?,
                run_id,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn latest_known_good(&self, environment: &str) -> anyhow::Result<Option<Release>> {
        let conn = self.conn.lock().unwrap();
        let release = conn
            .query_row(
                "SELECT revision, versions FROM known_good_releases
                 WHERE environment = ?1 ORDER BY id DESC LIMIT 1",
                params![environment],
                row_to_release,
            )
            .optional()?;
        Ok(release)
    }

    pub fn known_good_by_revision(&self, environment: &str, revision: &str) -> anyhow::Result<Option<Release>> {
        let conn = self.conn.lock().unwrap();
        let release = conn
            .query_row(
                "SELECT revision, versions FROM known_good_releases
                 WHERE environment = ?1 AND revision = ?2 ORDER BY id DESC LIMIT 1",
                params![environment, revision],
                row_to_release,
            )
            .optional()?;
        Ok(release)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRun> {
    let versions: String = row.get(3)?;
    let status: String = row.get(4)?;
    let migrations: String = row.get(6)?;
    let notifications: String = row.get(7)?;
    let started_at: String = row.get(9)?;
    let ended_at: Option<String> = row.get(10)?;
    Ok(DeploymentRun {
        id: row.get(0)?,
        environment: row.get(1)?,
        release: Release {
            revision: row.get(2)?,
            versions: parse_json(&versions)?,
        },
        status: parse_status(&status)?,
        backup_artifact_id: row.get(5)?,
        migrations_applied: parse_json(&migrations)?,
        notifications: parse_json(&notifications)?,
        error: row.get(8)?,
        started_at: parse_ts(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        transitions: Vec::new(),
    })
}

fn row_to_release(row: &rusqlite::Row<'_>) -> rusqlite::Result<Release> {
    let versions: String = row.get(1)?;
    Ok(Release {
        revision: row.get(0)?,
        versions: parse_json(&versions)?,
    })
}

fn load_transitions(conn: &Connection, run_id: &str) -> anyhow::Result<Vec<StageTransition>> {
    let mut stmt = conn.prepare(
        "SELECT seq, from_status, to_status, detail, at FROM run_transitions
         WHERE run_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            let from: String = row.get(1)?;
            let to: String = row.get(2)?;
            let at: String = row.get(4)?;
            Ok(StageTransition {
                seq: row.get(0)?,
                from: parse_status(&from)?,
                to: parse_status(&to)?,
                detail: row.get(3)?,
                at: parse_ts(&at)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn run_and_transitions_round_trip() {
        let db = StateDb::open_in_memory().unwrap();
        let mut run = DeploymentRun::new(
            "staging",
            Release {
                revision: "abc123".into(),
                versions: BTreeMap::from([("api".to_string(), "api:2".to_string())]),
            },
        );
        db.insert_run(&run).unwrap();

        let t = run.transition(RunStatus::Validating, None).unwrap().clone();
        db.append_transition(&run.id, &t).unwrap();
        let t = run
            .transition(RunStatus::Failed, Some("disk full".into()))
            .unwrap()
            .clone();
        db.append_transition(&run.id, &t).unwrap();
        run.error = Some("validation failed".into());
        assert!(db.update_run(&run).unwrap());

        let loaded = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.release.versions["api"], "api:2");
        assert_eq!(loaded.transitions.len(), 2);
        assert_eq!(loaded.transitions[1].detail.as_deref(), Some("disk full"));
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.error.as_deref(), Some("validation failed"));
    }

    #[test]
    fn transitions_are_append_only() {
        let db = StateDb::open_in_memory().unwrap();
        let mut run = DeploymentRun::new("staging", Release::default());
        db.insert_run(&run).unwrap();
        let t = run.transition(RunStatus::Validating, None).unwrap().clone();
        db.append_transition(&run.id, &t).unwrap();
        assert!(db.append_transition(&run.id, &t).is_err());
    }

    #[test]
    fn list_runs_filters_by_environment() {
        let db = StateDb::open_in_memory().unwrap();
        db.insert_run(&DeploymentRun::new("staging", Release::default())).unwrap();
        db.insert_run(&DeploymentRun::new("production", Release::default())).unwrap();
        assert_eq!(db.list_runs(Some("staging"), 10).unwrap().len(), 1);
        assert_eq!(db.list_runs(None, 10).unwrap().len(), 2);
        assert!(db.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn latest_known_good_wins() {
        let db = StateDb::open_in_memory().unwrap();
        assert!(db.latest_known_good("production").unwrap().is_none());
        for rev in ["r1", "r2"] {
            let release = Release {
                revision: rev.into(),
                versions: BTreeMap::new(),
            };
            db.record_known_good("production", &release, "run").unwrap();
        }
        assert_eq!(db.latest_known_good("production").unwrap().unwrap().revision, "r2");
        assert!(db.known_good_by_revision("production", "r1").unwrap().is_some());
        assert!(db.latest_known_good("staging").unwrap().is_none());
    }
}
