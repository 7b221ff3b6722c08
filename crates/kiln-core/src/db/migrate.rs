//! Stepwise schema migration.
//!
//! Upgrades never touch the live database in place. The file is cloned with
//! the SQLite backup API, each registered single-step migration runs in its
//! own immediate transaction on the clone, the current DDL is re-applied,
//! and only after an integrity check does the clone replace the original —
//! which is kept, with its WAL siblings, under a `.backup` name. A failure
//! at any point removes the clone and leaves the originals untouched.
//!
//! Downgrades are refused, as are databases older than version 6.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

use super::schema;
use super::DbError;

/// Oldest schema this tool can start from.
pub const FIRST_SUPPORTED_VERSION: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyCurrent { version: i64 },
    Migrated { from: i64, to: i64 },
}

struct MigrationStep {
    from: i64,
    description: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("pragma table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if row.get::<_, String>(1)? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_runner_status(conn: &Connection) -> rusqlite::Result<()> {
    if !has_column(conn, "jobs", "runner_status")? {
        conn.execute_batch(
            "alter table jobs add column runner_status integer not null default 0;",
        )?;
    }
    Ok(())
}

fn add_runner_status_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "create index if not exists runner_status_idx \
         on jobs(runner_status) where runner_status <> 0;",
    )
}

fn adjust_locking_pragmas(_conn: &Connection) -> rusqlite::Result<()> {
    // locking_mode=normal and the busy timeout are open-time pragmas; the
    // schema DDL re-applied after the steps carries them. Version bump only.
    Ok(())
}

/// Widen `runner_status` from `integer not null default 0` to nullable
/// text. 0 becomes null (success); anything else is rewritten as a message.
///
/// Recreate-under-a-new-name-then-rename keeps the `references jobs` clauses
/// in other tables pointing at the surviving table. Foreign keys are off on
/// this connection (the default), so the intermediate drop is legal.
fn widen_runner_status(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        drop index if exists runner_status_idx;
        create table jobs_new(
          job_id      integer primary key autoincrement,
          run_id      integer not null references runs(run_id),
          use_id      integer not null references runs(run_id),
          label       text    not null,
          directory   text    not null,
          commandline blob    not null,
          environment blob    not null,
          stdin       text    not null,
          signature   integer not null,
          stack       blob    not null,
          stat_id     integer references stats(stat_id),
          starttime   integer not null default 0,
          endtime     integer not null default 0,
          keep        integer not null default 0,
          stale       integer not null default 0,
          is_atty     integer not null default 0,
          runner_status text);
        insert into jobs_new(job_id, run_id, use_id, label, directory, commandline,
                             environment, stdin, signature, stack, stat_id,
                             starttime, endtime, keep, stale, is_atty, runner_status)
          select job_id, run_id, use_id, label, directory, commandline,
                 environment, stdin, signature, stack, stat_id,
                 starttime, endtime, keep, stale, is_atty,
                 case when runner_status = 0 then null
                      else 'Numeric return code ' || runner_status end
          from jobs;
        drop table jobs;
        alter table jobs_new rename to jobs;
        create index if not exists job on jobs(directory, commandline, environment, stdin, signature, keep, job_id, stat_id);
        create index if not exists runner_status_idx on jobs(runner_status) where runner_status is not null;
        create index if not exists jobstats on jobs(stat_id);
        "#,
    )
}

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: 6,
        description: "add jobs.runner_status column",
        apply: add_runner_status,
    },
    MigrationStep {
        from: 7,
        description: "add runner_status partial index",
        apply: add_runner_status_index,
    },
    MigrationStep {
        from: 8,
        description: "switch locking mode to normal with a busy timeout",
        apply: adjust_locking_pragmas,
    },
    MigrationStep {
        from: 9,
        description: "widen runner_status to nullable text",
        apply: widen_runner_status,
    },
];

/// Version recorded in an existing database, or `None` for a database with
/// no version bookkeeping at all (a fresh file).
///
/// `pragma user_version` is preferred; the `schema` table covers legacy
/// databases stamped before the pragma was adopted.
pub fn recorded_version(conn: &Connection) -> Result<Option<i64>, DbError> {
    let user_version: i64 = conn.query_row("pragma user_version", [], |row| row.get(0))?;
    if user_version > 0 {
        return Ok(Some(user_version));
    }
    let has_schema_table: i64 = conn.query_row(
        "select count(*) from sqlite_master where type='table' and name='schema'",
        [],
        |row| row.get(0),
    )?;
    if has_schema_table == 0 {
        return Ok(None);
    }
    let version: Option<i64> =
        conn.query_row("select max(version) from schema", [], |row| row.get(0))?;
    Ok(Some(version.unwrap_or(0)))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", path.display()))
}

/// Removes the half-built clone on drop unless the swap completed.
struct TempCleanup {
    path: PathBuf,
    armed: bool,
}

impl TempCleanup {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempCleanup {
    fn drop(&mut self) {
        if self.armed {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let _ = fs::remove_file(sibling(&self.path, suffix));
            }
        }
    }
}

fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("pragma wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

/// Upgrade `path` to the current schema version.
pub fn migrate_database(path: &Path) -> Result<MigrationOutcome, DbError> {
    let live = Connection::open(path).map_err(DbError::Sqlite)?;
    let current = recorded_version(&live)?.unwrap_or(0);
    let target = schema::SCHEMA_VERSION;

    if current == target {
        return Ok(MigrationOutcome::AlreadyCurrent { version: current });
    }
    if current > target {
        return Err(DbError::DowngradeRefused {
            found: current,
            supported: target,
        });
    }
    if current < FIRST_SUPPORTED_VERSION {
        return Err(DbError::UnsupportedVersion(current));
    }

    // Hold the live database exclusively and fold its WAL into the main
    // file so the backup below captures one coherent image.
    live.pragma_update(None, "locking_mode", "exclusive")?;
    checkpoint(&live)?;

    let temp_path = sibling(path, ".migrated");
    let mut guard = TempCleanup::new(&temp_path);
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let _ = fs::remove_file(sibling(&temp_path, suffix));
    }

    let mut migrated = Connection::open(&temp_path)?;
    {
        let backup = Backup::new(&live, &mut migrated)?;
        backup.run_to_completion(512, Duration::from_millis(0), None)?;
    }

    let mut version = current;
    while version < target {
        let step = STEPS
            .iter()
            .find(|step| step.from == version)
            .ok_or(DbError::MissingMigration { from: version })?;
        info!(from = version, to = version + 1, "{}", step.description);

        let tx = migrated.transaction_with_behavior(TransactionBehavior::Immediate)?;
        (step.apply)(&tx)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.execute(
            "insert or ignore into schema(version) values(?1)",
            params![version + 1],
        )?;
        tx.commit()?;
        version += 1;
    }

    // Bring every current schema object into existence, then validate with
    // referential checks enabled.
    schema::apply_schema(&migrated)?;
    let verdict: String = migrated.query_row("pragma integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(DbError::IntegrityCheck(verdict));
    }
    checkpoint(&migrated)?;
    drop(migrated);
    drop(live);

    // Swap: originals aside first, then the clone into place. If the final
    // rename fails, put the originals back.
    let backup_base = sibling(path, ".backup");
    let mut moved = Vec::new();
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let from = sibling(path, suffix);
        if from.exists() {
            let to = sibling(&backup_base, suffix);
            fs::rename(&from, &to).map_err(|e| DbError::Io {
                context: format!("failed to move {} aside", from.display()),
                source: e,
            })?;
            moved.push((from, to));
        }
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        for (from, to) in moved {
            let _ = fs::rename(&to, &from);
        }
        return Err(DbError::Io {
            context: format!("failed to move migrated database into place at {}", path.display()),
            source: e,
        });
    }
    guard.disarm();

    debug!(from = current, to = target, "database migrated");
    Ok(MigrationOutcome::Migrated {
        from: current,
        to: target,
    })
}
