//! The persistent job cache.
//!
//! One SQLite database per workspace records every job the build has ever
//! run: its identity (the cache key), the files it could see, did read, and
//! produced, its resource usage, its log output, and per-job metadata tags.
//! The reuse decision, output-overlap policing, and critical-path accounting
//! all live here.
//!
//! The handle owns a single connection. It is not internally synchronized;
//! a second thread needing database access opens its own connection for
//! reading or posts a message to the owning thread for writes.

use std::collections::{BTreeSet, HashSet};
use std::ffi::CString;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, warn};

pub mod migrate;
pub mod schema;
#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(
        "job database has schema version {found} but this binary expects {expected}; \
         run kiln-migrate to upgrade it"
    )]
    SchemaMismatch { found: i64, expected: i64 },
    #[error("job database version {found} is newer than the supported version {supported}")]
    DowngradeRefused { found: i64, supported: i64 },
    #[error("job database version {0} is too old to migrate (6 is the oldest supported)")]
    UnsupportedVersion(i64),
    #[error("no migration step registered for schema version {from}")]
    MissingMigration { from: i64 },
    #[error("migrated database failed its integrity check: {0}")]
    IntegrityCheck(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl DbError {
    fn is_busy(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
        )
    }
}

/// The three access classes a file can have with respect to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// The job was permitted to read it.
    Visible,
    /// The job actually read it.
    Input,
    /// The job produced it.
    Output,
}

impl AccessKind {
    fn as_i64(self) -> i64 {
        match self {
            Self::Visible => 0,
            Self::Input => 1,
            Self::Output => 2,
        }
    }
}

/// Log stream descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    RunnerOut,
    RunnerErr,
}

impl LogStream {
    fn as_i64(self) -> i64 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::RunnerOut => 3,
            Self::RunnerErr => 4,
        }
    }

    fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::RunnerOut),
            4 => Some(Self::RunnerErr),
            _ => None,
        }
    }
}

/// Observed (or predicted) execution cost of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub status: i64,
    pub runtime: f64,
    pub cputime: f64,
    pub membytes: i64,
    pub ibytes: i64,
    pub obytes: i64,
}

/// A prediction derived from the newest stats row for a hashcode.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub usage: Usage,
    pub pathtime: f64,
}

/// A (path, recorded content hash) pair from a job's file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReflection {
    pub path: String,
    pub hash: String,
}

/// A cache hit: the prior job and the outputs to rematerialize.
#[derive(Debug, Clone)]
pub struct ReusedJob {
    pub job_id: i64,
    pub usage: Usage,
    pub pathtime: f64,
    pub outputs: Vec<FileReflection>,
}

/// The identity columns that make up a job's cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKey {
    pub directory: String,
    pub commandline: Vec<u8>,
    pub environment: Vec<u8>,
    pub stdin_file: String,
    pub signature: u64,
    pub is_atty: bool,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: i64,
    pub time_ns: i64,
    pub cmdline: String,
}

/// `user` read a file that `used` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEdge {
    pub user: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDependency {
    pub writer: i64,
    pub reader: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTag {
    pub job_id: i64,
    pub uri: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Retry once per second while another process holds the database.
    pub wait: bool,
    /// Open an in-memory database (tests and dry runs).
    pub memory: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            wait: true,
            memory: false,
        }
    }
}

const SQL_FIND_PRIOR: &str = "select job_id, stat_id from jobs \
     where directory=?1 and commandline=?2 and environment=?3 and stdin=?4 \
     and signature=?5 and is_atty=?6 and keep=1 and stale=0";
const SQL_UPDATE_PRIOR: &str = "update jobs set use_id=?1 where job_id=?2";
const SQL_DELETE_PRIOR: &str = "delete from jobs where use_id<>?1 and job_id in \
     (select j2.job_id from jobs j1, jobs j2 \
      where j1.job_id=?2 and j1.directory=j2.directory and j1.commandline=j2.commandline \
      and j1.environment=j2.environment and j1.stdin=j2.stdin and j1.is_atty=j2.is_atty \
      and j2.job_id<>?2)";
const SQL_STATS_JOB: &str = "select status, runtime, cputime, membytes, ibytes, obytes, pathtime \
     from stats where stat_id=?1";
const SQL_PREDICT_JOB: &str = "select status, runtime, cputime, membytes, ibytes, obytes, pathtime \
     from stats where hashcode=?1 order by stat_id desc limit 1";
const SQL_INSERT_JOB: &str = "insert into jobs(run_id, use_id, label, directory, commandline, \
     environment, stdin, signature, stack, is_atty) \
     values(?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";
const SQL_INSERT_TREE: &str = "insert into filetree(access, job_id, file_id) \
     values(?1, ?2, (select file_id from files where path=?3))";
const SQL_GET_TREE: &str = "select f.path, f.hash from filetree t, files f \
     where t.job_id=?1 and t.access=?2 and f.file_id=t.file_id order by t.tree_id";
const SQL_ADD_STATS: &str = "insert into stats(hashcode, status, runtime, cputime, membytes, ibytes, obytes) \
     values(?1, ?2, ?3, ?4, ?5, ?6, ?7)";
const SQL_LINK_STATS: &str =
    "update jobs set stat_id=?1, starttime=?2, endtime=?3, keep=?4 where job_id=?5";
const SQL_DETECT_OVERLAP: &str = "select f.path from filetree t1, filetree t2, files f \
     where t1.job_id=?1 and t1.access=2 and t2.file_id=t1.file_id and t2.access=2 \
     and t2.job_id<>?1 and f.file_id=t1.file_id";
const SQL_DELETE_OVERLAP: &str = "delete from jobs where use_id<>?1 and job_id in \
     (select t2.job_id from filetree t1, filetree t2 \
      where t1.job_id=?2 and t1.access=2 and t2.file_id=t1.file_id and t2.access=2 \
      and t2.job_id<>?2)";
const SQL_WIPE_FILE: &str = "update jobs set stale=1 where job_id in \
     (select t.job_id from files f, filetree t \
      where f.path=?1 and f.hash<>?2 and t.file_id=f.file_id and t.access=1)";
const SQL_INSERT_FILE: &str = "insert or ignore into files(hash, modified, path) values(?1, ?2, ?3)";
const SQL_UPDATE_FILE: &str = "update files set hash=?1, modified=?2 where path=?3";
const SQL_FETCH_HASH: &str = "select hash from files where path=?1 and modified=?2";
const SQL_INSERT_LOG: &str =
    "insert into log(job_id, descriptor, seconds, output) values(?1, ?2, ?3, ?4)";
const SQL_GET_LOG: &str =
    "select output from log where job_id=?1 and descriptor=?2 order by log_id";
const SQL_INTERLEAVED_LOG: &str =
    "select output, descriptor from log where job_id=?1 order by seconds";
const SQL_TAG_JOB: &str = "insert into tags(job_id, uri, content) values(?1, ?2, ?3)";
const SQL_GET_TAGS: &str = "select job_id, uri, content from tags where job_id=?1";
const SQL_ALL_TAGS: &str = "select job_id, uri, content from tags";
const SQL_ALL_RUNS: &str = "select run_id, time, cmdline from runs order by time asc";
const SQL_DELETE_JOBS: &str = "delete from jobs where job_id in \
     (select job_id from jobs where keep=0 and use_id<>?1 \
      except select job_id from filetree where access=2)";
const SQL_DELETE_DUPS: &str = "delete from stats where stat_id in \
     (select stat_id from \
       (select hashcode, count(*) as num, max(stat_id) as keep from stats group by hashcode) d, \
       stats s \
      where d.num>1 and s.hashcode=d.hashcode and s.stat_id<>d.keep \
      except select stat_id from jobs)";
const SQL_DELETE_STATS: &str = "delete from stats where stat_id in \
     (select stat_id from stats \
      where stat_id not in (select stat_id from jobs) \
      order by stat_id desc limit 9999999 offset 4*(select count(*) from jobs))";
const SQL_REVTOP_ORDER: &str =
    "select job_id from jobs where use_id=(select max(run_id) from runs) order by job_id desc";
const SQL_SETCRIT_PATH: &str = "update stats set pathtime=runtime+( \
       select coalesce(max(s.pathtime),0) from filetree f1, filetree f2, jobs j, stats s \
       where f1.job_id=?1 and f1.access=2 and f1.file_id=f2.file_id and f2.access=1 \
       and f2.job_id=j.job_id and j.stat_id=s.stat_id \
     ) where stat_id=(select stat_id from jobs where job_id=?1)";
const SQL_JOB_EDGES: &str = "select distinct user.job_id as user, used.job_id as used \
     from filetree user, filetree used \
     where user.access=1 and user.file_id=used.file_id and used.access=2";
const SQL_FILE_DEPENDENCIES: &str = "select l.job_id, r.job_id from filetree l \
     inner join filetree r on l.file_id = r.file_id \
     where l.access = 2 and r.access = 0";
const SQL_GET_OUTPUT_FILES: &str = "select f.path \
     from filetree ft join files f on f.file_id=ft.file_id join jobs j on ft.job_id=j.job_id \
     where ft.access = 2 \
     and substr(cast(j.commandline as varchar), 1, 8) != '<source>' \
     and substr(cast(j.commandline as varchar), 1, 7) != '<claim>'";
const SQL_REMOVE_OUTPUT_FILES: &str = "delete from files where file_id in ( \
       select f.file_id \
       from filetree ft join files f on f.file_id=ft.file_id join jobs j on ft.job_id=j.job_id \
       where ft.access = 2 \
       and substr(cast(j.commandline as varchar), 1, 8) != '<source>' \
       and substr(cast(j.commandline as varchar), 1, 7) != '<claim>')";
const SQL_REMOVE_ALL_JOBS: &str = "delete from jobs";
const SQL_UNHASHED_PATHS: &str = "select path from unhashed_files";
const SQL_INSERT_UNHASHED: &str = "insert into unhashed_files(job_id, path) values(?1, ?2)";
const SQL_SET_RUNNER_STATUS: &str = "update jobs set runner_status=?1 where job_id=?2";
const SQL_GET_RUNNER_STATUS: &str = "select runner_status from jobs where job_id=?1";

/// faccessat(R_OK, AT_SYMLINK_NOFOLLOW): does the recorded output still
/// exist, without following a dangling symlink to decide.
fn output_readable(path: &str) -> bool {
    let Ok(c_path) = CString::new(path) else {
        return false;
    };
    let rc = unsafe {
        libc::faccessat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            libc::R_OK,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    rc == 0
}

fn tree_rows(
    conn: &Connection,
    access: AccessKind,
    job_id: i64,
) -> rusqlite::Result<Vec<FileReflection>> {
    let mut stmt = conn.prepare_cached(SQL_GET_TREE)?;
    let rows = stmt.query_map(params![job_id, access.as_i64()], |row| {
        Ok(FileReflection {
            path: row.get(0)?,
            hash: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn usage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Usage, f64)> {
    Ok((
        Usage {
            status: row.get(0)?,
            runtime: row.get(1)?,
            cputime: row.get(2)?,
            membytes: row.get(3)?,
            ibytes: row.get(4)?,
            obytes: row.get(5)?,
        },
        row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
    ))
}

/// Owner of the workspace job database.
#[derive(Debug)]
pub struct JobCacheDb {
    conn: Connection,
    run_id: i64,
}

impl JobCacheDb {
    /// Open the database, creating and stamping it when absent.
    ///
    /// A database written by a different schema version is refused with
    /// [`DbError::SchemaMismatch`]; the migration tool is the remedy. With
    /// `wait`, a database locked by another process is retried once per
    /// second instead of failing.
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self, DbError> {
        let mut waited = false;
        loop {
            match Self::try_open(path, options.memory) {
                Ok(db) => {
                    if waited {
                        debug!("job database became available");
                    }
                    return Ok(db);
                }
                Err(err) if err.is_busy() && options.wait => {
                    if !waited {
                        warn!(db = %path.display(), "job database is busy; waiting");
                        waited = true;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_open(path: &Path, memory: bool) -> Result<Self, DbError> {
        let conn = if memory {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        schema::apply_pragmas(&conn)?;

        // Version-check before touching the shape of an existing database.
        if let Some(found) = migrate::recorded_version(&conn)? {
            if found != schema::SCHEMA_VERSION {
                return Err(DbError::SchemaMismatch {
                    found,
                    expected: schema::SCHEMA_VERSION,
                });
            }
        }

        conn.execute_batch(schema::SCHEMA_DDL)?;
        conn.execute(
            "insert or ignore into schema(version) values(?1)",
            params![schema::SCHEMA_VERSION],
        )?;
        conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
        Ok(Self { conn, run_id: 0 })
    }

    /// The run id allocated by [`prepare_run`](Self::prepare_run).
    #[must_use]
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Record this invocation in `runs` and scope all later "last build"
    /// queries to it.
    pub fn prepare_run(&mut self, cmdline: &str) -> Result<i64, DbError> {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.conn
            .prepare_cached("insert into runs(time, cmdline) values(?1, ?2)")?
            .execute(params![now_ns, cmdline])?;
        self.run_id = self.conn.last_insert_rowid();
        Ok(self.run_id)
    }

    /// Read up to `key.len()` persisted seeds; any missing slots keep the
    /// caller's fresh draws and are persisted for the next run. Used to
    /// domain-separate the in-memory scheduling hash from public hashes.
    pub fn entropy(&mut self, key: &mut [u64]) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        let mut persisted = 0usize;
        {
            let mut stmt = tx.prepare_cached("select seed from entropy order by row_id")?;
            let mut rows = stmt.query([])?;
            while persisted < key.len() {
                let Some(row) = rows.next()? else { break };
                key[persisted] = row.get::<_, i64>(0)? as u64;
                persisted += 1;
            }
        }
        {
            let mut insert = tx.prepare_cached("insert into entropy(seed) values(?1)")?;
            for word in &key[persisted..] {
                insert.execute(params![*word as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Answer "does this job have a reusable prior result?".
    ///
    /// A hit requires a surviving row with the same identity (`keep=1`,
    /// `stale=0`), a linked stats row, every recorded input still within the
    /// caller's visible set, and every recorded output still readable on
    /// disk. Unless `check` is set, a hit also advances the job's `use_id`
    /// to the current run, in the same transaction as the lookup, so the
    /// later `delete_prior` pass sees it as current.
    ///
    /// Calling this twice with the same arguments returns the same output
    /// list; the `use_id` bump is the only side effect and does not affect
    /// the lookup.
    pub fn reuse_job(
        &mut self,
        key: &JobKey,
        visible: &[String],
        check: bool,
    ) -> Result<Option<ReusedJob>, DbError> {
        let run_id = self.run_id;
        let tx = self.conn.transaction()?;

        let prior = tx
            .prepare_cached(SQL_FIND_PRIOR)?
            .query_row(
                params![
                    key.directory,
                    key.commandline,
                    key.environment,
                    key.stdin_file,
                    key.signature as i64,
                    key.is_atty as i64,
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        let Some((job_id, stat_id)) = prior else {
            tx.commit()?;
            return Ok(None);
        };
        let Some(stat_id) = stat_id else {
            tx.commit()?;
            return Ok(None);
        };

        let stats = tx
            .prepare_cached(SQL_STATS_JOB)?
            .query_row(params![stat_id], usage_from_row)
            .optional()?;
        let Some((usage, pathtime)) = stats else {
            tx.commit()?;
            return Ok(None);
        };

        let mut found = true;
        let visible_set: HashSet<&str> = visible.iter().map(String::as_str).collect();
        for input in tree_rows(&tx, AccessKind::Input, job_id)? {
            if !visible_set.contains(input.path.as_str()) {
                found = false;
            }
        }

        let outputs = tree_rows(&tx, AccessKind::Output, job_id)?;
        for output in &outputs {
            if !output_readable(&output.path) {
                found = false;
            }
        }

        if !found {
            tx.commit()?;
            return Ok(None);
        }

        if !check {
            tx.prepare_cached(SQL_UPDATE_PRIOR)?
                .execute(params![run_id, job_id])?;
        }
        tx.commit()?;

        Ok(Some(ReusedJob {
            job_id,
            usage,
            pathtime,
            outputs,
        }))
    }

    /// Newest recorded stats for a job hashcode; the scheduler orders ready
    /// jobs by the predicted critical-path contribution.
    pub fn predict_job(&self, hashcode: u64) -> Result<Option<Prediction>, DbError> {
        let row = self
            .conn
            .prepare_cached(SQL_PREDICT_JOB)?
            .query_row(params![hashcode as i64], usage_from_row)
            .optional()?;
        Ok(row.map(|(usage, pathtime)| Prediction { usage, pathtime }))
    }

    /// Insert a fresh job row along with its visible file set.
    ///
    /// Every visible path must already be present in `files` (recorded via
    /// [`add_hash`](Self::add_hash)).
    pub fn insert_job(
        &mut self,
        key: &JobKey,
        label: &str,
        stack: &str,
        visible: &[String],
    ) -> Result<i64, DbError> {
        let run_id = self.run_id;
        let tx = self.conn.transaction()?;
        tx.prepare_cached(SQL_INSERT_JOB)?.execute(params![
            run_id,
            label,
            key.directory,
            key.commandline,
            key.environment,
            key.stdin_file,
            key.signature as i64,
            stack.as_bytes(),
            key.is_atty as i64,
        ])?;
        let job_id = tx.last_insert_rowid();
        {
            let mut insert_tree = tx.prepare_cached(SQL_INSERT_TREE)?;
            for path in visible {
                insert_tree.execute(params![AccessKind::Visible.as_i64(), job_id, path])?;
            }
        }
        tx.commit()?;
        Ok(job_id)
    }

    /// Commit a completed job: stats, input/output trees, unhashed outputs,
    /// and the supersession passes.
    ///
    /// Inputs outside the job's visible set mean the job escaped its
    /// sandbox; they are reported and skipped but the commit proceeds.
    /// `delete_prior` then drops older rows with this identity and
    /// `delete_overlap` drops stale producers of these outputs. If another
    /// *surviving* job still claims one of these outputs, the process is
    /// aborted: two live producers of one file is an upstream logic bug that
    /// must not be cached around.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_job(
        &mut self,
        job_id: i64,
        inputs: &[String],
        outputs: &[String],
        all_outputs: &[String],
        starttime: i64,
        endtime: i64,
        hashcode: u64,
        keep: bool,
        usage: &Usage,
    ) -> Result<(), DbError> {
        let run_id = self.run_id;
        let output_set: BTreeSet<&str> = outputs.iter().map(String::as_str).collect();
        let unhashed: Vec<&str> = all_outputs
            .iter()
            .map(String::as_str)
            .filter(|path| !output_set.contains(path))
            .collect();

        let mut overlap = Vec::new();
        let tx = self.conn.transaction()?;

        tx.prepare_cached(SQL_ADD_STATS)?.execute(params![
            hashcode as i64,
            usage.status,
            usage.runtime,
            usage.cputime,
            usage.membytes,
            usage.ibytes,
            usage.obytes,
        ])?;
        let stat_id = tx.last_insert_rowid();
        tx.prepare_cached(SQL_LINK_STATS)?.execute(params![
            stat_id,
            starttime,
            endtime,
            keep as i64,
            job_id,
        ])?;

        let visible: HashSet<String> = tree_rows(&tx, AccessKind::Visible, job_id)?
            .into_iter()
            .map(|file| file.path)
            .collect();
        {
            let mut insert_tree = tx.prepare_cached(SQL_INSERT_TREE)?;
            for input in inputs {
                if !visible.contains(input) {
                    error!(job_id, input = %input, "job read a file that was not visible to it");
                } else {
                    insert_tree.execute(params![AccessKind::Input.as_i64(), job_id, input])?;
                }
            }
            for output in &output_set {
                insert_tree.execute(params![AccessKind::Output.as_i64(), job_id, output])?;
            }
            let mut insert_unhashed = tx.prepare_cached(SQL_INSERT_UNHASHED)?;
            for path in &unhashed {
                insert_unhashed.execute(params![job_id, path])?;
            }
        }

        tx.prepare_cached(SQL_DELETE_PRIOR)?
            .execute(params![run_id, job_id])?;
        tx.prepare_cached(SQL_DELETE_OVERLAP)?
            .execute(params![run_id, job_id])?;
        {
            let mut stmt = tx.prepare_cached(SQL_DETECT_OVERLAP)?;
            let rows = stmt.query_map(params![job_id], |row| row.get::<_, String>(0))?;
            for path in rows {
                overlap.push(path?);
            }
        }
        tx.commit()?;

        if !overlap.is_empty() {
            for path in &overlap {
                error!(%path, "file output by multiple jobs");
            }
            std::process::exit(1);
        }
        Ok(())
    }

    /// Record a file's content hash at a modification time. Jobs whose
    /// recorded *input* hash for this path no longer matches are marked
    /// stale first, forcing them to re-execute.
    pub fn add_hash(&mut self, path: &str, hash: &str, modified: i64) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(SQL_WIPE_FILE)?.execute(params![path, hash])?;
        tx.prepare_cached(SQL_UPDATE_FILE)?
            .execute(params![hash, modified, path])?;
        tx.prepare_cached(SQL_INSERT_FILE)?
            .execute(params![hash, modified, path])?;
        tx.commit()?;
        Ok(())
    }

    /// The recorded hash for a path at exactly this modification time.
    pub fn get_hash(&self, path: &str, modified: i64) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .prepare_cached(SQL_FETCH_HASH)?
            .query_row(params![path, modified], |row| row.get(0))
            .optional()?)
    }

    /// The (path, hash) pairs of one access class of a job.
    pub fn get_tree(&self, access: AccessKind, job_id: i64) -> Result<Vec<FileReflection>, DbError> {
        Ok(tree_rows(&self.conn, access, job_id)?)
    }

    /// Append a chunk of job output.
    pub fn save_output(
        &self,
        job_id: i64,
        stream: LogStream,
        seconds: f64,
        output: &str,
    ) -> Result<(), DbError> {
        self.conn
            .prepare_cached(SQL_INSERT_LOG)?
            .execute(params![job_id, stream.as_i64(), seconds, output])?;
        Ok(())
    }

    /// One stream's output, concatenated in insertion order.
    pub fn get_output(&self, job_id: i64, stream: LogStream) -> Result<String, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_GET_LOG)?;
        let rows = stmt.query_map(params![job_id, stream.as_i64()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = String::new();
        for chunk in rows {
            out.push_str(&chunk?);
        }
        Ok(out)
    }

    /// All streams of a job interleaved by time, for replaying a cached
    /// job's console exactly as it originally appeared.
    pub fn interleaved_output(&self, job_id: i64) -> Result<Vec<(String, LogStream)>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_INTERLEAVED_LOG)?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (chunk, descriptor) = row?;
            if let Some(stream) = LogStream::from_i64(descriptor) {
                out.push((chunk, stream));
            }
        }
        Ok(out)
    }

    /// Attach structured metadata to a job; a second tag with the same uri
    /// replaces the first.
    pub fn tag_job(&self, job_id: i64, uri: &str, content: &str) -> Result<(), DbError> {
        self.conn
            .prepare_cached(SQL_TAG_JOB)?
            .execute(params![job_id, uri, content])?;
        Ok(())
    }

    pub fn get_tags(&self, job_id: i64) -> Result<Vec<JobTag>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_GET_TAGS)?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(JobTag {
                job_id: row.get(0)?,
                uri: row.get(1)?,
                content: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn all_tags(&self) -> Result<Vec<JobTag>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_ALL_TAGS)?;
        let rows = stmt.query_map([], |row| {
            Ok(JobTag {
                job_id: row.get(0)?,
                uri: row.get(1)?,
                content: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Record a runner failure message, or `None` for success.
    pub fn set_runner_status(&self, job_id: i64, status: Option<&str>) -> Result<(), DbError> {
        self.conn
            .prepare_cached(SQL_SET_RUNNER_STATUS)?
            .execute(params![status, job_id])?;
        Ok(())
    }

    pub fn runner_status(&self, job_id: i64) -> Result<Option<String>, DbError> {
        let status = self
            .conn
            .prepare_cached(SQL_GET_RUNNER_STATUS)?
            .query_row(params![job_id], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(status.flatten())
    }

    /// End-of-build housekeeping.
    ///
    /// Walks the last run's jobs in reverse-topological order (descending
    /// job id; ids are allocated in creation order) filling in each stats
    /// row's `pathtime` as its own runtime plus the longest pathtime among
    /// its inputs' producers. Then drops `keep=0` jobs that produced
    /// nothing, deduplicates stats rows per hashcode, bounds the orphan
    /// stats table to four rows per job, and gives pages back to the
    /// filesystem.
    pub fn clean(&mut self) -> Result<(), DbError> {
        let run_id = self.run_id;
        let tx = self.conn.transaction()?;
        let job_ids: Vec<i64> = {
            let mut stmt = tx.prepare_cached(SQL_REVTOP_ORDER)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        {
            let mut setcrit = tx.prepare_cached(SQL_SETCRIT_PATH)?;
            for job_id in job_ids {
                setcrit.execute(params![job_id])?;
            }
        }
        tx.commit()?;

        self.conn
            .prepare_cached(SQL_DELETE_JOBS)?
            .execute(params![run_id])?;
        self.conn.prepare_cached(SQL_DELETE_DUPS)?.execute([])?;
        self.conn.prepare_cached(SQL_DELETE_STATS)?.execute([])?;
        self.conn.execute_batch("pragma incremental_vacuum;")?;
        Ok(())
    }

    /// Forget every job, returning the produced paths (hashed and unhashed)
    /// so the host can unlink them from the workspace.
    pub fn clear_jobs(&mut self) -> Result<Vec<String>, DbError> {
        let tx = self.conn.transaction()?;
        let mut paths = Vec::new();
        {
            let mut stmt = tx.prepare_cached(SQL_GET_OUTPUT_FILES)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for path in rows {
                paths.push(path?);
            }
            let mut stmt = tx.prepare_cached(SQL_UNHASHED_PATHS)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for path in rows {
                paths.push(path?);
            }
        }
        tx.prepare_cached(SQL_REMOVE_ALL_JOBS)?.execute([])?;
        tx.prepare_cached(SQL_REMOVE_OUTPUT_FILES)?.execute([])?;
        tx.commit()?;
        Ok(paths)
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_ALL_RUNS)?;
        let rows = stmt.query_map([], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                time_ns: row.get(1)?,
                cmdline: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Which jobs read which jobs' outputs.
    pub fn job_edges(&self) -> Result<Vec<JobEdge>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_JOB_EDGES)?;
        let rows = stmt.query_map([], |row| {
            Ok(JobEdge {
                user: row.get(0)?,
                used: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Producer → potential-consumer pairs (output joined against visible).
    pub fn file_dependencies(&self) -> Result<Vec<FileDependency>, DbError> {
        let mut stmt = self.conn.prepare_cached(SQL_FILE_DEPENDENCIES)?;
        let rows = stmt.query_map([], |row| {
            Ok(FileDependency {
                writer: row.get(0)?,
                reader: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
