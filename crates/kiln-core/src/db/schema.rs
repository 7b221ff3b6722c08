//! Job database schema and open-time pragmas.
//!
//! `SCHEMA_VERSION` must be bumped every time `SCHEMA_DDL` changes, with a
//! matching step registered in [`crate::db::migrate`]. The DDL is written to
//! be idempotent so the migration tool can re-apply it to an already-current
//! database.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 10;

/// Current table and index shape. `runner_status` is nullable text: null
/// means the runner succeeded, anything else is its failure message.
pub const SCHEMA_DDL: &str = r#"
create table if not exists entropy(
  row_id integer primary key autoincrement,
  seed   integer not null);
-- a write, so read-only and busy databases fail here rather than mid-build
update entropy set seed=0 where 0;
create table if not exists schema(
  version integer primary key);
create table if not exists runs(
  run_id  integer primary key autoincrement,
  time    integer not null,
  cmdline text    not null);
create table if not exists files(
  file_id  integer primary key,
  path     text    not null,
  hash     text    not null,
  modified integer not null);
create unique index if not exists filenames on files(path);
create table if not exists stats(
  stat_id    integer primary key autoincrement,
  hashcode   integer not null, -- on collision, prefer largest stat_id (ie: newest)
  status     integer not null,
  runtime    real    not null,
  cputime    real    not null,
  membytes   integer not null,
  ibytes     integer not null,
  obytes     integer not null,
  pathtime   real);
create index if not exists stathash on stats(hashcode);
create table if not exists jobs(
  job_id      integer primary key autoincrement,
  run_id      integer not null references runs(run_id),
  use_id      integer not null references runs(run_id),
  label       text    not null,
  directory   text    not null,
  commandline blob    not null,
  environment blob    not null,
  stdin       text    not null, -- might point outside the workspace
  signature   integer not null,
  stack       blob    not null,
  stat_id     integer references stats(stat_id), -- null if unmerged
  starttime   integer not null default 0,
  endtime     integer not null default 0,
  keep        integer not null default 0,
  stale       integer not null default 0,
  is_atty     integer not null default 0,
  runner_status text); -- null=success, non-null=failure message
create index if not exists job on jobs(directory, commandline, environment, stdin, signature, keep, job_id, stat_id);
create index if not exists runner_status_idx on jobs(runner_status) where runner_status is not null;
create index if not exists jobstats on jobs(stat_id);
create table if not exists filetree(
  tree_id  integer primary key autoincrement,
  access   integer not null, -- 0=visible, 1=input, 2=output
  job_id   integer not null references jobs(job_id) on delete cascade,
  file_id  integer not null references files(file_id),
  unique(job_id, access, file_id) on conflict ignore);
create index if not exists filesearch on filetree(file_id, access, job_id);
create table if not exists log(
  log_id     integer primary key autoincrement,
  job_id     integer not null references jobs(job_id) on delete cascade,
  descriptor integer not null, -- 1=stdout, 2=stderr, 3=runner_out, 4=runner_err
  seconds    real    not null, -- seconds after job start
  output     text    not null);
create index if not exists logorder on log(job_id, descriptor, log_id);
create table if not exists tags(
  job_id  integer not null references jobs(job_id) on delete cascade,
  uri     text,
  content text,
  unique(job_id, uri) on conflict replace);
create table if not exists unhashed_files(
  unhashed_file_id integer primary key autoincrement,
  job_id integer not null references jobs(job_id) on delete cascade,
  path             text not null);
create index if not exists unhashed_outputs on unhashed_files(job_id);
"#;

/// Open-time pragmas. Row-returning pragmas go through `pragma_update`
/// rather than the DDL batch.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "auto_vacuum", 2)?; // incremental
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", 0)?;
    conn.pragma_update(None, "locking_mode", "normal")?;
    conn.busy_timeout(std::time::Duration::from_millis(30_000))?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    Ok(())
}

/// Pragmas plus the idempotent DDL.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    apply_pragmas(conn)?;
    conn.execute_batch(SCHEMA_DDL)
}
