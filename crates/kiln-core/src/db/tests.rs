use super::migrate::{migrate_database, MigrationOutcome};
use super::*;
use anyhow::Result;
use rusqlite::params;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn mem_db() -> Result<JobCacheDb> {
    Ok(JobCacheDb::open(
        Path::new(":memory:"),
        &OpenOptions {
            wait: false,
            memory: true,
        },
    )?)
}

fn file_db(path: &Path) -> std::result::Result<JobCacheDb, DbError> {
    JobCacheDb::open(
        path,
        &OpenOptions {
            wait: false,
            memory: false,
        },
    )
}

fn sample_key(directory: &str, commandline: &[u8]) -> JobKey {
    JobKey {
        directory: directory.to_string(),
        commandline: commandline.to_vec(),
        environment: b"PATH=/usr/bin\0".to_vec(),
        stdin_file: String::new(),
        signature: 0xfeed_beef_dead_cafe,
        is_atty: false,
    }
}

fn sample_usage(runtime: f64) -> Usage {
    Usage {
        status: 0,
        runtime,
        cputime: runtime,
        membytes: 1 << 20,
        ibytes: 4096,
        obytes: 8192,
    }
}

/// Record a job that read `inputs` and wrote `outputs`, with every path
/// already hashed into the files table.
#[allow(clippy::too_many_arguments)]
fn run_job(
    db: &mut JobCacheDb,
    key: &JobKey,
    visible: &[String],
    inputs: &[String],
    outputs: &[String],
    runtime: f64,
    keep: bool,
) -> Result<i64> {
    let job = db.insert_job(key, "label", "stack", visible)?;
    for path in outputs {
        db.add_hash(path, &format!("hash-of-{path}"), 1000)?;
    }
    db.finish_job(
        job,
        inputs,
        outputs,
        outputs,
        10,
        20,
        key.signature,
        keep,
        &sample_usage(runtime),
    )?;
    Ok(job)
}

#[test]
fn open_stamps_a_fresh_database() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");
    let db = file_db(&path)?;
    drop(db);

    let conn = rusqlite::Connection::open(&path)?;
    let user_version: i64 = conn.query_row("pragma user_version", [], |r| r.get(0))?;
    assert_eq!(user_version, schema::SCHEMA_VERSION);
    let stamped: i64 = conn.query_row("select max(version) from schema", [], |r| r.get(0))?;
    assert_eq!(stamped, schema::SCHEMA_VERSION);

    // And it reopens cleanly.
    let _db = file_db(&path)?;
    Ok(())
}

#[test]
fn open_refuses_other_schema_versions() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");
    {
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch(
            "create table schema(version integer primary key); \
             insert into schema(version) values(8);",
        )?;
    }
    match file_db(&path) {
        Err(DbError::SchemaMismatch { found, expected }) => {
            assert_eq!(found, 8);
            assert_eq!(expected, schema::SCHEMA_VERSION);
        }
        other => panic!("expected schema mismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn entropy_seeds_persist_across_opens() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");

    let first: Vec<u64> = (0..4).map(|_| rand::random()).collect();
    {
        let mut db = file_db(&path)?;
        let mut key = first.clone();
        db.entropy(&mut key)?;
        assert_eq!(key, first, "fresh draws should be kept verbatim");
    }
    {
        let mut db = file_db(&path)?;
        let mut key: Vec<u64> = (0..4).map(|_| rand::random()).collect();
        db.entropy(&mut key)?;
        assert_eq!(key, first, "persisted seeds should override fresh draws");
    }
    Ok(())
}

#[test]
fn prepare_run_allocates_increasing_ids() -> Result<()> {
    let mut db = mem_db()?;
    let first = db.prepare_run("kiln build all")?;
    let second = db.prepare_run("kiln build all")?;
    assert!(second > first);
    assert_eq!(db.run_id(), second);

    let runs = db.runs()?;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].cmdline, "kiln build all");
    assert!(runs[0].time_ns > 0);
    Ok(())
}

#[test]
fn reuse_misses_on_an_empty_database() -> Result<()> {
    let mut db = mem_db()?;
    db.prepare_run("build")?;
    let key = sample_key("/ws", b"cc -c main.c\0");
    assert!(db.reuse_job(&key, &[], false)?.is_none());
    Ok(())
}

#[test]
fn finished_jobs_are_reusable_and_reuse_is_idempotent() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let input = temp.path().join("src/main.c").display().to_string();
    let output = temp.path().join("out/main.o").display().to_string();
    fs::create_dir_all(temp.path().join("src"))?;
    fs::create_dir_all(temp.path().join("out"))?;
    fs::write(&input, b"int main(){}")?;
    fs::write(&output, b"ELF")?;

    let key = sample_key("/ws", b"cc -c main.c\0");
    let visible = vec![input.clone()];
    db.add_hash(&input, "input-hash", 100)?;
    let job = run_job(&mut db, &key, &visible, &[input.clone()], &[output.clone()], 2.5, true)?;

    let first = db.reuse_job(&key, &visible, false)?.expect("cache hit");
    assert_eq!(first.job_id, job);
    assert_eq!(first.usage.runtime, 2.5);
    assert_eq!(first.outputs.len(), 1);
    assert_eq!(first.outputs[0].path, output);
    assert_eq!(first.outputs[0].hash, format!("hash-of-{output}"));

    // A second call observes the same file list.
    let second = db.reuse_job(&key, &visible, false)?.expect("cache hit");
    assert_eq!(second.outputs, first.outputs);

    // The hit advanced use_id to the current run.
    let use_id: i64 = db.conn.query_row(
        "select use_id from jobs where job_id=?1",
        params![job],
        |r| r.get(0),
    )?;
    assert_eq!(use_id, db.run_id());
    Ok(())
}

#[test]
fn reuse_requires_inputs_to_be_visible() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let input = temp.path().join("a.h").display().to_string();
    let output = temp.path().join("a.o").display().to_string();
    fs::write(&input, b"#pragma once")?;
    fs::write(&output, b"obj")?;

    let key = sample_key("/ws", b"cc -c a.c\0");
    let visible = vec![input.clone()];
    db.add_hash(&input, "h", 1)?;
    run_job(&mut db, &key, &visible, &[input.clone()], &[output], 1.0, true)?;

    assert!(db.reuse_job(&key, &visible, false)?.is_some());
    // The same job with a narrower visible set must re-execute.
    assert!(db.reuse_job(&key, &[], false)?.is_none());
    Ok(())
}

#[test]
fn reuse_requires_outputs_to_exist_on_disk() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let output = temp.path().join("gone.o").display().to_string();
    fs::write(&output, b"obj")?;

    let key = sample_key("/ws", b"link gone\0");
    run_job(&mut db, &key, &[], &[], &[output.clone()], 1.0, true)?;
    assert!(db.reuse_job(&key, &[], false)?.is_some());

    fs::remove_file(&output)?;
    assert!(
        db.reuse_job(&key, &[], false)?.is_none(),
        "a deleted output must demote the hit"
    );
    Ok(())
}

#[test]
fn check_mode_does_not_claim_the_job() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    let first_run = db.prepare_run("build")?;

    let output = temp.path().join("x.o").display().to_string();
    fs::write(&output, b"obj")?;
    let key = sample_key("/ws", b"cc x\0");
    let job = run_job(&mut db, &key, &[], &[], &[output], 1.0, true)?;

    db.prepare_run("build again")?;
    assert!(db.reuse_job(&key, &[], true)?.is_some());
    let use_id: i64 = db.conn.query_row(
        "select use_id from jobs where job_id=?1",
        params![job],
        |r| r.get(0),
    )?;
    assert_eq!(use_id, first_run, "check mode must not bump use_id");
    Ok(())
}

#[test]
fn changed_input_hashes_mark_jobs_stale() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let input = temp.path().join("lib.c").display().to_string();
    let output = temp.path().join("lib.o").display().to_string();
    fs::write(&input, b"v1")?;
    fs::write(&output, b"obj")?;

    let key = sample_key("/ws", b"cc lib\0");
    let visible = vec![input.clone()];
    db.add_hash(&input, "v1-hash", 1)?;
    run_job(&mut db, &key, &visible, &[input.clone()], &[output], 1.0, true)?;
    assert!(db.reuse_job(&key, &visible, false)?.is_some());

    // The file changed on disk; its re-hash invalidates dependent jobs.
    db.add_hash(&input, "v2-hash", 2)?;
    assert!(db.reuse_job(&key, &visible, false)?.is_none());
    Ok(())
}

#[test]
fn newer_identical_jobs_supersede_prior_rows() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("first build")?;

    let output = temp.path().join("app").display().to_string();
    fs::write(&output, b"bin")?;
    let key = sample_key("/ws", b"link app\0");
    let old_job = run_job(&mut db, &key, &[], &[], &[output.clone()], 1.0, true)?;

    db.prepare_run("second build")?;
    let new_job = run_job(&mut db, &key, &[], &[], &[output.clone()], 2.0, true)?;
    assert_ne!(old_job, new_job);

    let survivors: i64 = db
        .conn
        .query_row("select count(*) from jobs", [], |r| r.get(0))?;
    assert_eq!(survivors, 1, "delete_prior should drop the old row");

    let hit = db.reuse_job(&key, &[], false)?.expect("cache hit");
    assert_eq!(hit.job_id, new_job);
    Ok(())
}

#[test]
fn overlapping_outputs_evict_the_stale_producer() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("first build")?;

    let output = temp.path().join("shared.o").display().to_string();
    fs::write(&output, b"obj")?;

    let old_key = sample_key("/ws", b"old producer\0");
    let old_job = run_job(&mut db, &old_key, &[], &[], &[output.clone()], 1.0, true)?;

    db.prepare_run("second build")?;
    let new_key = sample_key("/ws", b"new producer\0");
    run_job(&mut db, &new_key, &[], &[], &[output.clone()], 1.0, true)?;

    let old_still_there: i64 = db.conn.query_row(
        "select count(*) from jobs where job_id=?1",
        params![old_job],
        |r| r.get(0),
    )?;
    assert_eq!(old_still_there, 0, "delete_overlap should drop the old producer");
    assert!(db.reuse_job(&old_key, &[], false)?.is_none());
    assert!(db.reuse_job(&new_key, &[], false)?.is_some());
    Ok(())
}

#[test]
fn predictions_prefer_the_newest_stats_row() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let hashcode = 0x1234_5678_9abc_def0u64;
    for (i, runtime) in [(0, 1.0), (1, 9.0)] {
        let output = temp.path().join(format!("o{i}")).display().to_string();
        fs::write(&output, b"x")?;
        let mut key = sample_key("/ws", format!("cmd {i}\0").as_bytes());
        key.signature = hashcode;
        run_job(&mut db, &key, &[], &[], &[output], runtime, true)?;
    }

    let prediction = db.predict_job(hashcode)?.expect("prediction");
    assert_eq!(prediction.usage.runtime, 9.0);
    assert!(db.predict_job(0)?.is_none());
    Ok(())
}

#[test]
fn log_streams_roundtrip_and_interleave() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;
    let output = temp.path().join("o").display().to_string();
    fs::write(&output, b"x")?;
    let key = sample_key("/ws", b"noisy\0");
    let job = run_job(&mut db, &key, &[], &[], &[output], 1.0, true)?;

    db.save_output(job, LogStream::Stdout, 0.1, "hello ")?;
    db.save_output(job, LogStream::Stderr, 0.2, "oops\n")?;
    db.save_output(job, LogStream::Stdout, 0.3, "world\n")?;
    db.save_output(job, LogStream::RunnerErr, 0.4, "runner said no\n")?;

    assert_eq!(db.get_output(job, LogStream::Stdout)?, "hello world\n");
    assert_eq!(db.get_output(job, LogStream::Stderr)?, "oops\n");
    assert_eq!(db.get_output(job, LogStream::RunnerOut)?, "");

    let interleaved = db.interleaved_output(job)?;
    assert_eq!(
        interleaved,
        vec![
            ("hello ".to_string(), LogStream::Stdout),
            ("oops\n".to_string(), LogStream::Stderr),
            ("world\n".to_string(), LogStream::Stdout),
            ("runner said no\n".to_string(), LogStream::RunnerErr),
        ]
    );
    Ok(())
}

#[test]
fn tags_replace_on_the_same_uri() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;
    let output = temp.path().join("o").display().to_string();
    fs::write(&output, b"x")?;
    let key = sample_key("/ws", b"tagged\0");
    let job = run_job(&mut db, &key, &[], &[], &[output], 1.0, true)?;

    db.tag_job(job, "inspect://coverage", "71%")?;
    db.tag_job(job, "inspect://coverage", "82%")?;
    db.tag_job(job, "inspect://warnings", "3")?;

    let mut tags = db.get_tags(job)?;
    tags.sort_by(|a, b| a.uri.cmp(&b.uri));
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].content, "82%");
    assert_eq!(db.all_tags()?.len(), 2);
    Ok(())
}

#[test]
fn runner_status_is_null_until_a_failure_is_recorded() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;
    let output = temp.path().join("o").display().to_string();
    fs::write(&output, b"x")?;
    let key = sample_key("/ws", b"flaky\0");
    let job = run_job(&mut db, &key, &[], &[], &[output], 1.0, true)?;

    assert_eq!(db.runner_status(job)?, None);
    db.set_runner_status(job, Some("sandbox setup failed"))?;
    assert_eq!(db.runner_status(job)?.as_deref(), Some("sandbox setup failed"));
    db.set_runner_status(job, None)?;
    assert_eq!(db.runner_status(job)?, None);
    Ok(())
}

#[test]
fn unhashed_outputs_are_recorded_separately() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let tracked = temp.path().join("result.o").display().to_string();
    let scratch = temp.path().join("scratch.tmp").display().to_string();
    fs::write(&tracked, b"obj")?;

    let key = sample_key("/ws", b"messy job\0");
    let job = db.insert_job(&key, "label", "stack", &[])?;
    db.add_hash(&tracked, "h", 1)?;
    db.finish_job(
        job,
        &[],
        &[tracked.clone()],
        &[tracked.clone(), scratch.clone()],
        0,
        1,
        key.signature,
        true,
        &sample_usage(1.0),
    )?;

    let unhashed: Vec<String> = {
        let mut stmt = db.conn.prepare("select path from unhashed_files")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    assert_eq!(unhashed, vec![scratch]);
    Ok(())
}

#[test]
fn clean_fills_pathtime_toward_the_build_end() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let mid = temp.path().join("mid.o").display().to_string();
    let fin = temp.path().join("final").display().to_string();
    fs::write(&mid, b"obj")?;
    fs::write(&fin, b"bin")?;

    // producer (runtime 2) -> consumer (runtime 3)
    let producer_key = sample_key("/ws", b"produce mid\0");
    let producer = run_job(&mut db, &producer_key, &[], &[], &[mid.clone()], 2.0, true)?;

    let consumer_key = sample_key("/ws", b"consume mid\0");
    let visible = vec![mid.clone()];
    let consumer = run_job(&mut db, &consumer_key, &visible, &[mid.clone()], &[fin], 3.0, true)?;

    db.clean()?;

    let pathtime_of = |job: i64| -> Result<f64> {
        Ok(db.conn.query_row(
            "select s.pathtime from stats s, jobs j where j.job_id=?1 and j.stat_id=s.stat_id",
            params![job],
            |r| r.get(0),
        )?)
    };
    // The consumer ends the build: pathtime is its own runtime. The
    // producer's remaining-work chain runs through the consumer.
    assert_eq!(pathtime_of(consumer)?, 3.0);
    assert_eq!(pathtime_of(producer)?, 5.0);
    Ok(())
}

#[test]
fn clean_drops_unkept_jobs_from_prior_runs() -> Result<()> {
    let mut db = mem_db()?;
    db.prepare_run("first")?;
    let key = sample_key("/ws", b"ephemeral\0");
    let job = db.insert_job(&key, "label", "stack", &[])?;
    db.finish_job(job, &[], &[], &[], 0, 1, key.signature, false, &sample_usage(1.0))?;

    db.prepare_run("second")?;
    db.clean()?;

    let remaining: i64 = db
        .conn
        .query_row("select count(*) from jobs", [], |r| r.get(0))?;
    assert_eq!(remaining, 0);
    Ok(())
}

#[test]
fn clear_jobs_returns_every_produced_path() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let tracked = temp.path().join("a.o").display().to_string();
    let scratch = temp.path().join("b.tmp").display().to_string();
    fs::write(&tracked, b"obj")?;

    let key = sample_key("/ws", b"job\0");
    let job = db.insert_job(&key, "label", "stack", &[])?;
    db.add_hash(&tracked, "h", 1)?;
    db.finish_job(
        job,
        &[],
        &[tracked.clone()],
        &[tracked.clone(), scratch.clone()],
        0,
        1,
        key.signature,
        true,
        &sample_usage(1.0),
    )?;

    let mut paths = db.clear_jobs()?;
    paths.sort();
    let mut expected = vec![tracked, scratch];
    expected.sort();
    assert_eq!(paths, expected);

    let remaining: i64 = db
        .conn
        .query_row("select count(*) from jobs", [], |r| r.get(0))?;
    assert_eq!(remaining, 0);
    Ok(())
}

#[test]
fn job_edges_and_file_dependencies_reflect_the_tree() -> Result<()> {
    let temp = tempdir()?;
    let mut db = mem_db()?;
    db.prepare_run("build")?;

    let mid = temp.path().join("mid.o").display().to_string();
    let fin = temp.path().join("final").display().to_string();
    fs::write(&mid, b"obj")?;
    fs::write(&fin, b"bin")?;

    let producer_key = sample_key("/ws", b"produce\0");
    let producer = run_job(&mut db, &producer_key, &[], &[], &[mid.clone()], 1.0, true)?;
    let consumer_key = sample_key("/ws", b"consume\0");
    let visible = vec![mid.clone()];
    let consumer = run_job(&mut db, &consumer_key, &visible, &[mid.clone()], &[fin], 1.0, true)?;

    assert_eq!(
        db.job_edges()?,
        vec![JobEdge {
            user: consumer,
            used: producer
        }]
    );
    assert_eq!(
        db.file_dependencies()?,
        vec![FileDependency {
            writer: producer,
            reader: consumer
        }]
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

/// The version-6 shape: no runner_status anywhere, versions recorded only in
/// the legacy schema table.
fn build_v6_db(path: &PathBuf) -> Result<()> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(
        r#"
        create table entropy(row_id integer primary key autoincrement, seed integer not null);
        insert into entropy(seed) values(12345);
        create table schema(version integer primary key);
        insert into schema(version) values(6);
        create table runs(run_id integer primary key autoincrement, time integer not null, cmdline text not null);
        insert into runs(time, cmdline) values(1000, 'kiln build');
        create table files(file_id integer primary key, path text not null, hash text not null, modified integer not null);
        create unique index filenames on files(path);
        insert into files(path, hash, modified) values('out/a.o', 'aaaa', 5);
        create table stats(
          stat_id integer primary key autoincrement, hashcode integer not null,
          status integer not null, runtime real not null, cputime real not null,
          membytes integer not null, ibytes integer not null, obytes integer not null, pathtime real);
        insert into stats(hashcode, status, runtime, cputime, membytes, ibytes, obytes) values(7, 0, 1.5, 1.2, 100, 10, 20);
        create table jobs(
          job_id integer primary key autoincrement,
          run_id integer not null references runs(run_id),
          use_id integer not null references runs(run_id),
          label text not null, directory text not null,
          commandline blob not null, environment blob not null,
          stdin text not null, signature integer not null, stack blob not null,
          stat_id integer references stats(stat_id),
          starttime integer not null default 0, endtime integer not null default 0,
          keep integer not null default 0, stale integer not null default 0,
          is_atty integer not null default 0);
        insert into jobs(run_id, use_id, label, directory, commandline, environment, stdin, signature, stack, stat_id, keep)
          values(1, 1, 'compile', '/ws', x'6363', x'00', '', 7, x'00', 1, 1);
        create table filetree(
          tree_id integer primary key autoincrement, access integer not null,
          job_id integer not null references jobs(job_id) on delete cascade,
          file_id integer not null references files(file_id),
          unique(job_id, access, file_id) on conflict ignore);
        insert into filetree(access, job_id, file_id) values(2, 1, 1);
        create table log(
          log_id integer primary key autoincrement,
          job_id integer not null references jobs(job_id) on delete cascade,
          descriptor integer not null, seconds real not null, output text not null);
        create table tags(job_id integer not null references jobs(job_id) on delete cascade,
          uri text, content text, unique(job_id, uri) on conflict replace);
        create table unhashed_files(unhashed_file_id integer primary key autoincrement,
          job_id integer not null references jobs(job_id) on delete cascade, path text not null);
        "#,
    )?;
    Ok(())
}

#[test]
fn migrates_a_v6_database_to_current() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");
    build_v6_db(&path)?;

    let outcome = migrate_database(&path)?;
    assert_eq!(
        outcome,
        MigrationOutcome::Migrated {
            from: 6,
            to: schema::SCHEMA_VERSION
        }
    );
    assert!(temp.path().join("kiln.db.backup").exists());

    let conn = rusqlite::Connection::open(&path)?;
    let user_version: i64 = conn.query_row("pragma user_version", [], |r| r.get(0))?;
    assert_eq!(user_version, schema::SCHEMA_VERSION);

    // Data survived and the widened column defaulted to success.
    let (label, status): (String, Option<String>) = conn.query_row(
        "select label, runner_status from jobs where job_id=1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    assert_eq!(label, "compile");
    assert_eq!(status, None);
    let tree_count: i64 = conn.query_row("select count(*) from filetree", [], |r| r.get(0))?;
    assert_eq!(tree_count, 1);
    drop(conn);

    // The migrated file opens as a current database.
    let _db = file_db(&path)?;
    Ok(())
}

#[test]
fn migration_rewrites_integer_runner_statuses() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");
    build_v6_db(&path)?;
    {
        // Hand-advance to v8: integer runner_status plus its old index.
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch(
            "alter table jobs add column runner_status integer not null default 0; \
             create index runner_status_idx on jobs(runner_status) where runner_status <> 0; \
             insert into jobs(run_id, use_id, label, directory, commandline, environment, stdin, signature, stack, keep, runner_status) \
               values(1, 1, 'failed', '/ws', x'6364', x'00', '', 8, x'00', 1, 137); \
             delete from schema; insert into schema(version) values(8);",
        )?;
    }

    let outcome = migrate_database(&path)?;
    assert_eq!(
        outcome,
        MigrationOutcome::Migrated {
            from: 8,
            to: schema::SCHEMA_VERSION
        }
    );

    let conn = rusqlite::Connection::open(&path)?;
    let ok_status: Option<String> = conn.query_row(
        "select runner_status from jobs where label='compile'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(ok_status, None);
    let failed_status: Option<String> = conn.query_row(
        "select runner_status from jobs where label='failed'",
        [],
        |r| r.get(0),
    )?;
    assert_eq!(failed_status.as_deref(), Some("Numeric return code 137"));
    Ok(())
}

#[test]
fn migration_is_idempotent() -> Result<()> {
    let temp = tempdir()?;
    let path = temp.path().join("kiln.db");
    build_v6_db(&path)?;

    migrate_database(&path)?;
    let after_first = fs::read(&path)?;

    let outcome = migrate_database(&path)?;
    assert_eq!(
        outcome,
        MigrationOutcome::AlreadyCurrent {
            version: schema::SCHEMA_VERSION
        }
    );
    assert_eq!(
        fs::read(&path)?,
        after_first,
        "a second run must leave the file byte-identical"
    );
    Ok(())
}

#[test]
fn migration_refuses_downgrades_and_ancient_versions() -> Result<()> {
    let temp = tempdir()?;

    let newer = temp.path().join("newer.db");
    {
        let _db = file_db(&newer)?;
        let conn = rusqlite::Connection::open(&newer)?;
        conn.pragma_update(None, "user_version", 99)?;
    }
    assert!(matches!(
        migrate_database(&newer),
        Err(DbError::DowngradeRefused { found: 99, .. })
    ));

    let ancient = temp.path().join("ancient.db");
    {
        let conn = rusqlite::Connection::open(&ancient)?;
        conn.execute_batch(
            "create table schema(version integer primary key); insert into schema(version) values(3);",
        )?;
    }
    assert!(matches!(
        migrate_database(&ancient),
        Err(DbError::UnsupportedVersion(3))
    ));
    Ok(())
}
