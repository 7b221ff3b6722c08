//! Atomic ingestion of staged job outputs.
//!
//! Runners leave produced artifacts in a staging area; the evaluator then
//! submits each as a staged item — a file, a symlink, or a directory — and
//! this module moves it into the workspace through the blob store. Files are
//! stored before they are materialized, and the stored hash must match the
//! hash the runner reported, so a mismatch never produces a user-visible
//! side effect.

use std::ffi::CString;
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::hash::{ContentHash, HashError};
use crate::store::{Cas, CasError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("staged file {path} hashed to {actual} but {expected} was expected")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("unknown staged item kind {0:?}")]
    UnknownKind(String),
    #[error(transparent)]
    InvalidHash(#[from] HashError),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: impl Into<String>, source: io::Error) -> IngestError {
    IngestError::Io {
        context: context.into(),
        source,
    }
}

/// What a staged item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    File,
    Symlink,
    Directory,
}

impl FromStr for StagedKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "symlink" => Ok(Self::Symlink),
            "directory" => Ok(Self::Directory),
            other => Err(IngestError::UnknownKind(other.to_string())),
        }
    }
}

/// One staged item as presented by the evaluator.
///
/// `payload` is the staging file path for files, the link target for
/// symlinks, and unused for directories. `expected_hash` and the mtime pair
/// only apply to files; `mode` applies to files and directories.
#[derive(Debug, Clone)]
pub struct StagedItem<'a> {
    pub dest: &'a Path,
    pub kind: StagedKind,
    pub payload: &'a str,
    pub expected_hash: &'a str,
    pub mode: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

fn create_parents(dest: &Path) -> Result<(), IngestError> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .map_err(|e| {
                    io_err(
                        format!("failed to create parent directories for {}", dest.display()),
                        e,
                    )
                })?;
        }
    }
    Ok(())
}

/// mkdir that carries exactly `mode`, not `mode` filtered by the umask.
fn make_dir(dest: &Path, mode: u32) -> Result<(), IngestError> {
    DirBuilder::new()
        .mode(mode)
        .create(dest)
        .and_then(|()| fs::set_permissions(dest, Permissions::from_mode(mode)))
        .map_err(|e| io_err(format!("failed to create directory {}", dest.display()), e))
}

/// Set a path's mtime, leaving atime untouched.
fn set_mtime(path: &Path, sec: i64, nsec: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Atomically move one staged item to its final workspace path.
///
/// Files travel through the blob store: store, verify the hash the runner
/// reported, materialize, restamp the recorded mtime, drop the staging copy.
/// The mtime stamp and the staging unlink are advisory; their failure is
/// logged and suppressed because the workspace content is already correct.
pub fn ingest(cas: &Cas, item: &StagedItem<'_>) -> Result<(), IngestError> {
    create_parents(item.dest)?;

    match item.kind {
        StagedKind::File => {
            let staging_path = Path::new(item.payload);
            let actual = cas.store_blob_from_file(staging_path)?;
            let expected = ContentHash::from_hex(item.expected_hash)?;
            if actual != expected {
                return Err(IngestError::HashMismatch {
                    path: staging_path.display().to_string(),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }

            cas.materialize_blob(&actual, item.dest, item.mode)?;

            if let Err(err) = set_mtime(item.dest, item.mtime_sec, item.mtime_nsec) {
                warn!(dest = %item.dest.display(), %err, "failed to set timestamps");
            }
            if let Err(err) = fs::remove_file(staging_path) {
                warn!(staging = %staging_path.display(), %err, "failed to delete staging file");
            }
        }
        StagedKind::Symlink => {
            let _ = fs::remove_file(item.dest);
            symlink(item.payload, item.dest).map_err(|e| {
                io_err(
                    format!(
                        "failed to create symlink {} -> {}",
                        item.dest.display(),
                        item.payload
                    ),
                    e,
                )
            })?;
        }
        StagedKind::Directory => {
            let mode = item.mode & 0o7777;
            match fs::metadata(item.dest) {
                Ok(meta) if meta.is_dir() => {
                    fs::set_permissions(item.dest, Permissions::from_mode(mode)).map_err(|e| {
                        io_err(format!("failed to chmod {}", item.dest.display()), e)
                    })?;
                }
                Ok(_) => {
                    let _ = fs::remove_file(item.dest);
                    make_dir(item.dest, mode)?;
                }
                Err(_) => {
                    make_dir(item.dest, mode)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CasOptions;
    use anyhow::Result;
    use tempfile::tempdir;

    fn new_cas(temp: &tempfile::TempDir) -> Result<Cas> {
        Ok(Cas::open(&temp.path().join("cas"), CasOptions::default())?)
    }

    #[test]
    fn file_ingest_materializes_and_cleans_staging() -> Result<()> {
        let temp = tempdir()?;
        let cas = new_cas(&temp)?;
        let staging = temp.path().join("stage/out.txt");
        fs::create_dir_all(staging.parent().unwrap())?;
        fs::write(&staging, b"produced")?;
        let expected = ContentHash::from_bytes(b"produced").to_hex();

        let dest = temp.path().join("ws/sub/out.txt");
        ingest(
            &cas,
            &StagedItem {
                dest: &dest,
                kind: StagedKind::File,
                payload: staging.to_str().unwrap(),
                expected_hash: &expected,
                mode: 0o640,
                mtime_sec: 1_500_000_000,
                mtime_nsec: 42,
            },
        )?;

        assert_eq!(fs::read(&dest)?, b"produced");
        assert_eq!(fs::metadata(&dest)?.permissions().mode() & 0o7777, 0o640);
        assert!(!staging.exists(), "staging file should be consumed");

        let mtime = fs::metadata(&dest)?.modified()?;
        let secs = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_500_000_000);
        Ok(())
    }

    #[test]
    fn hash_mismatch_rejects_without_touching_dest() -> Result<()> {
        let temp = tempdir()?;
        let cas = new_cas(&temp)?;
        let staging = temp.path().join("s");
        fs::write(&staging, b"B")?;
        let expected = ContentHash::from_bytes(b"A").to_hex();
        let actual = ContentHash::from_bytes(b"B").to_hex();

        let dest = temp.path().join("ws/out");
        let err = ingest(
            &cas,
            &StagedItem {
                dest: &dest,
                kind: StagedKind::File,
                payload: staging.to_str().unwrap(),
                expected_hash: &expected,
                mode: 0o644,
                mtime_sec: 0,
                mtime_nsec: 0,
            },
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains(&expected), "error should name the expected hash");
        assert!(message.contains(&actual), "error should name the actual hash");
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn symlink_ingest_replaces_existing_entries() -> Result<()> {
        let temp = tempdir()?;
        let cas = new_cas(&temp)?;
        let dest = temp.path().join("ws/link");
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, b"old file")?;

        ingest(
            &cas,
            &StagedItem {
                dest: &dest,
                kind: StagedKind::Symlink,
                payload: "target/elsewhere",
                expected_hash: "",
                mode: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
            },
        )?;

        assert_eq!(fs::read_link(&dest)?, Path::new("target/elsewhere"));
        Ok(())
    }

    #[test]
    fn directory_ingest_creates_and_rechmods() -> Result<()> {
        let temp = tempdir()?;
        let cas = new_cas(&temp)?;
        let dest = temp.path().join("ws/dir");

        let item = StagedItem {
            dest: &dest,
            kind: StagedKind::Directory,
            payload: "",
            expected_hash: "",
            mode: 0o750,
            mtime_sec: 0,
            mtime_nsec: 0,
        };
        ingest(&cas, &item)?;
        assert!(dest.is_dir());
        assert_eq!(fs::metadata(&dest)?.permissions().mode() & 0o7777, 0o750);

        // A second ingest of an existing directory only adjusts the mode.
        let relaxed = StagedItem { mode: 0o755, ..item };
        ingest(&cas, &relaxed)?;
        assert_eq!(fs::metadata(&dest)?.permissions().mode() & 0o7777, 0o755);
        Ok(())
    }

    #[test]
    fn directory_ingest_replaces_plain_files() -> Result<()> {
        let temp = tempdir()?;
        let cas = new_cas(&temp)?;
        let dest = temp.path().join("ws/entry");
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, b"was a file")?;

        ingest(
            &cas,
            &StagedItem {
                dest: &dest,
                kind: StagedKind::Directory,
                payload: "",
                expected_hash: "",
                mode: 0o755,
                mtime_sec: 0,
                mtime_nsec: 0,
            },
        )?;
        assert!(dest.is_dir());
        Ok(())
    }

    #[test]
    fn kind_strings_parse() {
        assert_eq!("file".parse::<StagedKind>().unwrap(), StagedKind::File);
        assert_eq!("symlink".parse::<StagedKind>().unwrap(), StagedKind::Symlink);
        assert_eq!(
            "directory".parse::<StagedKind>().unwrap(),
            StagedKind::Directory
        );
        assert!(matches!(
            "hardlink".parse::<StagedKind>(),
            Err(IngestError::UnknownKind(_))
        ));
    }
}
