//! Content-addressable blob store.
//!
//! Blobs live at `{root}/{blobs}/{xx}/{yy…}` where `xx` is the first two hex
//! characters of the content hash and `yy…` the remaining 62. Writers never
//! take locks: every insert goes through a uniquely-named file in the staging
//! subdirectory and becomes visible in one atomic `rename`. Concurrent
//! inserters of the same content race for the rename; the loser collapses
//! into the already-exists short-circuit on its next attempt.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::fscopy::reflink_or_copy_file;
use crate::hash::{ContentHash, HashError};

pub mod share;

/// Errors surfaced by the blob store.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("blob not found")]
    NotFound,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("stored blob {hash} is corrupt (content hashes to {actual})")]
    CorruptedData { hash: String, actual: String },
    #[error("blob already exists")]
    AlreadyExists,
    #[error(transparent)]
    InvalidHash(#[from] HashError),
}

fn io_err(context: impl Into<String>, source: io::Error) -> CasError {
    CasError::Io {
        context: context.into(),
        source,
    }
}

/// Store layout knobs. Explicit fields on purpose; the on-disk layout is an
/// interface other tools depend on.
#[derive(Debug, Clone)]
pub struct CasOptions {
    pub blobs_subdir: String,
    pub staging_subdir: String,
}

impl Default for CasOptions {
    fn default() -> Self {
        Self {
            blobs_subdir: "blobs".to_string(),
            staging_subdir: "staging".to_string(),
        }
    }
}

/// Handle to a blob store root. Cheap to clone; carries no state beyond the
/// resolved paths, so handles may be shared freely across threads.
#[derive(Debug, Clone)]
pub struct Cas {
    root: PathBuf,
    blobs_dir: PathBuf,
    staging_dir: PathBuf,
}

/// Staged files are named `{base}.{pid}.{seq}`. The pid isolates concurrent
/// processes; the per-process counter isolates threads staging identical
/// content.
fn staging_file_name(base: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{base}.{}.{seq}", std::process::id())
}

impl Cas {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path, options: CasOptions) -> Result<Self, CasError> {
        let blobs_dir = root.join(&options.blobs_subdir);
        let staging_dir = root.join(&options.staging_subdir);
        fs::create_dir_all(&blobs_dir)
            .map_err(|e| io_err(format!("failed to create {}", blobs_dir.display()), e))?;
        fs::create_dir_all(&staging_dir)
            .map_err(|e| io_err(format!("failed to create {}", staging_dir.display()), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            blobs_dir,
            staging_dir,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final on-disk location of a blob, whether or not it exists yet.
    #[must_use]
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.blobs_dir.join(hash.prefix()).join(hash.suffix())
    }

    #[must_use]
    pub fn has_blob(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).exists()
    }

    fn ensure_shard_dir(&self, hash: &ContentHash) -> Result<(), CasError> {
        let shard = self.blobs_dir.join(hash.prefix());
        fs::create_dir_all(&shard)
            .map_err(|e| io_err(format!("failed to create shard {}", shard.display()), e))
    }

    /// Insert a file's content, preserving its permission bits.
    ///
    /// The source is first copied into the staging area, hashed there, and
    /// renamed into its final location. Returns the content hash whether the
    /// blob was inserted or already present.
    pub fn store_blob_from_file(&self, path: &Path) -> Result<ContentHash, CasError> {
        let meta = fs::metadata(path)
            .map_err(|e| io_err(format!("failed to stat {}", path.display()), e))?;
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };

        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        let temp = self.staging_dir.join(staging_file_name(&base));

        if let Err(e) = reflink_or_copy_file(path, &temp, mode) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(format!("failed to stage {}", path.display()), e));
        }

        // Hash what was actually staged, not the (possibly changing) source.
        let hash = match ContentHash::from_file(&temp) {
            Ok(hash) => hash,
            Err(err) => {
                let _ = fs::remove_file(&temp);
                return Err(err.into());
            }
        };

        let dest = self.blob_path(&hash);
        if dest.exists() {
            let _ = fs::remove_file(&temp);
            debug!(%hash, "blob already stored");
            return Ok(hash);
        }

        if let Err(err) = self.ensure_shard_dir(&hash) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }

        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(
                format!("failed to move blob into place at {}", dest.display()),
                e,
            ));
        }
        debug!(%hash, "blob stored");
        Ok(hash)
    }

    /// Insert an in-memory byte sequence.
    pub fn store_blob(&self, data: &[u8]) -> Result<ContentHash, CasError> {
        let hash = ContentHash::from_bytes(data);
        let dest = self.blob_path(&hash);
        if dest.exists() {
            debug!(%hash, "blob already stored");
            return Ok(hash);
        }

        self.ensure_shard_dir(&hash)?;

        let temp = self.staging_dir.join(staging_file_name(&hash.to_hex()));
        let write_result = File::create(&temp).and_then(|mut file| file.write_all(data));
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp);
            return Err(io_err(format!("failed to write {}", temp.display()), e));
        }

        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(
                format!("failed to move blob into place at {}", dest.display()),
                e,
            ));
        }
        debug!(%hash, "blob stored");
        Ok(hash)
    }

    /// Read a blob's bytes.
    pub fn read_blob(&self, hash: &ContentHash) -> Result<Vec<u8>, CasError> {
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound),
            Err(e) => Err(io_err(format!("failed to read blob {}", path.display()), e)),
        }
    }

    /// Materialize a blob into `dest_path` with the given permission bits.
    ///
    /// Parent directories are created as needed. The copy lands in a
    /// per-process temp name next to the destination and is renamed over it,
    /// so repeated materializations of the same destination are
    /// last-writer-wins and never expose a partial file.
    pub fn materialize_blob(
        &self,
        hash: &ContentHash,
        dest_path: &Path,
        mode: u32,
    ) -> Result<(), CasError> {
        let src = self.blob_path(hash);
        if !src.exists() {
            return Err(CasError::NotFound);
        }

        if let Some(parent) = dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| io_err(format!("failed to create {}", parent.display()), e))?;
            }
        }

        let temp = PathBuf::from(staging_file_name(&dest_path.display().to_string()));
        if let Err(e) = reflink_or_copy_file(&src, &temp, mode) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(
                format!("failed to materialize blob {hash} to {}", dest_path.display()),
                e,
            ));
        }

        if let Err(e) = fs::rename(&temp, dest_path) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(
                format!("failed to move {} into place", dest_path.display()),
                e,
            ));
        }
        Ok(())
    }

    /// Recompute a stored blob's hash and compare it against its name.
    ///
    /// Corruption is reported, never repaired; the blob stays in place for
    /// the operator to inspect.
    pub fn verify_blob(&self, hash: &ContentHash) -> Result<(), CasError> {
        let path = self.blob_path(hash);
        if !path.exists() {
            return Err(CasError::NotFound);
        }
        let actual = ContentHash::from_file(&path)?;
        if actual != *hash {
            return Err(CasError::CorruptedData {
                hash: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}
