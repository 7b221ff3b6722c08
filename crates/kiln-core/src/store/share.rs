//! Shared local job cache.
//!
//! When `KILN_LOCAL_JOB_CACHE` points at a directory, builds on the same
//! machine exchange job results through a blob store rooted at
//! `{dir}/cas`. These helpers wrap the store with job-cache level errors and
//! derive a combined tree hash over a job's produced files, so a whole output
//! set can be keyed by one hash.

use std::env;
use std::path::{Path, PathBuf};

use crate::hash::ContentHash;
use crate::store::{Cas, CasError, CasOptions};

pub const LOCAL_JOB_CACHE_ENV: &str = "KILN_LOCAL_JOB_CACHE";

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("failed to store {path} in the job cache: {source}")]
    BlobStoreFailed {
        path: String,
        #[source]
        source: CasError,
    },
    #[error("failed to read blob {hash} from the job cache: {source}")]
    BlobReadFailed {
        hash: String,
        #[source]
        source: CasError,
    },
    #[error("failed to materialize {path} from the job cache: {source}")]
    MaterializeFailed {
        path: String,
        #[source]
        source: CasError,
    },
    #[error("blob {0} is not in the job cache")]
    FileNotFound(String),
}

/// A job's stored output set.
#[derive(Debug, Clone)]
pub struct JobOutputs {
    /// Workspace-relative path and content hash of each produced file.
    pub files: Vec<(String, ContentHash)>,
    /// Combined hash over the whole set, stable under identical contents.
    pub tree_hash: ContentHash,
}

/// Blob store root of the shared cache, if one is configured.
#[must_use]
pub fn local_cache_root() -> Option<PathBuf> {
    env::var_os(LOCAL_JOB_CACHE_ENV).map(|dir| PathBuf::from(dir).join("cas"))
}

/// Open the shared cache named by the environment, if configured.
pub fn open_local_cache() -> Result<Option<Cas>, CasError> {
    match local_cache_root() {
        Some(root) => Cas::open(&root, CasOptions::default()).map(Some),
        None => Ok(None),
    }
}

/// Store every produced file and derive the set's tree hash.
///
/// `files` pairs an on-disk source with its workspace-relative path. The tree
/// hash is computed over `relative:hex` lines in input order, so callers
/// should present files in a canonical order.
pub fn store_output_files(
    cas: &Cas,
    files: &[(PathBuf, String)],
) -> Result<JobOutputs, ShareError> {
    let mut stored = Vec::with_capacity(files.len());
    let mut combined = String::new();

    for (source, relative) in files {
        let hash =
            cas.store_blob_from_file(source)
                .map_err(|source| ShareError::BlobStoreFailed {
                    path: relative.clone(),
                    source,
                })?;
        combined.push_str(relative);
        combined.push(':');
        combined.push_str(&hash.to_hex());
        combined.push('\n');
        stored.push((relative.clone(), hash));
    }

    Ok(JobOutputs {
        files: stored,
        tree_hash: ContentHash::from_string(&combined),
    })
}

/// Materialize one cached output into the workspace.
pub fn materialize_output(
    cas: &Cas,
    hash: &ContentHash,
    dest: &Path,
    mode: u32,
) -> Result<(), ShareError> {
    cas.materialize_blob(hash, dest, mode)
        .map_err(|source| match source {
            CasError::NotFound => ShareError::FileNotFound(hash.to_hex()),
            source => ShareError::MaterializeFailed {
                path: dest.display().to_string(),
                source,
            },
        })
}

/// Read one cached output's bytes.
pub fn read_output(cas: &Cas, hash: &ContentHash) -> Result<Vec<u8>, ShareError> {
    cas.read_blob(hash).map_err(|source| match source {
        CasError::NotFound => ShareError::FileNotFound(hash.to_hex()),
        source => ShareError::BlobReadFailed {
            hash: hash.to_hex(),
            source,
        },
    })
}
