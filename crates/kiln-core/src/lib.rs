//! Execution and caching core of the kiln build runner.
//!
//! The evaluator hands this crate fully-formed job specifications; the crate
//! decides whether each has a reusable prior result, gates the ones that must
//! run against named resource budgets, records every observable outcome in a
//! per-workspace SQLite database keyed by content hashes, and materializes
//! produced files back into the workspace through a content-addressable blob
//! store with copy-on-write clones where the filesystem supports them.
//!
//! Subsystems:
//! - [`hash`]: 256-bit content hashes and their hex codec.
//! - [`fscopy`]: reflink-first file copy with a full-copy fallback.
//! - [`store`]: the sharded, rename-atomic blob store, plus the shared
//!   local job cache in [`store::share`].
//! - [`resource`]: named counting budgets for job admission.
//! - [`db`]: the job cache database, its schema, and schema migration.
//! - [`ingest`]: atomic movement of staged artifacts into the workspace.
//! - [`daemon`]: lifecycle supervision of the workspace FUSE daemon.

pub mod daemon;
pub mod db;
pub mod fscopy;
pub mod hash;
pub mod ingest;
pub mod resource;
pub mod store;

pub use daemon::{DaemonError, FuseDaemonSupervisor};
pub use db::{DbError, JobCacheDb, JobKey, ReusedJob, Usage};
pub use fscopy::{reflink_or_copy_file, CopyOutcome, CopyStrategy};
pub use hash::{ContentHash, HashError};
pub use ingest::{ingest, IngestError, StagedItem, StagedKind};
pub use resource::{parse_resources_json, ResourceLimits, ResourceManager, ResourceRequirement};
pub use store::{Cas, CasError, CasOptions};
