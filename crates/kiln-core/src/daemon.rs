//! Lifecycle supervision of the workspace FUSE daemon.
//!
//! Builds observe job file accesses through a FUSE mount at
//! `{workspace}/.fuse/{uid}.{gid}`. The daemon owning that mount is shared by
//! every concurrent build of the workspace and refcounts its clients through
//! open descriptors on a marker file: as long as at least one client holds
//! the marker open, the daemon stays mounted, and it lingers a while after
//! the last one disconnects so back-to-back builds reuse the mount.
//!
//! The supervisor here either adopts a running daemon (marker openable) or
//! spawns one and polls the marker with exponential backoff.

use std::ffi::CString;
use std::fs::{DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execve, fork, getgid, getuid, ForkResult};
use tracing::debug;

const MARKER_FILE: &str = ".f.fuse-kilnd";
const DAEMON_ARGV0: &str = "fuse-kilnd";
/// Seconds the daemon lingers after its last client disconnects.
const DEFAULT_LINGER_SECS: u64 = 60;
const DEBUG_ENV: &str = "KILN_FUSE_DEBUG";

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to fork the daemon launcher: {0}")]
    Fork(nix::Error),
    #[error("could not start or contact the FUSE daemon after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

/// Reconnect policy: how often and how patiently to poll the marker file
/// after spawning the daemon.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            initial_delay: Duration::from_millis(10),
        }
    }
}

/// Keeps one FUSE daemon alive for the duration of a build.
///
/// The held marker descriptor is the liveness lease; dropping the supervisor
/// (or calling [`release`](Self::release)) tells the daemon this client is
/// done.
#[derive(Debug)]
pub struct FuseDaemonSupervisor {
    mount_path: PathBuf,
    marker_path: PathBuf,
    executable: PathBuf,
    retry: RetryPolicy,
    lease: Option<File>,
}

fn default_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map(|dir| dir.join("../lib/kiln").join(DAEMON_ARGV0))
        .unwrap_or_else(|| PathBuf::from(DAEMON_ARGV0))
}

impl FuseDaemonSupervisor {
    #[must_use]
    pub fn new(workspace: &Path) -> Self {
        let mount_path = workspace
            .join(".fuse")
            .join(format!("{}.{}", getuid(), getgid()));
        let marker_path = mount_path.join(MARKER_FILE);
        Self {
            mount_path,
            marker_path,
            executable: default_executable(),
            retry: RetryPolicy::default(),
            lease: None,
        }
    }

    /// Override the daemon binary (used by hosts with relocated installs and
    /// by tests).
    #[must_use]
    pub fn with_executable(mut self, executable: PathBuf) -> Self {
        self.executable = executable;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Whether a daemon currently owns the mount. Only the marker file
    /// answers this; a stale directory without a marker means no daemon.
    #[must_use]
    pub fn is_daemon_alive(&self) -> bool {
        File::open(&self.marker_path).is_ok()
    }

    /// Ensure a daemon owns the mount and take a liveness lease on it.
    ///
    /// Must be called before worker threads exist: spawning forks this
    /// process, and forking a multi-threaded process only duplicates the
    /// calling thread.
    pub fn ensure_daemon_running(&mut self) -> Result<(), DaemonError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(&self.mount_path)
            .map_err(|e| DaemonError::Io {
                context: format!("failed to create mount path {}", self.mount_path.display()),
                source: e,
            })?;

        if let Ok(marker) = File::open(&self.marker_path) {
            debug!(mount = %self.mount_path.display(), "daemon already running");
            self.lease = Some(marker);
            return Ok(());
        }

        let mut delay = self.retry.initial_delay;
        for _ in 0..self.retry.attempts {
            self.spawn_daemon()?;
            std::thread::sleep(delay);

            if let Ok(marker) = File::open(&self.marker_path) {
                debug!(mount = %self.mount_path.display(), "daemon started");
                self.lease = Some(marker);
                return Ok(());
            }
            delay *= 2;
        }

        Err(DaemonError::Unreachable {
            attempts: self.retry.attempts,
        })
    }

    /// Drop the liveness lease. The daemon exits after its linger timeout
    /// once every client has released.
    pub fn release(&mut self) {
        self.lease = None;
    }

    fn spawn_daemon(&self) -> Result<(), DaemonError> {
        let to_cstring = |s: String, what: &str| {
            CString::new(s).map_err(|_| DaemonError::Io {
                context: format!("{what} contains a NUL byte"),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })
        };

        let exe = to_cstring(self.executable.display().to_string(), "daemon path")?;
        let args = [
            CString::new(DAEMON_ARGV0).expect("static argv0"),
            to_cstring(self.mount_path.display().to_string(), "mount path")?,
            to_cstring(DEFAULT_LINGER_SECS.to_string(), "linger")?,
        ];

        // The daemon gets a minimal environment.
        let mut env = vec![CString::new("PATH=/usr/bin:/bin:/usr/sbin:/sbin").expect("static env")];
        if std::env::var_os(DEBUG_ENV).is_some() {
            env.push(CString::new(format!("{DEBUG_ENV}=1")).expect("static env"));
        }

        match unsafe { fork() }.map_err(DaemonError::Fork)? {
            ForkResult::Child => {
                let _ = execve(&exe, &args, &env);
                // Exec failed; nothing sensible left to do in the child.
                unsafe { libc::_exit(1) }
            }
            ForkResult::Parent { child } => {
                // The daemon double-forks internally; reap the intermediate
                // child here.
                loop {
                    match waitpid(child, None) {
                        Ok(WaitStatus::Stopped(_, _)) => continue,
                        _ => break,
                    }
                }
                Ok(())
            }
        }
    }
}
