//! Reflink-first file copy.
//!
//! Materializing a blob should share storage with the store whenever the
//! filesystem allows it. The chain is: copy-on-write clone (FICLONE), then an
//! in-kernel range copy, then sendfile, then a userspace read/write loop.
//! Hardlinks are never used: a workspace file sharing an inode with a blob
//! would let a later `chmod` on the workspace file mutate the stored blob.
//!
//! Every failure path unlinks the partially-written destination and returns
//! an [`io::Error`] carrying the originating errno.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Which strategy produced the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Copy-on-write clone; no bytes were physically copied.
    Reflink,
    /// Full data copy (kernel range copy, sendfile, or read/write loop).
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyOutcome {
    pub strategy: CopyStrategy,
    /// Bytes physically copied; 0 for a reflink.
    pub bytes_copied: u64,
}

fn open_excl(dst: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(dst)?;
    // The open mode is filtered by the umask; the destination must carry
    // exactly the bits the caller asked for.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn try_reflink(src: &Path, dst: &Path, mode: u32) -> io::Result<()> {
    let src_file = File::open(src)?;
    let dst_file = open_excl(dst, mode)?;
    let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), libc::FICLONE, src_file.as_raw_fd()) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        drop(dst_file);
        let _ = fs::remove_file(dst);
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn try_reflink(_src: &Path, _dst: &Path, _mode: u32) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
}

fn reflink_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) | Some(libc::EXDEV)
    )
}

/// Copy the remaining contents of `src` to `dst` with a 64 KiB buffer,
/// starting from the files' current offsets.
fn copy_read_write(src: &File, dst: &File) -> io::Result<u64> {
    let mut reader = src;
    let mut writer = dst;
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
        copied += read as u64;
    }
    Ok(copied)
}

#[cfg(target_os = "linux")]
fn copy_contents(src: &File, dst: &File) -> io::Result<u64> {
    let len = src.metadata()?.len();
    let mut copied = 0u64;

    // In-kernel range copy; the file offsets advance with each call so the
    // fallbacks below continue where this left off.
    while copied < len {
        let remaining = (len - copied) as usize;
        let rc = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                std::ptr::null_mut(),
                dst.as_raw_fd(),
                std::ptr::null_mut(),
                remaining,
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EXDEV) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
                | Some(libc::ENOSYS) => break,
                _ => return Err(err),
            }
        } else if rc == 0 {
            break;
        } else {
            copied += rc as u64;
        }
    }
    if copied == len {
        return Ok(copied);
    }

    while copied < len {
        let remaining = (len - copied) as usize;
        let rc = unsafe {
            libc::sendfile(dst.as_raw_fd(), src.as_raw_fd(), std::ptr::null_mut(), remaining)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) => break,
                _ => return Err(err),
            }
        } else if rc == 0 {
            break;
        } else {
            copied += rc as u64;
        }
    }
    if copied == len {
        return Ok(copied);
    }

    Ok(copied + copy_read_write(src, dst)?)
}

#[cfg(not(target_os = "linux"))]
fn copy_contents(src: &File, dst: &File) -> io::Result<u64> {
    copy_read_write(src, dst)
}

fn copy_file_full(src: &Path, dst: &Path, mode: u32) -> io::Result<u64> {
    let src_file = File::open(src)?;
    let dst_file = open_excl(dst, mode)?;
    match copy_contents(&src_file, &dst_file) {
        Ok(copied) => Ok(copied),
        Err(err) => {
            drop(dst_file);
            let _ = fs::remove_file(dst);
            Err(err)
        }
    }
}

/// Create `dst` from `src` with the fastest available strategy.
///
/// `dst` must not exist; it is created with exclusive-create semantics under
/// `mode`. A clone failure falls through to a full copy only when the errno
/// denotes an unsupported operation (`EOPNOTSUPP`, `EINVAL`, `EXDEV`); any
/// other clone error is returned as-is.
pub fn reflink_or_copy_file(src: &Path, dst: &Path, mode: u32) -> io::Result<CopyOutcome> {
    match try_reflink(src, dst, mode) {
        Ok(()) => Ok(CopyOutcome {
            strategy: CopyStrategy::Reflink,
            bytes_copied: 0,
        }),
        Err(err) if reflink_unsupported(&err) => {
            let bytes_copied = copy_file_full(src, dst, mode)?;
            Ok(CopyOutcome {
                strategy: CopyStrategy::Full,
                bytes_copied,
            })
        }
        Err(err) => Err(err),
    }
}
